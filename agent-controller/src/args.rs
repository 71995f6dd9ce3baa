use anyhow::{bail, Result};
use clap::Parser;
use interpose_agent_controller_core::AGENTS_CONFIGMAP_NAME;
use interpose_agent_controller_k8s_api::{self as k8s, watcher};
use interpose_agent_controller_k8s_index::{
    regenerate_agent_maps, ConfigMapIndex, Controller, ControllerConfig, Reconciler,
    ServiceController, ServiceIndex, TemplateGenerator,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, info_span, Instrument};

/// Entry events buffered between the ConfigMap watch and the dispatcher.
const EVENT_BUFFER: usize = 128;

#[derive(Debug, Parser)]
#[clap(name = "agent-controller", about = "Reconciles interpose agent configs")]
pub struct Args {
    #[clap(
        long,
        default_value = "interpose=info,warn",
        env = "INTERPOSE_AGENT_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespaces to manage. When empty the whole cluster is watched.
    #[clap(long, value_delimiter = ',')]
    managed_namespaces: Vec<String>,

    /// Image reference for injected agent containers.
    #[clap(long, env = "INTERPOSE_AGENT_IMAGE")]
    agent_image: Option<String>,

    /// Prefix for controller-owned annotation keys.
    #[clap(long, default_value = "interpose.io/")]
    domain_prefix: String,

    /// Name of the per-namespace agents ConfigMap.
    #[clap(long, default_value = AGENTS_CONFIGMAP_NAME)]
    agent_configmap: String,

    /// Regenerate all agent ConfigMap entries and exit.
    #[clap(long)]
    regenerate: bool,
}

impl Args {
    pub async fn run(self) -> Result<()> {
        let config = Arc::new(ControllerConfig {
            namespaces: self.managed_namespaces.clone(),
            agent_image: self.agent_image.clone(),
            domain_prefix: self.domain_prefix.clone(),
            configmap_name: self.agent_configmap.clone(),
        });

        if self.regenerate {
            self.log_format
                .try_init(self.log_level)
                .expect("must configure logging");
            let client = kube::Client::try_default().await?;
            let generator = TemplateGenerator::new(client.clone(), config.clone());
            return regenerate_agent_maps(&client, &config, &*generator).await;
        }

        let mut runtime = kubert::Runtime::builder()
            .with_log(self.log_level, self.log_format)
            .with_admin(self.admin)
            .with_client(self.client)
            .build()
            .await?;
        let client = runtime.client();

        info!(namespaces = ?config.namespaces, "Loading agent ConfigMaps");

        let generator = TemplateGenerator::new(client.clone(), config.clone());
        let (mod_tx, mod_rx) = mpsc::channel(EVENT_BUFFER);
        let (del_tx, del_rx) = mpsc::channel(EVENT_BUFFER);
        let (svc_tx, svc_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let reconciler = Reconciler::new(
            client.clone(),
            config.clone(),
            generator,
            mod_tx,
            del_tx,
            cancel_tx,
        );
        let cm_index = ConfigMapIndex::shared(reconciler.clone());
        let svc_index = ServiceIndex::shared(svc_tx);

        let cm_watch =
            watcher::Config::default().fields(&format!("metadata.name={}", config.configmap_name));
        if config.namespaces.is_empty() {
            let cms = runtime.watch_all::<k8s::ConfigMap>(cm_watch);
            tokio::spawn(
                kubert::index::namespaced(cm_index, cms).instrument(info_span!("configmaps")),
            );

            let svcs = runtime.watch_all::<k8s::Service>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(svc_index, svcs).instrument(info_span!("services")),
            );
        } else {
            for ns in config.namespaces.clone() {
                let cms = runtime.watch_namespaced::<k8s::ConfigMap>(ns.clone(), cm_watch.clone());
                tokio::spawn(
                    kubert::index::namespaced(cm_index.clone(), cms)
                        .instrument(info_span!("configmaps", %ns)),
                );

                let svcs = runtime.watch_namespaced::<k8s::Service>(ns.clone(), watcher::Config::default());
                tokio::spawn(
                    kubert::index::namespaced(svc_index.clone(), svcs)
                        .instrument(info_span!("services", %ns)),
                );
            }
        }

        let controller = Controller::new(reconciler.clone(), mod_rx, del_rx, cancel_rx.clone());
        tokio::spawn(controller.run().instrument(info_span!("dispatcher")));

        let svc_controller = ServiceController::new(reconciler, svc_rx, cancel_rx);
        tokio::spawn(svc_controller.run().instrument(info_span!("service-events")));

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("aborted");
        }
        Ok(())
    }
}
