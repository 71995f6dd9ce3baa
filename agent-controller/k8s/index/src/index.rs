use crate::{
    generate::Generator,
    rollout::Rollout,
    snapshot::{Entry, Snapshot},
    updater::ConfigUpdater,
    workload::Workload,
    ControllerConfig,
};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use interpose_agent_controller_core::{self as agent, SidecarConfig};
use interpose_agent_controller_k8s_api::{
    self as k8s, is_not_found, Api, Client, DeleteParams, ResourceExt,
};
use parking_lot::{Mutex, RwLock};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

pub type SharedConfigMapIndex = Arc<RwLock<ConfigMapIndex>>;

/// Replaceable reactions to dispatched entry events.
///
/// An outer layer that embeds the reconciler injects its own implementation
/// via [`Reconciler::set_hooks`]; the default performs rollouts.
#[async_trait::async_trait]
pub trait Hooks: Send + Sync {
    async fn on_add(&self, workload: &Workload, config: &SidecarConfig) -> Result<()>;

    async fn on_delete(&self, name: &str, namespace: &str) -> Result<()>;
}

/// Default hooks: an added or changed entry rolls the workload toward its
/// config; deletions are left to the dispatcher, which issues the no-agent
/// rollout itself.
pub struct RolloutHooks(Rollout);

impl RolloutHooks {
    pub fn new(rollout: Rollout) -> Self {
        Self(rollout)
    }
}

#[async_trait::async_trait]
impl Hooks for RolloutHooks {
    async fn on_add(&self, workload: &Workload, config: &SidecarConfig) -> Result<()> {
        self.0.trigger(workload, Some(config)).await;
        Ok(())
    }

    async fn on_delete(&self, _name: &str, _namespace: &str) -> Result<()> {
        Ok(())
    }
}

/// The agent-configuration reconciler.
///
/// A cheaply clonable handle over the snapshot of observed ConfigMap state,
/// the per-namespace update coalescer registry, and the channels feeding the
/// dispatcher.
#[derive(Clone)]
pub struct Reconciler {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) client: Client,
    pub(crate) config: Arc<ControllerConfig>,
    pub(crate) generator: Arc<dyn Generator>,
    pub(crate) rollout: Rollout,
    hooks: RwLock<Arc<dyn Hooks>>,

    pub(crate) snapshot: RwLock<Snapshot>,
    pub(crate) updaters: Mutex<HashMap<String, Arc<ConfigUpdater>>>,

    mod_tx: mpsc::Sender<Entry>,
    del_tx: mpsc::Sender<Entry>,
    cancel: watch::Sender<bool>,
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        client: Client,
        config: Arc<ControllerConfig>,
        generator: Arc<dyn Generator>,
        mod_tx: mpsc::Sender<Entry>,
        del_tx: mpsc::Sender<Entry>,
        cancel: watch::Sender<bool>,
    ) -> Self {
        let rollout = Rollout::new(client.clone(), config.clone(), generator.clone());
        let hooks: Arc<dyn Hooks> = Arc::new(RolloutHooks::new(rollout.clone()));
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                generator,
                rollout,
                hooks: RwLock::new(hooks),
                snapshot: RwLock::new(Snapshot::default()),
                updaters: Mutex::new(HashMap::new()),
                mod_tx,
                del_tx,
                cancel,
            }),
        }
    }

    pub fn set_hooks(&self, hooks: Arc<dyn Hooks>) {
        *self.inner.hooks.write() = hooks;
    }

    pub(crate) fn hooks(&self) -> Arc<dyn Hooks> {
        self.inner.hooks.read().clone()
    }

    /// Reads an agent config from the snapshot, decoding on the fly.
    pub fn get(&self, namespace: &str, agent_name: &str) -> Result<Option<SidecarConfig>> {
        let value = self
            .inner
            .snapshot
            .read()
            .get(namespace, agent_name)
            .map(str::to_owned);
        value
            .map(|v| agent::decode(&v))
            .transpose()
            .map_err(Into::into)
    }

    /// Diffs observed ConfigMap data against the snapshot and hands the
    /// resulting entry events to the dispatcher.
    ///
    /// The sends are spawned so the snapshot lock is never held across them.
    pub(crate) fn update(&self, namespace: &str, observed: Option<&BTreeMap<String, String>>) {
        let (dels, mods) = self.inner.snapshot.write().update(namespace, observed);
        if !dels.is_empty() {
            let tx = self.inner.del_tx.clone();
            tokio::spawn(send_entries(tx, dels));
        }
        if !mods.is_empty() {
            let tx = self.inner.mod_tx.clone();
            tokio::spawn(send_entries(tx, mods));
        }
    }

    /// Stops the watchers, rolls the agent out of every known workload, and
    /// deletes the agents ConfigMap in each namespace.
    pub async fn delete_maps_and_rollout_all(&self) {
        // No more updates from the watchers.
        let _ = self.inner.cancel.send(true);

        let data = self.inner.snapshot.read().all_data();
        for (namespace, entries) in data {
            for (name, value) in entries {
                let config = match agent::decode(&value) {
                    Ok(config) => config,
                    Err(error) => {
                        error!(%name, %namespace, %error, "Failed to decode ConfigMap entry");
                        continue;
                    }
                };
                if config.create || config.manual {
                    // Never generated, or user-authored; nothing to roll back.
                    continue;
                }
                let workload = match Workload::get(
                    &self.inner.client,
                    &config.workload_name,
                    &config.namespace,
                    config.workload_kind,
                )
                .await
                {
                    Ok(workload) => workload,
                    Err(err) => {
                        if !is_not_found(&err) {
                            error!(%name, %namespace, error = %err, "Unable to get workload");
                        }
                        continue;
                    }
                };
                self.inner.rollout.trigger(&workload, None).await;
            }

            let api = Api::<k8s::ConfigMap>::namespaced(self.inner.client.clone(), &namespace);
            if let Err(error) = api
                .delete(&self.inner.config.configmap_name, &DeleteParams::default())
                .await
            {
                error!(%namespace, %error, "Unable to delete ConfigMap");
            }
        }
    }
}

async fn send_entries(tx: mpsc::Sender<Entry>, entries: Vec<Entry>) {
    for entry in entries {
        // The dispatcher has stopped; drop the rest.
        if tx.send(entry).await.is_err() {
            return;
        }
    }
}

/// Feeds observed agents-ConfigMap state into the reconciler's snapshot.
pub struct ConfigMapIndex {
    reconciler: Reconciler,
}

// === impl ConfigMapIndex ===

impl ConfigMapIndex {
    pub fn shared(reconciler: Reconciler) -> SharedConfigMapIndex {
        Arc::new(RwLock::new(Self { reconciler }))
    }
}

impl kubert::index::IndexNamespacedResource<k8s::ConfigMap> for ConfigMapIndex {
    fn apply(&mut self, mut cm: k8s::ConfigMap) {
        if cm.name_unchecked() != self.reconciler.inner.config.configmap_name {
            return;
        }
        let Some(namespace) = cm.namespace() else {
            return;
        };
        // Strip server-managed metadata; only the data payload matters here.
        cm.metadata.managed_fields = None;
        cm.metadata.finalizers = None;
        cm.metadata.owner_references = None;

        debug!(%namespace, "ConfigMap applied");
        self.reconciler.update(&namespace, cm.data.as_ref());
    }

    fn delete(&mut self, namespace: String, name: String) {
        if name != self.reconciler.inner.config.configmap_name {
            return;
        }
        debug!(%namespace, "ConfigMap deleted");
        self.reconciler.update(&namespace, None);
    }
}
