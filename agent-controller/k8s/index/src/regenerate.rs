use crate::{generate::Generator, workload::Workload, ControllerConfig};
use anyhow::{Context, Result};
use interpose_agent_controller_core as agent;
use interpose_agent_controller_k8s_api::{
    self as k8s, is_not_found, Api, Client, ListParams, PostParams, ResourceExt,
};
use tracing::{debug, error};

/// Regenerates every entry of every agents ConfigMap, writing back the ones
/// that changed.
///
/// A one-shot administrative pass, typically run after an agent image
/// upgrade. Entries whose workload no longer exists are deleted.
pub async fn regenerate_agent_maps(
    client: &Client,
    config: &ControllerConfig,
    generator: &dyn Generator,
) -> Result<()> {
    if config.namespaces.is_empty() {
        return regenerate_namespace(client, config, generator, None).await;
    }
    for ns in &config.namespaces {
        regenerate_namespace(client, config, generator, Some(ns)).await?;
    }
    Ok(())
}

async fn regenerate_namespace(
    client: &Client,
    config: &ControllerConfig,
    generator: &dyn Generator,
    ns: Option<&str>,
) -> Result<()> {
    let api: Api<k8s::ConfigMap> = match ns {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let params = ListParams::default().fields(&format!("metadata.name={}", config.configmap_name));
    let cms = api
        .list(&params)
        .await
        .context("unable to list agent ConfigMaps")?;

    for mut cm in cms.items {
        let Some(namespace) = cm.namespace() else {
            continue;
        };
        let Some(data) = cm.data.as_mut() else {
            continue;
        };

        let mut changed = false;
        for name in data.keys().cloned().collect::<Vec<_>>() {
            let prior = match agent::decode(&data[&name]) {
                Ok(prior) => prior,
                Err(error) => {
                    error!(%name, %namespace, %error, "Failed to decode ConfigMap entry");
                    continue;
                }
            };
            let workload = match Workload::get(
                client,
                &prior.workload_name,
                &prior.namespace,
                prior.workload_kind,
            )
            .await
            {
                Ok(workload) => workload,
                Err(err) if is_not_found(&err) => {
                    // Workload no longer exists.
                    data.remove(&name);
                    changed = true;
                    continue;
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("unable to get workload for {name}.{namespace}")
                    })
                }
            };
            let generated = generator.generate(&workload, Some(&prior)).await?;
            if generated == prior {
                continue;
            }
            data.insert(name, agent::encode(&generated)?);
            changed = true;
        }

        if changed {
            cm.metadata.managed_fields = None;
            cm.metadata.finalizers = None;
            cm.metadata.owner_references = None;
            debug!(%namespace, "Updating regenerated ConfigMap");
            Api::<k8s::ConfigMap>::namespaced(client.clone(), &namespace)
                .replace(&config.configmap_name, &PostParams::default(), &cm)
                .await
                .with_context(|| {
                    format!("unable to update ConfigMap {}", config.configmap_name)
                })?;
        }
    }
    Ok(())
}
