use crate::{
    generate::Generator,
    workload::{get_replica_set, Workload},
    ControllerConfig,
};
use chrono::{offset::Utc, SecondsFormat};
use interpose_agent_controller_core::{
    SidecarConfig, AGENT_CONTAINER_NAME, SLEEPER_ARGS, SLEEPER_IMAGE,
};
use interpose_agent_controller_k8s_api::{self as k8s, Api, Client, ListParams};
use std::sync::Arc;
use tokio::time;
use tracing::{debug, error, info};

const SCALE_RETRIES: usize = 200;
const SCALE_RETRY_DELAY: time::Duration = time::Duration::from_millis(300);

/// Forces workload controllers to replace running pods when their agent state
/// no longer matches the desired config.
#[derive(Clone)]
pub struct Rollout {
    client: Client,
    config: Arc<ControllerConfig>,
    generator: Arc<dyn Generator>,
}

// === impl Rollout ===

impl Rollout {
    pub fn new(client: Client, config: Arc<ControllerConfig>, generator: Arc<dyn Generator>) -> Self {
        Self {
            client,
            config,
            generator,
        }
    }

    /// Rolls the workload when necessary. `desired` is the config the pods
    /// should converge on; `None` means the agent should be removed.
    pub async fn trigger(&self, workload: &Workload, desired: Option<&SidecarConfig>) {
        if !self.is_needed(workload, desired).await {
            return;
        }

        if let Workload::ReplicaSet(rs) = workload {
            self.replica_set(workload, rs).await;
            return;
        }

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let annotation = self.config.restart_annotation();
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            annotation: now,
                        },
                    },
                },
            },
        });
        match workload.patch(&self.client, patch).await {
            Ok(()) => info!(
                workload.name = %workload.name(),
                workload.namespace = %workload.namespace(),
                "Successfully rolled out",
            ),
            Err(error) => error!(
                workload.kind = %workload.kind(),
                workload.name = %workload.name(),
                workload.namespace = %workload.namespace(),
                %error,
                "Unable to patch workload",
            ),
        }
    }

    /// Checks whether the running pods already match the desired agent state;
    /// if they do there's no reason to trigger a rollout.
    async fn is_needed(&self, workload: &Workload, desired: Option<&SidecarConfig>) -> bool {
        let labels = match workload.pod_labels() {
            Some(labels) if !labels.is_empty() => labels,
            _ => {
                // Degenerate template; restart only if an agent is desired.
                debug!(
                    workload.name = %workload.name(),
                    workload.namespace = %workload.namespace(),
                    "Pod template has no labels",
                );
                return desired.is_some();
            }
        };

        let selector = labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let pods = match Api::<k8s::Pod>::namespaced(self.client.clone(), workload.namespace())
            .list(&ListParams::default().labels(&selector))
            .await
        {
            Ok(list) => list.items,
            Err(error) => {
                debug!(
                    workload.name = %workload.name(),
                    workload.namespace = %workload.namespace(),
                    %error,
                    "Rollout necessary; unable to retrieve current pods",
                );
                return true;
            }
        };

        match rollout_reason(&pods, desired, &*self.generator) {
            Some(reason) => {
                debug!(
                    workload.name = %workload.name(),
                    workload.namespace = %workload.namespace(),
                    %reason,
                    "Rollout necessary",
                );
                true
            }
            None => {
                debug!(
                    workload.name = %workload.name(),
                    workload.namespace = %workload.namespace(),
                    "All pods have the desired agent state",
                );
                false
            }
        }
    }

    /// ReplicaSets do not recreate pods on template churn, so the set is
    /// scaled to zero and back to its original count.
    async fn replica_set(&self, workload: &Workload, rs: &k8s::ReplicaSet) {
        let name = workload.name();
        let namespace = workload.namespace();
        let replicas = rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        if replicas == 0 {
            debug!(%name, %namespace, "ReplicaSet has zero replicas so rollout was a no-op");
            return;
        }

        debug!(%name, %namespace, "Performing ReplicaSet rollout using scaling");
        if let Err(error) = workload
            .patch(&self.client, serde_json::json!({"spec": {"replicas": 0}}))
            .await
        {
            error!(%name, %namespace, %error, "Unable to scale ReplicaSet to zero");
            return;
        }
        if let Err(error) = self.wait_for_replica_count(name, namespace, 0).await {
            error!(%error, "Abandoning ReplicaSet rollout");
            return;
        }

        debug!(%name, %namespace, %replicas, "ReplicaSet was scaled down to zero; scaling back");
        if let Err(error) = workload
            .patch(
                &self.client,
                serde_json::json!({"spec": {"replicas": replicas}}),
            )
            .await
        {
            error!(%name, %namespace, %error, "Unable to restore ReplicaSet scale");
            return;
        }
        if let Err(error) = self.wait_for_replica_count(name, namespace, replicas).await {
            error!(%error, "Abandoning ReplicaSet rollout");
        }
    }

    async fn wait_for_replica_count(
        &self,
        name: &str,
        namespace: &str,
        count: i32,
    ) -> anyhow::Result<()> {
        for _ in 0..SCALE_RETRIES {
            if let Ok(rs) = get_replica_set(&self.client, name, namespace).await {
                if rs.spec.and_then(|s| s.replicas) == Some(count) {
                    return Ok(());
                }
            }
            time::sleep(SCALE_RETRY_DELAY).await;
        }
        anyhow::bail!("ReplicaSet {name}.{namespace} never scaled to {count}")
    }
}

/// Why the running pods do not match the desired agent state, if they don't.
///
/// A pod only counts once at least one of its containers has started; pods
/// still being created or torn down say nothing about the template in effect.
pub(crate) fn rollout_reason(
    pods: &[k8s::Pod],
    desired: Option<&SidecarConfig>,
    generator: &dyn Generator,
) -> Option<String> {
    let mut running_pods = 0;
    for pod in pods.iter().filter(|p| is_pod_running(p)) {
        running_pods += 1;
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();

        let pod_agent = agent_container(pod);
        let Some(config) = desired else {
            if pod_agent.is_some() {
                return Some(format!("no agent is desired but pod {pod_name} has one"));
            }
            continue;
        };
        let Some(pod_agent) = pod_agent else {
            return Some(format!(
                "an agent is desired but pod {pod_name} doesn't have one"
            ));
        };
        if *pod_agent != generator.agent_container(pod, config) {
            return Some(format!(
                "the desired agent is not equal to the existing agent in pod {pod_name}"
            ));
        }

        for cn in &config.containers {
            let found = pod
                .spec
                .as_ref()
                .and_then(|spec| spec.containers.iter().find(|c| c.name == cn.name));
            let Some(found) = found else {
                return Some(format!("pod {pod_name} should contain container {}", cn.name));
            };
            if cn.replace {
                if !is_disabled(found) {
                    return Some(format!(
                        "container {} of pod {pod_name} should be disabled",
                        cn.name
                    ));
                }
            } else if is_disabled(found) {
                return Some(format!(
                    "container {} of pod {pod_name} should not be disabled",
                    cn.name
                ));
            }
        }
    }

    if running_pods == 0 && desired.is_some() {
        return Some("an agent is desired and there are no running pods".to_string());
    }
    None
}

fn agent_container(pod: &k8s::Pod) -> Option<&k8s::Container> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == AGENT_CONTAINER_NAME)
}

fn is_pod_running(pod: &k8s::Pod) -> bool {
    pod.status
        .iter()
        .flat_map(|status| status.container_statuses.iter().flatten())
        .any(|cs| {
            cs.state
                .as_ref()
                .and_then(|s| s.running.as_ref())
                .and_then(|r| r.started_at.as_ref())
                .is_some()
        })
}

fn is_disabled(container: &k8s::Container) -> bool {
    container.image.as_deref() == Some(SLEEPER_IMAGE)
        && container.args.as_deref().map_or(false, |args| {
            args.iter().map(String::as_str).eq(SLEEPER_ARGS.iter().copied())
        })
}
