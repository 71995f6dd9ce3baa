use crate::{generate::GenerateError, index::Reconciler, workload::Workload};
use ahash::AHashMap as HashMap;
use interpose_agent_controller_core::{self as agent, SidecarConfig};
use interpose_agent_controller_k8s_api::{
    self as k8s, is_not_found, Labels, ResourceExt, Selector,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

pub type SharedServiceIndex = Arc<RwLock<ServiceIndex>>;

/// A Service change, reduced to what impact analysis needs.
///
/// `trust_uid` narrows the analysis: a deletion can only affect configs that
/// already reference the Service's UID, while an add or modification can also
/// affect configs whose workload template the selector now matches.
#[derive(Clone, Debug)]
pub struct SvcEvent {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub selector: Selector,
    pub trust_uid: bool,
}

/// Watches Services, caching each one's UID and selector so that deletions
/// (which only carry a name) can still be resolved to a UID.
pub struct ServiceIndex {
    tx: mpsc::UnboundedSender<SvcEvent>,
    services: HashMap<(String, String), (String, Selector)>,
}

// === impl ServiceIndex ===

impl ServiceIndex {
    pub fn shared(tx: mpsc::UnboundedSender<SvcEvent>) -> SharedServiceIndex {
        Arc::new(RwLock::new(Self {
            tx,
            services: HashMap::new(),
        }))
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Service> for ServiceIndex {
    fn apply(&mut self, svc: k8s::Service) {
        let Some(namespace) = svc.namespace() else {
            return;
        };
        let name = svc.name_unchecked();
        let Some(uid) = svc.uid() else {
            return;
        };
        let selector = Selector::from(svc.spec.as_ref().and_then(|s| s.selector.clone()));
        self.services.insert(
            (namespace.clone(), name.clone()),
            (uid.clone(), selector.clone()),
        );
        let _ = self.tx.send(SvcEvent {
            namespace,
            name,
            uid,
            selector,
            trust_uid: false,
        });
    }

    fn delete(&mut self, namespace: String, name: String) {
        let Some((uid, selector)) = self.services.remove(&(namespace.clone(), name.clone())) else {
            return;
        };
        let _ = self.tx.send(SvcEvent {
            namespace,
            name,
            uid,
            selector,
            trust_uid: true,
        });
    }
}

/// Runs Service impact analysis, independently of the entry dispatcher.
pub struct ServiceController {
    reconciler: Reconciler,
    rx: mpsc::UnboundedReceiver<SvcEvent>,
    cancel: watch::Receiver<bool>,
}

// === impl ServiceController ===

impl ServiceController {
    pub fn new(
        reconciler: Reconciler,
        rx: mpsc::UnboundedReceiver<SvcEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reconciler,
            rx,
            cancel,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                res = self.cancel.changed() => {
                    if res.is_err() || *self.cancel.borrow() {
                        return;
                    }
                }
                event = self.rx.recv() => match event {
                    Some(event) => self.reconciler.handle_service_event(event).await,
                    None => return,
                },
            }
        }
    }
}

/// A config marked affected by a Service change. When the selector analysis
/// already fetched the workload it is cached here so the consumer does not
/// refetch it.
struct Affected {
    config: SidecarConfig,
    workload: Option<Workload>,
}

/// Whether any container intercept of `config` references the Service UID.
fn references_uid(config: &SidecarConfig, uid: &str) -> bool {
    config
        .containers
        .iter()
        .flat_map(|cn| cn.intercepts.iter())
        .any(|ic| ic.service_uid == uid)
}

impl Reconciler {
    pub(crate) async fn handle_service_event(&self, event: SvcEvent) {
        debug!(
            service = %event.name,
            namespace = %event.namespace,
            trust_uid = event.trust_uid,
            "Service event",
        );
        for affected in self.configs_affected_by_svc(&event).await {
            let config = affected.config;
            let workload = match affected.workload {
                Some(workload) => workload,
                None => {
                    match Workload::get(
                        &self.inner.client,
                        &config.workload_name,
                        &config.namespace,
                        config.workload_kind,
                    )
                    .await
                    {
                        Ok(workload) => workload,
                        Err(err) if is_not_found(&err) => {
                            debug!(
                                workload.kind = %config.workload_kind,
                                workload.name = %config.workload_name,
                                workload.namespace = %config.namespace,
                                "Deleting config entry for vanished workload",
                            );
                            if let Err(error) =
                                self.remove(&config.agent_name, &config.namespace).await
                            {
                                error!(%error, "Unable to delete config entry");
                            }
                            continue;
                        }
                        Err(error) => {
                            error!(%error, "Unable to get workload");
                            continue;
                        }
                    }
                }
            };

            debug!(
                workload.kind = %config.workload_kind,
                workload.name = %config.workload_name,
                workload.namespace = %config.namespace,
                "Regenerating config entry",
            );
            match self.inner.generator.generate(&workload, Some(&config)).await {
                Ok(generated) => {
                    if let Err(error) = self.store(&generated, false).await {
                        error!(%error, "Unable to store regenerated config");
                    }
                }
                Err(GenerateError::NoMatchingService { .. }) => {
                    if let Err(error) = self.remove(&config.agent_name, &config.namespace).await {
                        error!(%error, "Unable to delete config entry");
                    }
                }
                Err(GenerateError::NoAgentImage) => {
                    warn!(
                        service = %event.name,
                        namespace = %event.namespace,
                        "No agent image is configured; deferring regeneration",
                    );
                    return;
                }
                Err(error) => error!(%error, "Unable to regenerate config"),
            }
        }
    }

    /// The snapshot entries in the Service's namespace that the change
    /// affects, either through an intercepted UID or (for adds and
    /// modifications) through the selector now matching the workload's pod
    /// template.
    async fn configs_affected_by_svc(&self, event: &SvcEvent) -> Vec<Affected> {
        let ns_data = self.inner.snapshot.read().namespace_data(&event.namespace);

        let mut affected = Vec::new();
        for value in ns_data.values() {
            let config = match agent::decode(value) {
                Ok(config) => config,
                Err(error) => {
                    error!(%error, "Failed to decode ConfigMap entry");
                    continue;
                }
            };
            if references_uid(&config, &event.uid) {
                affected.push(Affected {
                    config,
                    workload: None,
                });
                continue;
            }
            if event.trust_uid {
                // A deleted Service only affects configs that match its UID.
                continue;
            }
            match Workload::get(
                &self.inner.client,
                &config.workload_name,
                &config.namespace,
                config.workload_kind,
            )
            .await
            {
                Ok(workload) => {
                    let labels: Labels = workload.pod_labels().cloned().into();
                    if event.selector.matches(&labels) {
                        affected.push(Affected {
                            config,
                            workload: Some(workload),
                        });
                    }
                }
                Err(error) => {
                    debug!(
                        workload.name = %config.workload_name,
                        workload.namespace = %config.namespace,
                        %error,
                        "Unable to get workload for selector analysis",
                    );
                }
            }
        }
        affected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interpose_agent_controller_core::{ContainerConfig, Intercept};

    fn mk_config(uids: &[&str]) -> SidecarConfig {
        SidecarConfig {
            agent_name: "web".to_string(),
            namespace: "demo".to_string(),
            workload_name: "web".to_string(),
            containers: vec![ContainerConfig {
                name: "app".to_string(),
                intercepts: uids
                    .iter()
                    .map(|uid| Intercept {
                        service_uid: uid.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn uid_reference() {
        assert!(references_uid(&mk_config(&["a", "b"]), "a"));
        assert!(references_uid(&mk_config(&["a", "b"]), "b"));
        assert!(!references_uid(&mk_config(&["a"]), "b"));
        assert!(!references_uid(&mk_config(&[]), "a"));
    }
}
