use crate::{generate::GenerateError, index::Reconciler, snapshot::Entry, workload::Workload};
use interpose_agent_controller_core as agent;
use interpose_agent_controller_k8s_api::is_not_found;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// Single-threaded loop consuming the entry events emitted by the ConfigMap
/// watch.
///
/// Handlers never invoke each other; all feedback flows through observation
/// of the mutated ConfigMap.
pub struct Controller {
    reconciler: Reconciler,
    mod_rx: mpsc::Receiver<Entry>,
    del_rx: mpsc::Receiver<Entry>,
    cancel: watch::Receiver<bool>,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        reconciler: Reconciler,
        mod_rx: mpsc::Receiver<Entry>,
        del_rx: mpsc::Receiver<Entry>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reconciler,
            mod_rx,
            del_rx,
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
                entry = self.del_rx.recv() => match entry {
                    Some(entry) => self.reconciler.handle_delete(entry).await,
                    None => return,
                },
                entry = self.mod_rx.recv() => match entry {
                    Some(entry) => self.reconciler.handle_add(entry).await,
                    None => return,
                },
            }
        }
    }
}

impl Reconciler {
    pub(crate) async fn handle_add(&self, entry: Entry) {
        debug!(name = %entry.name, namespace = %entry.namespace, "add");
        let config = match agent::decode(&entry.value) {
            Ok(config) => config,
            Err(error) => {
                error!(name = %entry.name, namespace = %entry.namespace, %error, "Failed to decode ConfigMap entry");
                return;
            }
        };
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
                // A vanished workload is dropped silently.
                if !is_not_found(&err) {
                    error!(name = %entry.name, namespace = %entry.namespace, error = %err, "Unable to get workload");
                }
                return;
            }
        };
        if config.manual {
            // Manually added, just ignore.
            return;
        }
        if config.create {
            match self.inner.generator.generate(&workload, Some(&config)).await {
                // Storing generates a new event, so rollout is skipped here.
                Ok(generated) => {
                    if let Err(error) = self.store(&generated, false).await {
                        error!(name = %entry.name, namespace = %entry.namespace, %error, "Unable to store generated config");
                    }
                }
                Err(GenerateError::NoAgentImage) => {
                    warn!(
                        name = %entry.name,
                        namespace = %entry.namespace,
                        "No agent image is configured; entry stays pending until one is",
                    );
                }
                Err(error) => {
                    error!(name = %entry.name, namespace = %entry.namespace, %error, "Unable to generate config");
                }
            }
            return;
        }
        if let Err(error) = self.hooks().on_add(&workload, &config).await {
            error!(name = %entry.name, namespace = %entry.namespace, %error, "on_add hook failed");
        }
    }

    pub(crate) async fn handle_delete(&self, entry: Entry) {
        debug!(name = %entry.name, namespace = %entry.namespace, "del");
        let config = match agent::decode(&entry.value) {
            Ok(config) => config,
            Err(error) => {
                error!(name = %entry.name, namespace = %entry.namespace, %error, "Failed to decode ConfigMap entry");
                return;
            }
        };
        let workload = match Workload::get(
            &self.inner.client,
            &config.workload_name,
            &config.namespace,
            config.workload_kind,
        )
        .await
        {
            Ok(workload) => {
                if config.create || config.manual {
                    // Deleted before it was generated, or manually added.
                    return;
                }
                Some(workload)
            }
            Err(err) if is_not_found(&err) => None,
            Err(error) => {
                error!(name = %entry.name, namespace = %entry.namespace, %error, "Unable to get workload");
                return;
            }
        };
        if let Err(error) = self.hooks().on_delete(&entry.name, &entry.namespace).await {
            error!(name = %entry.name, namespace = %entry.namespace, %error, "on_delete hook failed");
        }
        if let Some(workload) = workload {
            // Remove the agent from the running pods.
            self.inner.rollout.trigger(&workload, None).await;
        }
    }
}
