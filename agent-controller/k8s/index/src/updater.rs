use crate::index::Reconciler;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{anyhow, Context, Result};
use interpose_agent_controller_core::{self as agent, SidecarConfig};
use interpose_agent_controller_k8s_api::{
    self as k8s, is_not_found, Api, ObjectMeta, PostParams,
};
use parking_lot::Mutex;
use std::{
    collections::{hash_map::Entry as MapEntry, BTreeMap},
    sync::Arc,
};
use tokio::sync::watch;
use tracing::{debug, warn};

type StoreResult = Result<(), Arc<anyhow::Error>>;

/// Coalesces concurrent stores for one namespace into a single ConfigMap
/// write.
///
/// At most one updater is live per namespace. Writers attach their pending
/// entries to it; the writer that created it commits, and every attached
/// writer observes the shared result. Once `updated` is set the updater
/// accepts no more entries and is about to leave the registry.
pub(crate) struct ConfigUpdater {
    pub(crate) namespace: String,
    state: Mutex<State>,
    done_tx: watch::Sender<Option<StoreResult>>,
    done_rx: watch::Receiver<Option<StoreResult>>,
}

struct State {
    config: HashMap<String, String>,
    add_to_snapshot: HashSet<String>,
    updated: bool,
}

// === impl ConfigUpdater ===

impl ConfigUpdater {
    pub(crate) fn new(namespace: &str) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(None);
        Arc::new(Self {
            namespace: namespace.to_string(),
            state: Mutex::new(State {
                config: HashMap::new(),
                add_to_snapshot: HashSet::new(),
                updated: false,
            }),
            done_tx,
            done_rx,
        })
    }

    /// Attaches a pending entry. Fails if this updater has already committed,
    /// in which case the caller must retry against a fresh updater.
    pub(crate) fn add(&self, agent_name: &str, value: String, update_snapshot: bool) -> bool {
        let mut state = self.state.lock();
        if state.updated {
            return false;
        }
        state.config.insert(agent_name.to_string(), value);
        if update_snapshot {
            state.add_to_snapshot.insert(agent_name.to_string());
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn mark_updated(&self) {
        self.state.lock().updated = true;
    }

    pub(crate) fn complete(&self, res: StoreResult) {
        let _ = self.done_tx.send(Some(res));
    }

    pub(crate) async fn wait(&self) -> Result<()> {
        let mut rx = self.done_rx.clone();
        let res = match rx.wait_for(Option::is_some).await {
            Ok(guard) => (*guard).clone(),
            Err(_) => {
                return Err(anyhow!(
                    "ConfigMap update for namespace {} was cancelled",
                    self.namespace
                ))
            }
        };
        match res {
            Some(Err(error)) => Err(anyhow!(error)),
            _ => Ok(()),
        }
    }
}

/// Merges pending entries over a copy of the namespace snapshot.
///
/// `manual` entries are never touched: neither an existing manual entry nor a
/// pending value flagged manual is written. Entries whose pending value is
/// already current in the live document are skipped (the snapshot just hasn't
/// caught up yet). Returns the merged document data and the entries to
/// publish to the snapshot.
pub(crate) fn merge_pending(
    mut data: BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
    pending: &HashMap<String, String>,
    add_to_snapshot: &HashSet<String>,
    namespace: &str,
) -> (BTreeMap<String, String>, Vec<(String, String)>) {
    let is_manual = |value: &String| agent::decode(value).map_or(false, |c| c.manual);

    let mut publish = Vec::new();
    for (agent_name, value) in pending {
        if current.get(agent_name).map_or(false, is_manual) || is_manual(value) {
            warn!(
                %agent_name,
                %namespace,
                "Avoided an attempt to overwrite manually added config entry",
            );
            continue;
        }
        if current.get(agent_name) == Some(value) {
            continue;
        }
        data.insert(agent_name.clone(), value.clone());
        if add_to_snapshot.contains(agent_name) {
            publish.push((agent_name.clone(), value.clone()));
        }
    }
    (data, publish)
}

impl Reconciler {
    /// Writes an agent config into its namespace's ConfigMap, coalescing with
    /// any other in-flight stores for that namespace.
    ///
    /// With `update_snapshot` the entry is also published to the snapshot
    /// before the write lands, which suppresses the rollout that the
    /// resulting watch event would otherwise trigger.
    pub async fn store(&self, config: &SidecarConfig, update_snapshot: bool) -> Result<()> {
        let value = agent::encode(config)?;
        let namespace = &config.namespace;

        // Nothing to do when the serialized value is already current.
        if self.inner.snapshot.read().get(namespace, &config.agent_name) == Some(value.as_str()) {
            return Ok(());
        }

        let (updater, new_group) = loop {
            let (updater, new_group) = {
                let mut updaters = self.inner.updaters.lock();
                match updaters.entry(namespace.clone()) {
                    MapEntry::Occupied(e) => (e.get().clone(), false),
                    MapEntry::Vacant(e) => {
                        let updater = ConfigUpdater::new(namespace);
                        e.insert(updater.clone());
                        (updater, true)
                    }
                }
            };
            if updater.add(&config.agent_name, value.clone(), update_snapshot) {
                break (updater, new_group);
            }
            // The updater has committed and is leaving the registry; attach
            // to a fresh one.
            tokio::task::yield_now().await;
        };

        if new_group {
            let this = self.clone();
            let updater = updater.clone();
            tokio::spawn(async move { this.update_config_map(updater).await });
        }

        updater.wait().await
    }

    async fn update_config_map(self, updater: Arc<ConfigUpdater>) {
        let res = self
            .commit_config(&updater)
            .await
            .map_err(Arc::new);
        if let Err(error) = &res {
            warn!(namespace = %updater.namespace, %error, "Failed to update ConfigMap");
        }
        // Any other store for this namespace now has to start a new group.
        self.inner.updaters.lock().remove(&updater.namespace);
        updater.complete(res);
    }

    async fn commit_config(&self, updater: &ConfigUpdater) -> Result<()> {
        let api = Api::<k8s::ConfigMap>::namespaced(self.inner.client.clone(), &updater.namespace);
        let (mut cm, create) = match api.get(&self.inner.config.configmap_name).await {
            Ok(cm) => (cm, false),
            Err(err) if is_not_found(&err) => {
                let cm = k8s::ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.inner.config.configmap_name.clone()),
                        namespace: Some(updater.namespace.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                (cm, true)
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("unable to get ConfigMap {}", self.inner.config.configmap_name)
                })
            }
        };
        // Never write server-managed metadata back.
        cm.metadata.managed_fields = None;
        cm.metadata.finalizers = None;
        cm.metadata.owner_references = None;

        let merged = {
            let mut state = updater.state.lock();
            let base = self.inner.snapshot.read().namespace_data(&updater.namespace);
            let current = cm.data.clone().unwrap_or_default();
            let (merged, publish) = merge_pending(
                base,
                &current,
                &state.config,
                &state.add_to_snapshot,
                &updater.namespace,
            );
            if !publish.is_empty() {
                let mut snapshot = self.inner.snapshot.write();
                for (agent_name, value) in publish {
                    snapshot.insert(&updater.namespace, &agent_name, value);
                }
            }
            state.updated = true;
            merged
        };
        if !create && cm.data.clone().unwrap_or_default() == merged {
            debug!(namespace = %updater.namespace, "ConfigMap is already up to date");
            return Ok(());
        }
        cm.data = Some(merged);

        if create {
            debug!(namespace = %updater.namespace, "Creating ConfigMap");
            api.create(&PostParams::default(), &cm)
                .await
                .with_context(|| {
                    format!("unable to create ConfigMap {}", self.inner.config.configmap_name)
                })?;
        } else {
            debug!(namespace = %updater.namespace, "Updating ConfigMap");
            api.replace(&self.inner.config.configmap_name, &PostParams::default(), &cm)
                .await
                .with_context(|| {
                    format!("unable to update ConfigMap {}", self.inner.config.configmap_name)
                })?;
        }
        Ok(())
    }

    /// Deletes an agent config from its namespace's ConfigMap. Removing a
    /// manually added entry is a no-op.
    pub async fn remove(&self, name: &str, namespace: &str) -> Result<()> {
        let api = Api::<k8s::ConfigMap>::namespaced(self.inner.client.clone(), namespace);
        let mut cm = match api.get(&self.inner.config.configmap_name).await {
            Ok(cm) => cm,
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("unable to get ConfigMap {}", self.inner.config.configmap_name)
                })
            }
        };
        let Some(data) = cm.data.as_mut() else {
            return Ok(());
        };
        let Some(value) = data.get(name) else {
            return Ok(());
        };
        if agent::decode(value)?.manual {
            return Ok(());
        }
        data.remove(name);
        cm.metadata.managed_fields = None;
        cm.metadata.finalizers = None;
        cm.metadata.owner_references = None;

        debug!(%name, %namespace, "Deleting entry from ConfigMap");
        api.replace(&self.inner.config.configmap_name, &PostParams::default(), &cm)
            .await
            .with_context(|| {
                format!("unable to update ConfigMap {}", self.inner.config.configmap_name)
            })?;
        Ok(())
    }
}
