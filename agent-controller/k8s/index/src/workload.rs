use interpose_agent_controller_core::WorkloadKind;
use interpose_agent_controller_k8s_api::{
    self as k8s, Api, Client, ObjectMeta, Patch, PatchParams, ResourceExt,
};
use std::collections::BTreeMap;

/// A pod-template owner managed by the controller.
#[derive(Clone, Debug)]
pub enum Workload {
    Deployment(k8s::Deployment),
    ReplicaSet(k8s::ReplicaSet),
    StatefulSet(k8s::StatefulSet),
}

// === impl Workload ===

impl Workload {
    pub async fn get(
        client: &Client,
        name: &str,
        namespace: &str,
        kind: WorkloadKind,
    ) -> Result<Self, k8s::Error> {
        match kind {
            WorkloadKind::Deployment => Api::<k8s::Deployment>::namespaced(client.clone(), namespace)
                .get(name)
                .await
                .map(Self::Deployment),
            WorkloadKind::ReplicaSet => Api::<k8s::ReplicaSet>::namespaced(client.clone(), namespace)
                .get(name)
                .await
                .map(Self::ReplicaSet),
            WorkloadKind::StatefulSet => {
                Api::<k8s::StatefulSet>::namespaced(client.clone(), namespace)
                    .get(name)
                    .await
                    .map(Self::StatefulSet)
            }
        }
    }

    fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Deployment(d) => &d.metadata,
            Self::ReplicaSet(r) => &r.metadata,
            Self::StatefulSet(s) => &s.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    pub fn kind(&self) -> WorkloadKind {
        match self {
            Self::Deployment(_) => WorkloadKind::Deployment,
            Self::ReplicaSet(_) => WorkloadKind::ReplicaSet,
            Self::StatefulSet(_) => WorkloadKind::StatefulSet,
        }
    }

    pub fn pod_template(&self) -> Option<&k8s::PodTemplateSpec> {
        match self {
            Self::Deployment(d) => d.spec.as_ref().map(|s| &s.template),
            Self::ReplicaSet(r) => r.spec.as_ref().and_then(|s| s.template.as_ref()),
            Self::StatefulSet(s) => s.spec.as_ref().map(|s| &s.template),
        }
    }

    pub fn pod_labels(&self) -> Option<&BTreeMap<String, String>> {
        self.pod_template()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.as_ref())
    }

    /// Applies a strategic-merge patch to the workload.
    pub async fn patch(
        &self,
        client: &Client,
        patch: serde_json::Value,
    ) -> Result<(), k8s::Error> {
        let params = PatchParams::default();
        let patch = Patch::Strategic(patch);
        match self {
            Self::Deployment(d) => {
                Api::<k8s::Deployment>::namespaced(client.clone(), self.namespace())
                    .patch(&d.name_unchecked(), &params, &patch)
                    .await?;
            }
            Self::ReplicaSet(r) => {
                Api::<k8s::ReplicaSet>::namespaced(client.clone(), self.namespace())
                    .patch(&r.name_unchecked(), &params, &patch)
                    .await?;
            }
            Self::StatefulSet(s) => {
                Api::<k8s::StatefulSet>::namespaced(client.clone(), self.namespace())
                    .patch(&s.name_unchecked(), &params, &patch)
                    .await?;
            }
        }
        Ok(())
    }
}

pub(crate) async fn get_replica_set(
    client: &Client,
    name: &str,
    namespace: &str,
) -> Result<k8s::ReplicaSet, k8s::Error> {
    Api::<k8s::ReplicaSet>::namespaced(client.clone(), namespace)
        .get(name)
        .await
}
