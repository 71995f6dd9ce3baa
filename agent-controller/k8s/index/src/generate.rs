use crate::{workload::Workload, ControllerConfig};
use interpose_agent_controller_core::{
    ContainerConfig, Intercept, SidecarConfig, AGENT_CONTAINER_NAME,
};
use interpose_agent_controller_k8s_api::{
    self as k8s, Api, Client, IntOrString, Labels, ListParams, ResourceExt, Selector,
};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    /// No agent image has been configured yet. Retryable: the entry stays
    /// pending and the next informer event will try again.
    #[error("no agent image is configured")]
    NoAgentImage,

    #[error("workload {name}.{namespace} is not selected by any service")]
    NoMatchingService { name: String, namespace: String },

    #[error(transparent)]
    Api(#[from] k8s::Error),
}

/// Produces desired sidecar specs from workload templates.
///
/// The admission webhook owns the full template expansion; the reconciler
/// only needs `generate` to refresh ConfigMap entries and `agent_container`
/// to judge whether a running pod's agent matches the desired config.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        workload: &Workload,
        prior: Option<&SidecarConfig>,
    ) -> Result<SidecarConfig, GenerateError>;

    /// The agent container that would be injected into `pod` for `config`.
    fn agent_container(&self, pod: &k8s::Pod, config: &SidecarConfig) -> k8s::Container;
}

/// Template-driven [`Generator`]: derives the config from the workload's pod
/// template and the Services whose selectors match it.
pub struct TemplateGenerator {
    client: Client,
    config: Arc<ControllerConfig>,
}

// === impl TemplateGenerator ===

impl TemplateGenerator {
    pub fn new(client: Client, config: Arc<ControllerConfig>) -> Arc<Self> {
        Arc::new(Self { client, config })
    }
}

#[async_trait::async_trait]
impl Generator for TemplateGenerator {
    async fn generate(
        &self,
        workload: &Workload,
        prior: Option<&SidecarConfig>,
    ) -> Result<SidecarConfig, GenerateError> {
        let image = self
            .config
            .agent_image
            .clone()
            .ok_or(GenerateError::NoAgentImage)?;

        let labels: Labels = workload.pod_labels().cloned().into();
        let services = Api::<k8s::Service>::namespaced(self.client.clone(), workload.namespace())
            .list(&ListParams::default())
            .await?;
        let selecting = services
            .items
            .iter()
            .filter(|svc| {
                let selector = Selector::from(svc.spec.as_ref().and_then(|s| s.selector.clone()));
                !selector.selects_all() && selector.matches(&labels)
            })
            .collect::<Vec<_>>();
        if selecting.is_empty() {
            return Err(GenerateError::NoMatchingService {
                name: workload.name().to_string(),
                namespace: workload.namespace().to_string(),
            });
        }

        let containers = workload
            .pod_template()
            .and_then(|t| t.spec.as_ref())
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|cn| cn.name != AGENT_CONTAINER_NAME)
            .map(|cn| {
                let replace = prior
                    .and_then(|p| p.containers.iter().find(|pc| pc.name == cn.name))
                    .map(|pc| pc.replace)
                    .unwrap_or(false);
                ContainerConfig {
                    name: cn.name.clone(),
                    replace,
                    intercepts: intercepts_for(cn, &selecting),
                }
            })
            .collect();

        Ok(SidecarConfig {
            agent_name: workload.name().to_string(),
            namespace: workload.namespace().to_string(),
            workload_name: workload.name().to_string(),
            workload_kind: workload.kind(),
            agent_image: Some(image),
            manual: false,
            create: false,
            containers,
        })
    }

    fn agent_container(&self, _pod: &k8s::Pod, config: &SidecarConfig) -> k8s::Container {
        let image = config
            .agent_image
            .clone()
            .or_else(|| self.config.agent_image.clone());
        k8s::Container {
            name: AGENT_CONTAINER_NAME.to_string(),
            image,
            args: Some(vec!["agent".to_string()]),
            ..Default::default()
        }
    }
}

/// One intercept per service port that targets a port of this container.
fn intercepts_for(container: &k8s::Container, services: &[&k8s::Service]) -> Vec<Intercept> {
    let container_ports = container.ports.as_deref().unwrap_or_default();
    let mut intercepts = Vec::new();
    for svc in services {
        let Some(uid) = svc.uid() else {
            continue;
        };
        let svc_ports = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_deref())
            .unwrap_or_default();
        for sp in svc_ports {
            if let Some(cp) = container_ports.iter().find(|cp| targets(sp, cp)) {
                intercepts.push(Intercept {
                    service_uid: uid.clone(),
                    service_name: Some(svc.name_unchecked()),
                    container_port: Some(cp.container_port as u16),
                });
            }
        }
    }
    intercepts
}

fn targets(sp: &k8s::ServicePort, cp: &k8s::ContainerPort) -> bool {
    match &sp.target_port {
        Some(IntOrString::Int(port)) => *port == cp.container_port,
        Some(IntOrString::String(name)) => Some(name) == cp.name.as_ref(),
        None => sp.port == cp.container_port,
    }
}
