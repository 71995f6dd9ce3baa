use interpose_agent_controller_core::AGENTS_CONFIGMAP_NAME;

/// Holds the controller's environment-derived settings.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespaces to manage. Empty means cluster-wide.
    pub namespaces: Vec<String>,

    /// Image reference for injected agent containers, when one is configured.
    pub agent_image: Option<String>,

    /// Prefix for controller-owned annotation keys, e.g. "interpose.io/".
    pub domain_prefix: String,

    /// Name of the per-namespace agents ConfigMap.
    pub configmap_name: String,
}

impl ControllerConfig {
    /// The pod-template annotation key whose mutation forces a rolling
    /// restart.
    pub fn restart_annotation(&self) -> String {
        format!("{}restartedAt", self.domain_prefix)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            agent_image: None,
            domain_prefix: "interpose.io/".to_string(),
            configmap_name: AGENTS_CONFIGMAP_NAME.to_string(),
        }
    }
}
