use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Name of the sidecar container injected into intercepted pods.
pub const AGENT_CONTAINER_NAME: &str = "interpose-agent";

/// Name of the per-namespace ConfigMap that holds the agent entries.
pub const AGENTS_CONFIGMAP_NAME: &str = "interpose-agents";

/// Image that replaces a container disabled by an intercept.
pub const SLEEPER_IMAGE: &str = "docker.io/library/busybox:1.36";

/// Argument vector of a disabled container.
pub const SLEEPER_ARGS: &[&str] = &["sleep", "infinity"];

/// The desired agent specification for a single workload.
///
/// One of these is stored, YAML-encoded, under its `agent_name` key in the
/// per-namespace agents ConfigMap. The encoding is stable so that equality on
/// the serialized form is meaningful.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SidecarConfig {
    /// Unique within the namespace; the ConfigMap entry key.
    pub agent_name: String,

    pub namespace: String,

    pub workload_name: String,

    pub workload_kind: WorkloadKind,

    /// Image of the injected agent container, once generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_image: Option<String>,

    /// User-authored entry. The controller never overwrites or deletes it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub manual: bool,

    /// Placeholder requesting that a real spec be generated from the workload
    /// template. A create-only entry has no agent yet.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub create: bool,

    /// Per app-container decisions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerConfig {
    pub name: String,

    /// Replace the container with the sleeper placeholder while intercepted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replace: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intercepts: Vec<Intercept>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Intercept {
    /// UID of the Service that fronts the intercepted port.
    pub service_uid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,
}

/// Kinds of pod-template owners the controller manages.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    #[default]
    Deployment,
    ReplicaSet,
    StatefulSet,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid agent config entry: {0}")]
    Decode(#[source] serde_yaml::Error),

    #[error("unable to encode agent config: {0}")]
    Encode(#[source] serde_yaml::Error),
}

/// Serializes a config to the form stored in the agents ConfigMap.
///
/// Encoding is deterministic: the same config always yields byte-identical
/// output, so callers may compare serialized values for equality.
pub fn encode(config: &SidecarConfig) -> Result<String, CodecError> {
    serde_yaml::to_string(config).map_err(CodecError::Encode)
}

pub fn decode(value: &str) -> Result<SidecarConfig, CodecError> {
    serde_yaml::from_str(value).map_err(CodecError::Decode)
}

// === impl WorkloadKind ===

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::ReplicaSet => "ReplicaSet",
            Self::StatefulSet => "StatefulSet",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = InvalidWorkloadKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Deployment" => Ok(Self::Deployment),
            "ReplicaSet" => Ok(Self::ReplicaSet),
            "StatefulSet" => Ok(Self::StatefulSet),
            _ => Err(InvalidWorkloadKind(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported workload kind: {0}")]
pub struct InvalidWorkloadKind(String);

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_config() -> SidecarConfig {
        SidecarConfig {
            agent_name: "web".to_string(),
            namespace: "demo".to_string(),
            workload_name: "web".to_string(),
            workload_kind: WorkloadKind::Deployment,
            agent_image: Some("ghcr.io/interpose/agent:1.2.3".to_string()),
            manual: false,
            create: false,
            containers: vec![ContainerConfig {
                name: "app".to_string(),
                replace: true,
                intercepts: vec![Intercept {
                    service_uid: "c1a2b3".to_string(),
                    service_name: Some("web".to_string()),
                    container_port: Some(8080),
                }],
            }],
        }
    }

    #[test]
    fn round_trip() {
        let config = mk_config();
        let yml = encode(&config).expect("must encode");
        assert_eq!(decode(&yml).expect("must decode"), config);
    }

    #[test]
    fn encoding_is_stable() {
        let config = mk_config();
        assert_eq!(
            encode(&config).expect("must encode"),
            encode(&config.clone()).expect("must encode")
        );
    }

    #[test]
    fn false_flags_are_omitted() {
        let yml = encode(&mk_config()).expect("must encode");
        assert!(!yml.contains("manual"));
        assert!(!yml.contains("create"));
    }

    #[test]
    fn create_only_entry() {
        let config = decode(
            "agentName: web\nnamespace: demo\nworkloadName: web\nworkloadKind: Deployment\ncreate: true\n",
        )
        .expect("must decode");
        assert!(config.create);
        assert!(!config.manual);
        assert!(config.containers.is_empty());
        assert_eq!(config.agent_image, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode("{not yaml: [").is_err());
        assert!(decode("agentName: web\nbogusField: true\n").is_err());
    }

    #[test]
    fn workload_kind_strings() {
        for kind in [
            WorkloadKind::Deployment,
            WorkloadKind::ReplicaSet,
            WorkloadKind::StatefulSet,
        ] {
            assert_eq!(kind.to_string().parse::<WorkloadKind>().unwrap(), kind);
        }
        assert!("DaemonSet".parse::<WorkloadKind>().is_err());
    }
}
