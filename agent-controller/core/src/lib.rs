#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod agent;

pub use self::agent::{
    decode, encode, CodecError, ContainerConfig, Intercept, InvalidWorkloadKind, SidecarConfig,
    WorkloadKind, AGENTS_CONFIGMAP_NAME, AGENT_CONTAINER_NAME, SLEEPER_ARGS, SLEEPER_IMAGE,
};
