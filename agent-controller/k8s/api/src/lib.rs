#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;

pub use self::labels::{Labels, Selector};
pub use k8s_openapi::api::{
    apps::v1::{Deployment, ReplicaSet, StatefulSet},
    core::v1::{
        ConfigMap, Container, ContainerPort, ContainerState, ContainerStateRunning,
        ContainerStatus, Pod, PodSpec, PodStatus, PodTemplateSpec, Service, ServicePort,
        ServiceSpec,
    },
};
pub use k8s_openapi::apimachinery::pkg::{
    apis::meta::v1::Time, util::intstr::IntOrString,
};
pub use kube::{
    api::{
        Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource,
        ResourceExt,
    },
    error::ErrorResponse,
    runtime::watcher,
    Client, Error,
};

/// Indicates whether an API error reports a missing object.
pub fn is_not_found(error: &Error) -> bool {
    matches!(error, Error::Api(ErrorResponse { code: 404, .. }))
}
