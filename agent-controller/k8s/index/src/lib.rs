//! Interpose agent-configuration reconciler
//!
//! The reconciler keeps the per-namespace agents ConfigMap and the pods of the
//! workloads it names in agreement:
//!
//! - A ConfigMap watch diffs every observed document against an in-memory
//!   snapshot and emits an entry event for each added, changed, or removed
//!   key.
//! - A single dispatcher task consumes those events. Added or changed entries
//!   either get a spec generated for them (`create` placeholders) or trigger a
//!   rollout of the workload; removed entries trigger a rollout that strips
//!   the agent from running pods.
//! - A Service watch maps Service changes back onto the agent configs they
//!   affect, either by an intercepted Service UID or by the Service's selector
//!   newly matching a workload's pod template, and regenerates those entries.
//! - All ConfigMap writes go through a per-namespace coalescer that batches
//!   concurrent stores into a single create-or-replace and refuses to touch
//!   user-authored (`manual`) entries.
//!
//! Rollouts are forced indirectly: the workload's pod template gets a
//! restart-timestamp annotation patch (or, for ReplicaSets, a scale down/up
//! cycle), and the native controller replaces the pods.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod config;
mod dispatch;
mod generate;
mod index;
mod regenerate;
mod rollout;
mod service;
mod snapshot;
mod updater;
mod workload;

#[cfg(test)]
mod tests;

pub use self::{
    config::ControllerConfig,
    dispatch::Controller,
    generate::{GenerateError, Generator, TemplateGenerator},
    index::{ConfigMapIndex, Hooks, Reconciler, RolloutHooks, SharedConfigMapIndex},
    regenerate::regenerate_agent_maps,
    rollout::Rollout,
    service::{ServiceController, ServiceIndex, SharedServiceIndex, SvcEvent},
    snapshot::Entry,
    workload::Workload,
};
