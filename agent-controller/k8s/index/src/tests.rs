use crate::{
    generate::{GenerateError, Generator},
    rollout::rollout_reason,
    snapshot::{Entry, Snapshot},
    updater::{merge_pending, ConfigUpdater},
    workload::Workload,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use interpose_agent_controller_core::{
    encode, ContainerConfig, SidecarConfig, WorkloadKind, AGENT_CONTAINER_NAME, SLEEPER_ARGS,
    SLEEPER_IMAGE,
};
use interpose_agent_controller_k8s_api as k8s;
use std::collections::BTreeMap;

fn observed(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn entry(name: &str, value: &str) -> Entry {
    Entry {
        name: name.to_string(),
        namespace: "demo".to_string(),
        value: value.to_string(),
    }
}

// === Snapshot ===

#[test]
fn snapshot_update_emits_adds_changes_and_removals() {
    let mut snap = Snapshot::default();

    let (dels, mods) = snap.update("demo", Some(&observed(&[("web", "a"), ("api", "b")])));
    assert!(dels.is_empty());
    assert_eq!(mods.len(), 2);
    assert_eq!(snap.get("demo", "web"), Some("a"));
    assert_eq!(snap.get("demo", "api"), Some("b"));

    // Unchanged data emits nothing.
    let (dels, mods) = snap.update("demo", Some(&observed(&[("web", "a"), ("api", "b")])));
    assert!(dels.is_empty());
    assert!(mods.is_empty());

    // One value changed, one key removed.
    let (dels, mods) = snap.update("demo", Some(&observed(&[("web", "a2")])));
    assert_eq!(dels, vec![entry("api", "b")]);
    assert_eq!(mods, vec![entry("web", "a2")]);
    assert_eq!(snap.get("demo", "web"), Some("a2"));
    assert_eq!(snap.get("demo", "api"), None);
}

#[test]
fn snapshot_document_deletion_removes_everything() {
    let mut snap = Snapshot::default();
    snap.update("demo", Some(&observed(&[("web", "a"), ("api", "b")])));

    let (mut dels, mods) = snap.update("demo", None);
    dels.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(dels, vec![entry("api", "b"), entry("web", "a")]);
    assert!(mods.is_empty());
    assert_eq!(snap.get("demo", "web"), None);
}

#[test]
fn snapshot_is_namespaced() {
    let mut snap = Snapshot::default();
    snap.update("demo", Some(&observed(&[("web", "a")])));
    snap.update("prod", Some(&observed(&[("web", "b")])));

    assert_eq!(snap.get("demo", "web"), Some("a"));
    assert_eq!(snap.get("prod", "web"), Some("b"));

    let (dels, _) = snap.update("demo", None);
    assert_eq!(dels.len(), 1);
    assert_eq!(snap.get("prod", "web"), Some("b"));
}

// === Rollout necessity ===

struct StubGenerator;

#[async_trait::async_trait]
impl Generator for StubGenerator {
    async fn generate(
        &self,
        _workload: &Workload,
        _prior: Option<&SidecarConfig>,
    ) -> Result<SidecarConfig, GenerateError> {
        Err(GenerateError::NoAgentImage)
    }

    fn agent_container(&self, _pod: &k8s::Pod, config: &SidecarConfig) -> k8s::Container {
        k8s::Container {
            name: AGENT_CONTAINER_NAME.to_string(),
            image: config.agent_image.clone(),
            args: Some(vec!["agent".to_string()]),
            ..Default::default()
        }
    }
}

fn mk_pod(name: &str, containers: Vec<k8s::Container>, running: bool) -> k8s::Pod {
    k8s::Pod {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("demo".to_string()),
            ..Default::default()
        },
        spec: Some(k8s::PodSpec {
            containers,
            ..Default::default()
        }),
        status: running.then(|| k8s::PodStatus {
            container_statuses: Some(vec![k8s::ContainerStatus {
                state: Some(k8s::ContainerState {
                    running: Some(k8s::ContainerStateRunning {
                        started_at: Some(k8s::Time(chrono::offset::Utc::now())),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

fn app_container(name: &str) -> k8s::Container {
    k8s::Container {
        name: name.to_string(),
        image: Some("example.com/app:1".to_string()),
        ..Default::default()
    }
}

fn sleeper_container(name: &str) -> k8s::Container {
    k8s::Container {
        name: name.to_string(),
        image: Some(SLEEPER_IMAGE.to_string()),
        args: Some(SLEEPER_ARGS.iter().map(|s| s.to_string()).collect()),
        ..Default::default()
    }
}

fn agent_container(image: &str) -> k8s::Container {
    k8s::Container {
        name: AGENT_CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        args: Some(vec!["agent".to_string()]),
        ..Default::default()
    }
}

fn desired(replace: bool) -> SidecarConfig {
    SidecarConfig {
        agent_name: "web".to_string(),
        namespace: "demo".to_string(),
        workload_name: "web".to_string(),
        workload_kind: WorkloadKind::Deployment,
        agent_image: Some("ghcr.io/interpose/agent:1".to_string()),
        containers: vec![ContainerConfig {
            name: "app".to_string(),
            replace,
            intercepts: Vec::new(),
        }],
        ..Default::default()
    }
}

#[test]
fn no_rollout_when_pods_match_desired_state() {
    let config = desired(false);
    let pods = vec![mk_pod(
        "web-1",
        vec![
            app_container("app"),
            agent_container("ghcr.io/interpose/agent:1"),
        ],
        true,
    )];
    assert_eq!(rollout_reason(&pods, Some(&config), &StubGenerator), None);
}

#[test]
fn no_rollout_when_no_agent_desired_and_none_present() {
    let pods = vec![mk_pod("web-1", vec![app_container("app")], true)];
    assert_eq!(rollout_reason(&pods, None, &StubGenerator), None);
}

#[test]
fn rollout_when_agent_missing() {
    let config = desired(false);
    let pods = vec![mk_pod("web-1", vec![app_container("app")], true)];
    assert!(rollout_reason(&pods, Some(&config), &StubGenerator).is_some());
}

#[test]
fn rollout_when_agent_present_but_not_desired() {
    let pods = vec![mk_pod(
        "web-1",
        vec![
            app_container("app"),
            agent_container("ghcr.io/interpose/agent:1"),
        ],
        true,
    )];
    assert!(rollout_reason(&pods, None, &StubGenerator).is_some());
}

#[test]
fn rollout_when_agent_differs_from_generated() {
    let config = desired(false);
    let pods = vec![mk_pod(
        "web-1",
        vec![
            app_container("app"),
            agent_container("ghcr.io/interpose/agent:0"),
        ],
        true,
    )];
    assert!(rollout_reason(&pods, Some(&config), &StubGenerator).is_some());
}

#[test]
fn rollout_when_replaced_container_is_not_disabled() {
    let config = desired(true);
    let pods = vec![mk_pod(
        "web-1",
        vec![
            app_container("app"),
            agent_container("ghcr.io/interpose/agent:1"),
        ],
        true,
    )];
    assert!(rollout_reason(&pods, Some(&config), &StubGenerator).is_some());
}

#[test]
fn no_rollout_when_replaced_container_is_disabled() {
    let config = desired(true);
    let pods = vec![mk_pod(
        "web-1",
        vec![
            sleeper_container("app"),
            agent_container("ghcr.io/interpose/agent:1"),
        ],
        true,
    )];
    assert_eq!(rollout_reason(&pods, Some(&config), &StubGenerator), None);
}

#[test]
fn rollout_when_container_is_disabled_but_should_not_be() {
    let config = desired(false);
    let pods = vec![mk_pod(
        "web-1",
        vec![
            sleeper_container("app"),
            agent_container("ghcr.io/interpose/agent:1"),
        ],
        true,
    )];
    assert!(rollout_reason(&pods, Some(&config), &StubGenerator).is_some());
}

#[test]
fn rollout_when_declared_container_is_missing() {
    let config = desired(false);
    let pods = vec![mk_pod(
        "web-1",
        vec![agent_container("ghcr.io/interpose/agent:1")],
        true,
    )];
    assert!(rollout_reason(&pods, Some(&config), &StubGenerator).is_some());
}

#[test]
fn rollout_when_no_running_pods_and_agent_desired() {
    let config = desired(false);
    assert!(rollout_reason(&[], Some(&config), &StubGenerator).is_some());

    // Pods that have not started yet don't count.
    let pods = vec![mk_pod("web-1", vec![app_container("app")], false)];
    assert!(rollout_reason(&pods, Some(&config), &StubGenerator).is_some());
}

#[test]
fn no_rollout_when_no_pods_and_no_agent_desired() {
    assert_eq!(rollout_reason(&[], None, &StubGenerator), None);
}

// === Update coalescing ===

fn manual_entry(name: &str) -> String {
    encode(&SidecarConfig {
        agent_name: name.to_string(),
        namespace: "demo".to_string(),
        workload_name: name.to_string(),
        manual: true,
        ..Default::default()
    })
    .expect("must encode")
}

#[test]
fn merge_never_overwrites_manual_entries() {
    // An existing manual entry is protected even from a non-manual pending
    // value, and a pending value flagged manual is never written.
    let legacy = manual_entry("legacy");
    let base = observed(&[("legacy", &legacy)]);
    let current = base.clone();
    let mut pending = HashMap::new();
    pending.insert("legacy".to_string(), "reconciler-generated".to_string());
    pending.insert("late".to_string(), manual_entry("late"));
    pending.insert("web".to_string(), "fresh".to_string());

    let (merged, publish) = merge_pending(base, &current, &pending, &HashSet::new(), "demo");
    assert_eq!(merged.get("legacy"), Some(&legacy));
    assert_eq!(merged.get("late"), None);
    assert_eq!(merged.get("web").map(String::as_str), Some("fresh"));
    assert!(publish.is_empty());
}

#[test]
fn merge_skips_values_already_current_in_document() {
    // The live document already carries the pending value; the snapshot just
    // hasn't caught up.
    let base = observed(&[]);
    let current = observed(&[("web", "fresh")]);
    let mut pending = HashMap::new();
    pending.insert("web".to_string(), "fresh".to_string());

    let (merged, publish) =
        merge_pending(base, &current, &pending, &HashSet::new(), "demo");
    assert!(merged.is_empty());
    assert!(publish.is_empty());
}

#[test]
fn merge_publishes_opted_in_entries_to_snapshot() {
    let mut pending = HashMap::new();
    pending.insert("web".to_string(), "fresh".to_string());
    let mut opt_in = HashSet::new();
    opt_in.insert("web".to_string());

    let (merged, publish) =
        merge_pending(BTreeMap::new(), &BTreeMap::new(), &pending, &opt_in, "demo");
    assert_eq!(merged.get("web").map(String::as_str), Some("fresh"));
    assert_eq!(publish, vec![("web".to_string(), "fresh".to_string())]);
}

#[test]
fn committed_updater_rejects_new_entries() {
    let updater = ConfigUpdater::new("demo");
    assert!(updater.add("web", "a".to_string(), false));
    updater.mark_updated();
    assert!(!updater.add("api", "b".to_string(), false));
}

#[tokio::test]
async fn updater_waiters_share_the_result() {
    let updater = ConfigUpdater::new("demo");
    let waiter = {
        let updater = updater.clone();
        tokio::spawn(async move { updater.wait().await })
    };
    updater.complete(Ok(()));
    assert!(waiter.await.expect("waiter must not panic").is_ok());
    // Late waiters still observe the result.
    assert!(updater.wait().await.is_ok());

    let failed = ConfigUpdater::new("demo");
    failed.complete(Err(std::sync::Arc::new(anyhow::anyhow!("boom"))));
    let err = failed.wait().await.expect_err("must fail");
    assert!(err.to_string().contains("boom"));
}
