//! Shared test infrastructure for knet-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::{FakeGateway, RecordingMerger};
//! ```

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus,
    EphemeralContainer, Pod, PodCondition, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::io::AsyncWriteExt;
use tokio::sync::Barrier;

use knet_core::error::{GatewayError, MergeError};
use knet_core::gateway::{
    BoxedReader, BoxedWriter, ExecChannels, ExecRequest, FleetResource, RemoteStatus,
    ResourceKind, ResourceRef, WorkloadGateway,
};
use knet_core::merge::ArtifactMerger;
use knet_core::patch::apply_merge_patch;
use knet_core::poll::PollSchedule;
use knet_core::retry::RetryPolicy;
use knet_core::session::SessionSettings;

// =============================================================================
// Pod fixtures
// =============================================================================

/// A Running, Ready pod with the given app containers.
pub fn running_pod(namespace: &str, name: &str, containers: &[&str]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some("1".to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            node_name: Some("node-a".to_string()),
            containers: containers
                .iter()
                .map(|c| Container {
                    name: (*c).to_string(),
                    image: Some("nginx".to_string()),
                    ..Container::default()
                })
                .collect(),
            ..PodSpec::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..PodCondition::default()
            }]),
            container_statuses: Some(
                containers
                    .iter()
                    .map(|c| ContainerStatus {
                        name: (*c).to_string(),
                        container_id: Some(format!("containerd://{c}-0001")),
                        ..ContainerStatus::default()
                    })
                    .collect(),
            ),
            ..PodStatus::default()
        }),
    }
}

/// A pod that already ran to completion.
pub fn finished_pod(namespace: &str, name: &str, phase: &str) -> Pod {
    let mut pod = running_pod(namespace, name, &["app"]);
    if let Some(status) = pod.status.as_mut() {
        status.phase = Some(phase.to_string());
        status.conditions = None;
    }
    pod
}

fn with_labels(mut pod: Pod, labels: BTreeMap<String, String>) -> Pod {
    pod.metadata.labels = Some(labels);
    pod
}

fn running_state() -> ContainerState {
    ContainerState {
        running: Some(ContainerStateRunning::default()),
        ..ContainerState::default()
    }
}

fn waiting_state(reason: &str) -> ContainerState {
    ContainerState {
        waiting: Some(ContainerStateWaiting {
            reason: Some(reason.to_string()),
            ..ContainerStateWaiting::default()
        }),
        ..ContainerState::default()
    }
}

/// Session settings with millisecond-scale waits.
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        image: "nicolaka/netshoot".to_string(),
        sidecar_lifetime: Duration::from_secs(60),
        command: ["tcpdump", "-U", "-w", "-", "-i", "any"]
            .iter()
            .map(ToString::to_string)
            .collect(),
        retry: RetryPolicy::new(
            Duration::from_millis(5),
            Duration::from_millis(20),
            2.0,
            0.0,
            3,
        ),
        ready: PollSchedule::new(Duration::from_millis(10), Duration::from_secs(2)),
    }
}

// =============================================================================
// Fake gateway
// =============================================================================

/// What an exec into a pod produces.
#[derive(Debug, Clone)]
pub enum ExecScript {
    /// Write `stdout`, close it, then report `status`.
    Finish { stdout: Vec<u8>, status: RemoteStatus },
    /// Write `stdout` and keep the stream open forever.
    Hold { stdout: Vec<u8> },
}

impl Default for ExecScript {
    fn default() -> Self {
        Self::Finish {
            stdout: Vec::new(),
            status: RemoteStatus::Success,
        }
    }
}

/// How an injected sidecar comes up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Readiness {
    /// Running as soon as it is injected.
    #[default]
    Immediate,
    /// Stuck waiting with this reason.
    Waiting(String),
    /// Waiting for this many reads of the pod, then running.
    AfterReads(u32),
}

type PodKey = (String, String);

#[derive(Default)]
struct State {
    pods: BTreeMap<PodKey, Pod>,
    concurrent_writers: u32,
    concurrent_writes: u32,
    patch_gate: Option<(Arc<Barrier>, u32)>,
    readiness: HashMap<String, Readiness>,
    starting: HashMap<PodKey, u32>,
    patch_calls: u32,
    scripts: HashMap<String, ExecScript>,
    execs: Vec<ExecRequest>,
    objects: HashSet<ResourceRef>,
    events: Vec<String>,
}

/// In-memory cluster.
///
/// Patches are applied with merge-patch semantics. Like the API server, a
/// patch naming a stale `metadata.resourceVersion` is rejected with a
/// conflict, a patch dropping an existing ephemeral container is rejected as
/// invalid, and every accepted write bumps the version. Injected sidecars
/// come up per pod [`Readiness`]. Creating a DaemonSet schedules one Running
/// pod (`<name>-node-a`) carrying the template labels; deleting it removes
/// that pod.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<State>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pod(&self, pod: Pod) {
        let key = (
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        self.state.lock().unwrap().pods.insert(key, pod);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .unwrap()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Let another writer land a sidecar named `other-<k>` just before each
    /// of the next `n` patches, so those patches carry a stale version.
    pub fn concurrent_writers(&self, n: u32) {
        self.state.lock().unwrap().concurrent_writers = n;
    }

    /// Hold the next `n` patches until all of them have arrived, so they are
    /// all generated from the same pod version.
    pub fn gate_patches(&self, n: u32) {
        let n_usize = usize::try_from(n).unwrap();
        self.state.lock().unwrap().patch_gate = Some((Arc::new(Barrier::new(n_usize)), n));
    }

    /// How sidecars injected into `pod` come up.
    pub fn script_readiness(&self, pod: &str, readiness: Readiness) {
        self.state
            .lock()
            .unwrap()
            .readiness
            .insert(pod.to_string(), readiness);
    }

    pub fn script_exec(&self, pod: &str, script: ExecScript) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(pod.to_string(), script);
    }

    pub fn patch_calls(&self) -> u32 {
        self.state.lock().unwrap().patch_calls
    }

    pub fn exec_requests(&self) -> Vec<ExecRequest> {
        self.state.lock().unwrap().execs.clone()
    }

    /// Ordered create/delete/exec log.
    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().unwrap().events.clear();
    }
}

fn ephemeral_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .and_then(|s| s.ephemeral_containers.as_ref())
        .map(|list| list.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}

fn set_ephemeral_state(pod: &mut Pod, name: &str, state: ContainerState) {
    let statuses = pod
        .status
        .get_or_insert_with(PodStatus::default)
        .ephemeral_container_statuses
        .get_or_insert_with(Vec::new);
    statuses.retain(|s| s.name != name);
    statuses.push(ContainerStatus {
        name: name.to_string(),
        state: Some(state),
        ..ContainerStatus::default()
    });
}

fn start_waiting_sidecars(pod: &mut Pod) {
    if let Some(statuses) = pod
        .status
        .as_mut()
        .and_then(|s| s.ephemeral_container_statuses.as_mut())
    {
        for status in statuses {
            if status.state.as_ref().is_some_and(|s| s.waiting.is_some()) {
                status.state = Some(running_state());
            }
        }
    }
}

fn bump_version(pod: &mut Pod) {
    let next = pod
        .metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    pod.metadata.resource_version = Some(next.to_string());
}

fn not_found(namespace: &str, name: &str) -> GatewayError {
    GatewayError::NotFound {
        kind: "Pod".to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn matches_selector(pod: &Pod, selector: &str) -> bool {
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term.trim()),
        })
}

fn daemonset_pod(resource: &FleetResource) -> Option<Pod> {
    let FleetResource::DaemonSet(ds) = resource else {
        return None;
    };
    let namespace = ds.metadata.namespace.clone().unwrap_or_default();
    let name = ds.metadata.name.clone().unwrap_or_default();
    let labels = ds
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    let pod = running_pod(&namespace, &format!("{name}-node-a"), &["kube-kata"]);
    Some(with_labels(pod, labels))
}

fn stream_of(bytes: Vec<u8>, hold: bool) -> BoxedReader {
    let (reader, mut writer) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let _ = writer.write_all(&bytes).await;
        let _ = writer.flush().await;
        if hold {
            std::future::pending::<()>().await;
        }
    });
    Box::new(reader)
}

#[async_trait]
impl WorkloadGateway for FakeGateway {
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, GatewayError> {
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        if let Some(remaining) = state.starting.get_mut(&key) {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                state.starting.remove(&key);
                if let Some(pod) = state.pods.get_mut(&key) {
                    start_waiting_sidecars(pod);
                    bump_version(pod);
                }
            }
        }
        state
            .pods
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found(namespace, name))
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, GatewayError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && matches_selector(pod, label_selector))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn patch_ephemeral(
        &self,
        namespace: &str,
        name: &str,
        merge_patch: &[u8],
    ) -> Result<Pod, GatewayError> {
        let gate = {
            let mut state = self.state.lock().unwrap();
            match state.patch_gate.take() {
                Some((barrier, remaining)) => {
                    if remaining > 1 {
                        state.patch_gate = Some((Arc::clone(&barrier), remaining - 1));
                    }
                    Some(barrier)
                }
                None => None,
            }
        };
        if let Some(barrier) = gate {
            barrier.wait().await;
        }

        let mut state = self.state.lock().unwrap();
        state.patch_calls += 1;
        let key = (namespace.to_string(), name.to_string());

        if state.concurrent_writers > 0 && state.pods.contains_key(&key) {
            state.concurrent_writers -= 1;
            state.concurrent_writes += 1;
            let other = format!("other-{}", state.concurrent_writes);
            if let Some(pod) = state.pods.get_mut(&key) {
                pod.spec
                    .get_or_insert_with(PodSpec::default)
                    .ephemeral_containers
                    .get_or_insert_with(Vec::new)
                    .push(EphemeralContainer {
                        name: other.clone(),
                        image: Some("busybox".to_string()),
                        ..EphemeralContainer::default()
                    });
                set_ephemeral_state(pod, &other, running_state());
                bump_version(pod);
            }
        }

        let live = state
            .pods
            .get(&key)
            .ok_or_else(|| not_found(namespace, name))?;
        let patch: serde_json::Value =
            serde_json::from_slice(merge_patch).map_err(|e| GatewayError::Encoding(e.to_string()))?;

        let stale = patch
            .pointer("/metadata/resourceVersion")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|wanted| Some(wanted) != live.metadata.resource_version.as_deref());
        if stale {
            return Err(GatewayError::Conflict {
                name: name.to_string(),
                message: "the object has been modified".to_string(),
            });
        }

        let before = ephemeral_names(live);
        let mut doc = serde_json::to_value(live).map_err(|e| GatewayError::Encoding(e.to_string()))?;
        apply_merge_patch(&mut doc, &patch);
        let mut patched: Pod =
            serde_json::from_value(doc).map_err(|e| GatewayError::Encoding(e.to_string()))?;
        let after = ephemeral_names(&patched);
        if !before.iter().all(|n| after.contains(n)) {
            return Err(GatewayError::Api {
                code: 422,
                reason: "Invalid".to_string(),
                message: "existing ephemeral containers may not be removed".to_string(),
            });
        }

        let readiness = state.readiness.get(name).cloned().unwrap_or_default();
        for added in after.iter().filter(|n| !before.contains(n)) {
            let sidecar_state = match &readiness {
                Readiness::Immediate => running_state(),
                Readiness::Waiting(reason) => waiting_state(reason),
                Readiness::AfterReads(_) => waiting_state("ContainerCreating"),
            };
            set_ephemeral_state(&mut patched, added, sidecar_state);
        }
        if let Readiness::AfterReads(reads) = readiness {
            state.starting.insert(key.clone(), reads);
        }
        bump_version(&mut patched);
        state.pods.insert(key, patched.clone());
        Ok(patched)
    }

    async fn open_exec(&self, request: &ExecRequest) -> Result<ExecChannels, GatewayError> {
        let script = {
            let mut state = self.state.lock().unwrap();
            state.execs.push(request.clone());
            state
                .events
                .push(format!("exec {}/{}", request.namespace, request.pod));
            state.scripts.get(&request.pod).cloned().unwrap_or_default()
        };

        let stdin = request
            .stdin
            .then(|| Box::new(tokio::io::sink()) as BoxedWriter);
        let (stdout, status) = match script {
            ExecScript::Finish { stdout, status } => (
                stream_of(stdout, false),
                async move { Some(status) }.boxed(),
            ),
            ExecScript::Hold { stdout } => (
                stream_of(stdout, true),
                futures::future::pending::<Option<RemoteStatus>>().boxed(),
            ),
        };

        Ok(ExecChannels {
            stdin,
            stdout: Some(stdout),
            stderr: Some(stream_of(b"listening on any\n".to_vec(), false)),
            status,
        })
    }

    async fn create_resource(&self, resource: &FleetResource) -> Result<(), GatewayError> {
        let reference = resource.reference();
        let pod = daemonset_pod(resource);
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("create {reference}"));
        if !state.objects.insert(reference.clone()) {
            return Err(GatewayError::AlreadyExists {
                kind: reference.kind.to_string(),
                name: reference.name,
            });
        }
        if let Some(pod) = pod {
            let key = (
                pod.metadata.namespace.clone().unwrap_or_default(),
                pod.metadata.name.clone().unwrap_or_default(),
            );
            state.pods.insert(key, pod);
        }
        Ok(())
    }

    async fn delete_resource(&self, resource: &ResourceRef) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("delete {resource}"));
        if !state.objects.remove(resource) {
            return Err(GatewayError::NotFound {
                kind: resource.kind.to_string(),
                namespace: resource.namespace.clone().unwrap_or_default(),
                name: resource.name.clone(),
            });
        }
        if resource.kind == ResourceKind::DaemonSet {
            let selector = format!("name={}", resource.name);
            state
                .pods
                .retain(|_, pod| !matches_selector(pod, &selector));
        }
        Ok(())
    }
}

// =============================================================================
// Recording merger
// =============================================================================

/// Records every merge call and returns a fixed output path.
#[derive(Default)]
pub struct RecordingMerger {
    calls: Mutex<Vec<Vec<PathBuf>>>,
}

impl RecordingMerger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Vec<PathBuf>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactMerger for RecordingMerger {
    async fn merge(&self, inputs: &[PathBuf]) -> Result<PathBuf, MergeError> {
        self.calls.lock().unwrap().push(inputs.to_vec());
        if inputs.is_empty() {
            return Err(MergeError::NoInputs);
        }
        Ok(PathBuf::from("merged.pcap"))
    }
}
