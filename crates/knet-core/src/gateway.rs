//! Workload API gateway
//!
//! Every component talks to the cluster through one shared
//! [`WorkloadGateway`] handle. [`crate::kube_gateway::KubeGateway`] is the
//! production implementation; tests supply an in-memory one.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Pod, ServiceAccount};
use k8s_openapi::api::node::v1::RuntimeClass;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::GatewayError;

/// Boxed remote-to-local byte stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed local-to-remote byte stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared, immutable gateway handle.
pub type SharedGateway = Arc<dyn WorkloadGateway>;

/// Exit status reported by the remote side of an exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Success,
    /// Command ran and exited non-zero.
    Exit(i32),
    /// Command was refused or aborted without an exit code.
    Failure(String),
}

/// Parameters for [`WorkloadGateway::open_exec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl ExecRequest {
    /// Output-only exec, the shape used for captures.
    #[must_use]
    pub fn capture(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
        command: Vec<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
            command,
            stdin: false,
            stdout: true,
            stderr: true,
        }
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: bool) -> Self {
        self.stdin = stdin;
        self
    }
}

/// Channels of an open exec. A channel is `None` when it was not requested.
///
/// `status` resolves once the remote command finishes; `None` means the
/// connection ended without an exit status.
pub struct ExecChannels {
    pub stdin: Option<BoxedWriter>,
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
    pub status: BoxFuture<'static, Option<RemoteStatus>>,
}

impl fmt::Debug for ExecChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecChannels")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish_non_exhaustive()
    }
}

/// Kinds of object the fleet lifecycle creates and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    DaemonSet,
    RuntimeClass,
}

impl ResourceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServiceAccount => "ServiceAccount",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::DaemonSet => "DaemonSet",
            Self::RuntimeClass => "RuntimeClass",
        }
    }

    /// Whether objects of this kind live in a namespace.
    #[must_use]
    pub const fn is_namespaced(self) -> bool {
        matches!(self, Self::ServiceAccount | Self::DaemonSet)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a fleet object for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    /// `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {ns}/{}", self.kind, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Typed fleet object for creation.
#[derive(Debug, Clone)]
pub enum FleetResource {
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    DaemonSet(DaemonSet),
    RuntimeClass(RuntimeClass),
}

impl FleetResource {
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::ServiceAccount(_) => ResourceKind::ServiceAccount,
            Self::ClusterRole(_) => ResourceKind::ClusterRole,
            Self::ClusterRoleBinding(_) => ResourceKind::ClusterRoleBinding,
            Self::DaemonSet(_) => ResourceKind::DaemonSet,
            Self::RuntimeClass(_) => ResourceKind::RuntimeClass,
        }
    }

    /// Reference naming the same object.
    #[must_use]
    pub fn reference(&self) -> ResourceRef {
        let meta = match self {
            Self::ServiceAccount(o) => &o.metadata,
            Self::ClusterRole(o) => &o.metadata,
            Self::ClusterRoleBinding(o) => &o.metadata,
            Self::DaemonSet(o) => &o.metadata,
            Self::RuntimeClass(o) => &o.metadata,
        };
        let kind = self.kind();
        ResourceRef {
            kind,
            namespace: if kind.is_namespaced() {
                meta.namespace.clone()
            } else {
                None
            },
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

/// Access to the workload API.
#[async_trait]
pub trait WorkloadGateway: Send + Sync {
    /// Fetch one pod. Missing pods are `GatewayError::NotFound`.
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, GatewayError>;

    /// List pods matching a label selector.
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, GatewayError>;

    /// Apply a JSON merge patch to the pod's ephemeral-containers subresource.
    async fn patch_ephemeral(
        &self,
        namespace: &str,
        name: &str,
        merge_patch: &[u8],
    ) -> Result<Pod, GatewayError>;

    /// Start a command inside a container.
    async fn open_exec(&self, request: &ExecRequest) -> Result<ExecChannels, GatewayError>;

    async fn create_resource(&self, resource: &FleetResource) -> Result<(), GatewayError>;

    async fn delete_resource(&self, resource: &ResourceRef) -> Result<(), GatewayError>;
}

/// Phase string of a pod, if reported.
#[must_use]
pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Pod name or an empty string.
#[must_use]
pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

/// Pods in `Succeeded` or `Failed` can never run another container.
#[must_use]
pub fn is_finished(pod: &Pod) -> bool {
    matches!(pod_phase(pod), Some("Succeeded" | "Failed"))
}
