//! Error types for knet-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for knet-core
#[derive(Error, Debug)]
pub enum Error {
    /// Workload API failures
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Sidecar patch generation failures
    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    /// Readiness polling failures
    #[error("Readiness error: {0}")]
    Poll(#[from] PollError),

    /// Exec stream failures
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// A diagnostic session ended in `Failed`
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Capture merge failures
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Fleet agent lifecycle errors
    #[error("Fleet error: {0}")]
    Fleet(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation was cancelled by the operator
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Gateway(err) => Some(err.remediation()),
            Self::Patch(err) => Some(err.remediation()),
            Self::Poll(err) => Some(err.remediation()),
            Self::Stream(err) => Some(err.remediation()),
            Self::Session(err) => Some(err.remediation()),
            Self::Merge(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Fleet(_) => Some(
                Remediation::new("Inspect the fleet agent DaemonSets and retry.")
                    .command("Agent pods", "kubectl -n kube-system get pods -l name=kata-deploy")
                    .alternative("Run `kubectl knet delete` to remove a partial deployment."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the output directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("The API returned an unexpected document; verify cluster version.")
                    .command("Server version", "kubectl version"),
            ),
            Self::Cancelled(_) => Some(
                Remediation::new("Operation was cancelled. Retry if the cancellation was unexpected.")
                    .alternative("Check whether an interrupt or timeout triggered the cancellation."),
            ),
        }
    }
}

/// Workload API gateway errors
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Requested object does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    /// Optimistic-concurrency rejection (HTTP 409); retryable
    #[error("conflicting update to {name}: {message}")]
    Conflict { name: String, message: String },

    /// Create rejected because the object already exists (HTTP 409 AlreadyExists)
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Any other API server rejection
    #[error("API server rejected request ({code} {reason}): {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },

    /// Connection, TLS or upgrade failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// Request or response could not be (de)serialized
    #[error("encoding failure: {0}")]
    Encoding(String),
}

impl GatewayError {
    /// Returns true for optimistic-concurrency conflicts.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true when a create hit an existing object.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true when the object was not found.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for failures that may clear up on their own
    /// (network blips, throttling, server-side 5xx).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Conflict { .. } => true,
            Self::Api { code, .. } => *code == 429 || *code >= 500,
            Self::NotFound { .. } | Self::AlreadyExists { .. } | Self::Encoding(_) => false,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::NotFound {
                kind,
                namespace,
                name,
            } => Remediation::new(format!("{kind} {name} does not exist in {namespace}."))
                .command("List pods", format!("kubectl -n {namespace} get pods"))
                .alternative("Pass the correct namespace with -n."),
            Self::Conflict { name, .. } => Remediation::new(format!(
                "{name} was modified concurrently. Retry the command."
            ))
            .alternative("Avoid running several knet sessions against one pod at the same instant."),
            Self::AlreadyExists { kind, name } => {
                Remediation::new(format!("{kind} {name} is left over from an earlier run."))
                    .command("Remove leftovers", "kubectl knet delete")
            }
            Self::Api { code, .. } if *code == 401 || *code == 403 => {
                Remediation::new("The current context lacks permission for this operation.")
                    .command(
                        "Check permission",
                        "kubectl auth can-i patch pods/ephemeralcontainers",
                    )
                    .alternative("Switch to a context with sufficient RBAC rights.")
            }
            Self::Api { .. } => Remediation::new("The API server rejected the request.")
                .command("Server version", "kubectl version")
                .alternative("Ephemeral containers require Kubernetes 1.25 or newer."),
            Self::Transport(_) => Remediation::new("Could not reach the API server.")
                .command("Cluster info", "kubectl cluster-info")
                .alternative("Check the current kubeconfig context and network access."),
            Self::Encoding(_) => {
                Remediation::new("The API returned an unexpected document; verify cluster version.")
                    .command("Server version", "kubectl version")
            }
        }
    }
}

/// Sidecar patch generation errors
#[derive(Error, Debug)]
pub enum PatchError {
    /// The pod could not be serialized to JSON
    #[error("failed to serialize pod {pod}: {source}")]
    Encoding {
        pod: String,
        #[source]
        source: serde_json::Error,
    },

    /// Generation produced no mutation
    #[error("no mutation for pod {pod}: ephemeral container {sidecar} is already present")]
    Diff { pod: String, sidecar: String },
}

impl PatchError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Encoding { .. } => {
                Remediation::new("The pod object could not be encoded; report this as a bug.")
            }
            Self::Diff { pod, .. } => Remediation::new(format!(
                "A sidecar with the same name already exists in {pod}. Retry to generate a new name."
            ))
            .command(
                "Ephemeral containers",
                format!("kubectl get pod {pod} -o jsonpath='{{.spec.ephemeralContainers[*].name}}'"),
            ),
        }
    }
}

/// Readiness polling errors
#[derive(Error, Debug, Clone)]
pub enum PollError {
    /// Deadline elapsed before the predicate held
    #[error(
        "timed out after {elapsed_ms}ms waiting for {expected} (polls={polls}, last_observed={})",
        .last_observed.as_deref().unwrap_or("<none>")
    )]
    Timeout {
        expected: String,
        last_observed: Option<String>,
        polls: usize,
        elapsed_ms: u64,
    },

    /// A state was observed that can never satisfy the predicate
    #[error("{expected} can never be satisfied: {reason}")]
    TerminalState { expected: String, reason: String },

    /// Non-transient gateway failure while listing
    #[error("gateway failure while waiting for {expected}: {source}")]
    Gateway {
        expected: String,
        #[source]
        source: GatewayError,
    },

    /// Caller cancelled the wait
    #[error("wait for {expected} cancelled")]
    Cancelled { expected: String },
}

impl PollError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Timeout { .. } => {
                Remediation::new("The resource did not become ready in time.")
                    .command("Recent events", "kubectl get events --sort-by=.lastTimestamp")
                    .alternative("Raise the readiness timeout with --ready-timeout.")
            }
            Self::TerminalState { .. } => Remediation::new(
                "The resource reached a state it cannot recover from. Inspect it and retry.",
            )
            .command("Describe pod", "kubectl describe pod <pod>"),
            Self::Gateway { source, .. } => source.remediation(),
            Self::Cancelled { .. } => {
                Remediation::new("The wait was interrupted. Retry if that was unexpected.")
            }
        }
    }
}

/// Exec stream errors
#[derive(Error, Debug)]
pub enum StreamError {
    /// Connection failed before an exit status was seen; remote state unknown
    #[error("exec stream lost before an exit status was observed: {0}")]
    Transport(String),

    /// Remote command exited non-zero; terminal and known
    #[error("remote command exited with status {code}")]
    RemoteExit { code: i32 },

    /// Remote side refused or aborted the command without an exit code
    #[error("remote command failed: {0}")]
    Rejected(String),

    /// Local sink rejected bytes
    #[error("capture sink write failed: {0}")]
    Sink(#[source] std::io::Error),
}

impl StreamError {
    /// Returns true when the remote process may still be running.
    #[must_use]
    pub fn remote_state_unknown(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Transport(_) => Remediation::new(
                "The exec connection dropped; the remote command may still be running.",
            )
            .command("Check processes", "kubectl exec <pod> -c <sidecar> -- ps")
            .alternative("Delete the pod's sidecar by restarting the pod if it keeps running."),
            Self::RemoteExit { code } => Remediation::new(format!(
                "The diagnostic command exited with status {code}."
            ))
            .command("Sidecar logs", "kubectl logs <pod> -c <sidecar>")
            .alternative("Check the capture interface and filter arguments."),
            Self::Rejected(_) => Remediation::new("The container runtime refused to run the command.")
                .command("Describe pod", "kubectl describe pod <pod>")
                .alternative("Check that the sidecar image ships the diagnostic tool."),
            Self::Sink(_) => Remediation::new("The local capture destination stopped accepting data.")
                .alternative("Check free disk space or whether the viewer process exited."),
        }
    }
}

/// Per-session terminal errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Target pod is finished and cannot host a sidecar
    #[error("pod {pod} is in terminal phase {phase}")]
    TerminalState { pod: String, phase: String },

    /// Target could not be resolved to a pod/container
    #[error("target validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("sidecar never became ready: {0}")]
    Readiness(#[from] PollError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Capture sink could not be opened
    #[error("failed to open capture sink: {0}")]
    Sink(String),

    /// Operator cancelled before capture began
    #[error("cancelled before capture started")]
    Cancelled,

    /// Session task died without reporting
    #[error("session task aborted: {0}")]
    Aborted(String),
}

impl SessionError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::TerminalState { pod, .. } => Remediation::new(format!(
                "Cannot capture on {pod} because it has already finished."
            ))
            .command("Pod status", format!("kubectl get pod {pod}"))
            .alternative("Pick a running pod."),
            Self::Validation(_) => Remediation::new("Check the pod and container names.")
                .command(
                    "Containers",
                    "kubectl get pod <pod> -o jsonpath='{.spec.containers[*].name}'",
                ),
            Self::Gateway(err) => err.remediation(),
            Self::Patch(err) => err.remediation(),
            Self::Readiness(err) => err.remediation(),
            Self::Stream(err) => err.remediation(),
            Self::Sink(_) => Remediation::new("The capture destination could not be opened.")
                .alternative("Check the output directory or viewer command in knet.toml."),
            Self::Cancelled => Remediation::new("The session was interrupted before streaming."),
            Self::Aborted(_) => Remediation::new("A session task panicked. Check logs and retry."),
        }
    }
}

/// Merge finalizer errors
#[derive(Error, Debug)]
pub enum MergeError {
    /// Nothing to merge
    #[error("no capture artifacts to merge")]
    NoInputs,

    /// Merge tool could not be spawned
    #[error("failed to start merge tool {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// Merge tool exited non-zero
    #[error("merge tool {tool} exited with status {}: {stderr}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Failed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl MergeError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::NoInputs => Remediation::new("No session produced capture data."),
            Self::Spawn { tool, .. } => Remediation::new(format!("Install {tool} and retry."))
                .command("Install (Debian/Ubuntu)", "sudo apt install wireshark-common")
                .command("Install (macOS)", "brew install wireshark")
                .alternative("Set [merge] tool in knet.toml to another merge utility."),
            Self::Failed { .. } => Remediation::new(
                "The merge tool rejected the inputs; the per-target captures are kept.",
            )
            .alternative("Merge the per-target files manually."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Invalid config: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ReadFailed(path, _) => Remediation::new(format!("Check that {path} is readable."))
                .command("Show file", format!("ls -la {path}")),
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax in knet.toml.")
                .alternative("Remove the file to fall back to defaults."),
            Self::ValidationError(_) => Remediation::new("Fix the invalid value in knet.toml.")
                .alternative("Intervals, attempts and commands must be non-zero/non-empty."),
        }
    }
}

/// Render an error with its remediation block.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
