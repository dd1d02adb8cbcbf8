//! Diagnostic sessions
//!
//! One session drives one target through
//! `Pending -> Injecting -> AwaitingReady -> Streaming -> {Completed | Failed}`:
//! validate the pod, inject a sidecar, wait for it to run, then stream the
//! diagnostic command's output into a capture sink.
//!
//! A session never retries once it is streaming; a lost stream leaves the
//! remote command in an unknown state.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::Config;
use crate::error::{PollError, SessionError};
use crate::gateway::{ExecRequest, SharedGateway, is_finished, pod_phase};
use crate::patch;
use crate::poll::{PollSchedule, Selector, ephemeral_running, poll};
use crate::retry::{RetryPolicy, with_retry_if};
use crate::sidecar::{SidecarDescriptor, generate_sidecar_name};
use crate::sink::{CaptureSink, SinkFactory};
use crate::stream::{LogLines, RemoteCommand, StreamSummary};
use crate::target::{self, ResolvedTarget, Target};

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Pending,
    Injecting,
    AwaitingReady,
    Streaming,
    Completed,
    Failed,
}

impl SessionPhase {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Legal successor phases.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Injecting | Self::Failed)
                | (Self::Injecting, Self::AwaitingReady | Self::Failed)
                | (Self::AwaitingReady, Self::Streaming | Self::Failed)
                | (Self::Streaming, Self::Completed | Self::Failed)
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Injecting => "injecting",
            Self::AwaitingReady => "awaiting_ready",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Rejected phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal session transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionPhase,
    pub to: SessionPhase,
}

/// Monotonic phase history. Starts in `Pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTracker {
    history: Vec<SessionPhase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            history: vec![SessionPhase::Pending],
        }
    }

    #[must_use]
    pub fn current(&self) -> SessionPhase {
        self.history
            .last()
            .copied()
            .unwrap_or(SessionPhase::Pending)
    }

    #[must_use]
    pub fn history(&self) -> &[SessionPhase] {
        &self.history
    }

    pub fn advance(&mut self, next: SessionPhase) -> Result<(), InvalidTransition> {
        let from = self.current();
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.history.push(next);
        Ok(())
    }
}

/// Outcome of one session. Produced exactly once per target.
#[derive(Debug)]
pub struct SessionReport {
    pub target: Target,
    /// Injected sidecar name, when the session got that far
    pub sidecar: Option<String>,
    pub resolved: Option<ResolvedTarget>,
    pub phases: Vec<SessionPhase>,
    pub error: Option<SessionError>,
    /// Capture bytes written to the sink
    pub bytes: u64,
    pub stopped_by_operator: bool,
    pub artifact: Option<PathBuf>,
}

impl SessionReport {
    fn new(target: Target) -> Self {
        Self {
            target,
            sidecar: None,
            resolved: None,
            phases: vec![SessionPhase::Pending],
            error: None,
            bytes: 0,
            stopped_by_operator: false,
            artifact: None,
        }
    }

    /// Report for a session task that died before reporting.
    #[must_use]
    pub fn aborted(target: Target, reason: impl Into<String>) -> Self {
        let mut report = Self::new(target);
        report.phases.push(SessionPhase::Failed);
        report.error = Some(SessionError::Aborted(reason.into()));
        report
    }

    #[must_use]
    pub fn final_phase(&self) -> SessionPhase {
        self.phases.last().copied().unwrap_or(SessionPhase::Pending)
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.final_phase() == SessionPhase::Completed
    }

    /// Capture file worth merging: completed, non-empty, on disk.
    #[must_use]
    pub fn mergeable_artifact(&self) -> Option<&Path> {
        if self.is_completed() && self.bytes > 0 {
            self.artifact.as_deref()
        } else {
            None
        }
    }
}

/// Knobs shared by every session of a run.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub image: String,
    pub sidecar_lifetime: Duration,
    /// Diagnostic command exec'ed in the sidecar
    pub command: Vec<String>,
    pub retry: RetryPolicy,
    pub ready: PollSchedule,
}

impl SessionSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            image: config.capture.image.clone(),
            sidecar_lifetime: Duration::from_secs(config.capture.sidecar_lifetime_secs),
            command: config.capture.capture_command(),
            retry: RetryPolicy::patch_conflict(config.session.patch_attempts),
            ready: PollSchedule::new(
                config.session.ready_interval(),
                config.session.ready_timeout(),
            ),
        }
    }
}

struct SessionState {
    tracker: PhaseTracker,
    report: SessionReport,
}

impl SessionState {
    fn enter(&mut self, next: SessionPhase) {
        match self.tracker.advance(next) {
            Ok(()) => info!(phase = %next, "Session phase"),
            Err(e) => error!(error = %e, "Session phase change rejected"),
        }
    }
}

async fn or_cancel<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, SessionError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SessionError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Runs sessions against the shared gateway.
#[derive(Clone)]
pub struct SessionLauncher {
    gateway: SharedGateway,
    settings: SessionSettings,
}

impl SessionLauncher {
    #[must_use]
    pub fn new(gateway: SharedGateway, settings: SessionSettings) -> Self {
        Self { gateway, settings }
    }

    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Drive one target to a terminal phase.
    pub async fn run(
        &self,
        target: Target,
        sinks: &dyn SinkFactory,
        cancel: &CancellationToken,
    ) -> SessionReport {
        let sidecar = generate_sidecar_name();
        let span = info_span!(
            "session",
            namespace = %target.namespace,
            pod = %target.pod,
            sidecar = %sidecar,
        );
        self.run_named(target, sidecar, sinks, cancel)
            .instrument(span)
            .await
    }

    async fn run_named(
        &self,
        target: Target,
        sidecar: String,
        sinks: &dyn SinkFactory,
        cancel: &CancellationToken,
    ) -> SessionReport {
        let mut state = SessionState {
            tracker: PhaseTracker::new(),
            report: SessionReport::new(target),
        };

        match self.drive(&mut state, &sidecar, sinks, cancel).await {
            Ok(summary) => {
                state.report.bytes = summary.bytes;
                state.report.stopped_by_operator = summary.stopped_by_operator;
                state.enter(SessionPhase::Completed);
                info!(
                    bytes = summary.bytes,
                    stopped_by_operator = summary.stopped_by_operator,
                    "Session completed"
                );
            }
            Err(e) => {
                warn!(error = %e, phase = %state.tracker.current(), "Session failed");
                state.enter(SessionPhase::Failed);
                state.report.error = Some(e);
            }
        }

        state.report.phases = state.tracker.history().to_vec();
        state.report
    }

    async fn drive(
        &self,
        state: &mut SessionState,
        sidecar: &str,
        sinks: &dyn SinkFactory,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary, SessionError> {
        let target = state.report.target.clone();

        let pod = or_cancel(cancel, self.gateway.get(&target.namespace, &target.pod)).await??;
        let resolved = target::resolve(&pod, &target)?;
        debug!(
            container = %resolved.container,
            node = ?resolved.node_name,
            runtime = ?resolved.runtime,
            "Target resolved"
        );
        state.report.resolved = Some(resolved.clone());

        state.enter(SessionPhase::Injecting);
        self.inject(&resolved, sidecar, cancel).await?;
        state.report.sidecar = Some(sidecar.to_string());

        state.enter(SessionPhase::AwaitingReady);
        poll(
            &*self.gateway,
            &Selector::name(&resolved.namespace, &resolved.pod),
            &ephemeral_running(sidecar),
            self.settings.ready,
            cancel,
        )
        .await
        .map_err(|e| match e {
            PollError::Cancelled { .. } => SessionError::Cancelled,
            other => SessionError::Readiness(other),
        })?;

        state.enter(SessionPhase::Streaming);
        let Ok(opened) = or_cancel(cancel, sinks.open(&target)).await else {
            return Ok(StreamSummary {
                bytes: 0,
                stopped_by_operator: true,
            });
        };
        let mut sink = opened.map_err(|e| SessionError::Sink(e.to_string()))?;
        state.report.artifact = sink.artifact().map(Path::to_path_buf);

        let request = ExecRequest::capture(
            &resolved.namespace,
            &resolved.pod,
            sidecar,
            self.settings.command.clone(),
        );
        let streamed = self.stream(&request, &mut sink, cancel).await;
        let stopped = matches!(&streamed, Ok(s) if s.stopped_by_operator);
        let closed = sink.finish(stopped).await;

        let summary = streamed?;
        closed.map_err(|e| SessionError::Sink(e.to_string()))?;
        Ok(summary)
    }

    async fn inject(
        &self,
        resolved: &ResolvedTarget,
        sidecar: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let descriptor = SidecarDescriptor::new(
            sidecar,
            &self.settings.image,
            &resolved.container,
            self.settings.sidecar_lifetime,
        );
        let gateway = &*self.gateway;
        let descriptor = &descriptor;

        let outcome = with_retry_if(
            &self.settings.retry,
            cancel,
            |e: &SessionError| matches!(e, SessionError::Gateway(g) if g.is_conflict()),
            |attempt| async move {
                debug!(attempt, "Injecting sidecar");
                let attempt_once = async {
                    // Always patch against the current pod.
                    let pod = gateway.get(&resolved.namespace, &resolved.pod).await?;
                    if is_finished(&pod) {
                        return Err(SessionError::TerminalState {
                            pod: resolved.pod.clone(),
                            phase: pod_phase(&pod).unwrap_or("Unknown").to_string(),
                        });
                    }
                    let patch = patch::generate(&pod, descriptor)?;
                    gateway
                        .patch_ephemeral(&resolved.namespace, &resolved.pod, &patch.bytes)
                        .await?;
                    Ok::<(), SessionError>(())
                };
                or_cancel(cancel, attempt_once).await?
            },
        )
        .await;

        if outcome.cancelled {
            return Err(SessionError::Cancelled);
        }
        outcome.result
    }

    async fn stream(
        &self,
        request: &ExecRequest,
        sink: &mut CaptureSink,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary, SessionError> {
        let Ok(opened) = or_cancel(cancel, self.gateway.open_exec(request)).await else {
            return Ok(StreamSummary {
                bytes: 0,
                stopped_by_operator: true,
            });
        };
        let remote = RemoteCommand::from(opened?);
        let mut stderr = LogLines::new(request.container.clone());
        let summary = remote.pump(sink.writer(), &mut stderr, cancel).await?;
        let _ = stderr.shutdown().await;
        Ok(summary)
    }
}
