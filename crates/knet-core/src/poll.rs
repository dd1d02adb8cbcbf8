//! Readiness polling (no fixed sleeps).
//!
//! Lists pods by selector at a fixed interval until a predicate holds, a
//! terminal state is seen, the deadline passes, or the caller cancels.

use std::fmt;

use k8s_openapi::api::core::v1::{ContainerState, Pod};
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{GatewayError, PollError};
use crate::gateway::{WorkloadGateway, is_finished, pod_name, pod_phase};

/// Which pods a poll observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// All pods matching a label selector.
    Labels { namespace: String, labels: String },
    /// One pod by name; a missing pod is observed as an empty set.
    Name { namespace: String, name: String },
}

impl Selector {
    #[must_use]
    pub fn labels(namespace: impl Into<String>, labels: impl Into<String>) -> Self {
        Self::Labels {
            namespace: namespace.into(),
            labels: labels.into(),
        }
    }

    #[must_use]
    pub fn name(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Name {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    async fn fetch(&self, gateway: &dyn WorkloadGateway) -> Result<Vec<Pod>, GatewayError> {
        match self {
            Self::Labels { namespace, labels } => gateway.list(namespace, labels).await,
            Self::Name { namespace, name } => match gateway.get(namespace, name).await {
                Ok(pod) => Ok(vec![pod]),
                Err(e) if e.is_not_found() => Ok(Vec::new()),
                Err(e) => Err(e),
            },
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Labels { namespace, labels } => write!(f, "pods in {namespace} matching {labels}"),
            Self::Name { namespace, name } => write!(f, "pod {namespace}/{name}"),
        }
    }
}

/// Result of evaluating a predicate against one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollVerdict {
    Satisfied,
    /// Not yet; carries a summary of what was seen.
    Pending(String),
    /// Can never be satisfied.
    Terminal(String),
}

/// A condition over the observed pod set.
pub trait ReadinessPredicate: Send + Sync {
    /// Human-readable description for errors.
    fn describe(&self) -> String;

    fn evaluate(&self, pods: &[Pod]) -> PollVerdict;
}

/// Helper to build a predicate from a description and closure.
pub struct Condition<F> {
    description: String,
    check: F,
}

impl<F> Condition<F> {
    #[must_use]
    pub fn new(description: impl Into<String>, check: F) -> Self {
        Self {
            description: description.into(),
            check,
        }
    }
}

impl<F> ReadinessPredicate for Condition<F>
where
    F: Fn(&[Pod]) -> PollVerdict + Send + Sync,
{
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn evaluate(&self, pods: &[Pod]) -> PollVerdict {
        (self.check)(pods)
    }
}

/// Poll interval and overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub deadline: Duration,
}

impl PollSchedule {
    #[must_use]
    pub const fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

/// Poll until `predicate` holds for the pods `selector` observes.
///
/// Returns the satisfying pod set. A predicate that already holds succeeds
/// on the first check without waiting. A deadline shorter than one interval
/// times out without polling. Transient gateway errors are recorded as the
/// last observation and polling continues; other gateway errors fail.
pub async fn poll<P>(
    gateway: &dyn WorkloadGateway,
    selector: &Selector,
    predicate: &P,
    schedule: PollSchedule,
    cancel: &CancellationToken,
) -> Result<Vec<Pod>, PollError>
where
    P: ReadinessPredicate + ?Sized,
{
    let expected = format!("{} ({selector})", predicate.describe());
    let start = Instant::now();

    if schedule.deadline < schedule.interval {
        return Err(PollError::Timeout {
            expected,
            last_observed: None,
            polls: 0,
            elapsed_ms: 0,
        });
    }

    let deadline = start + schedule.deadline;
    let mut polls = 0usize;
    let mut last_observed: Option<String> = None;

    loop {
        polls = polls.saturating_add(1);
        let listed = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PollError::Cancelled { expected }),
            listed = selector.fetch(gateway) => listed,
        };

        match listed {
            Ok(pods) => match predicate.evaluate(&pods) {
                PollVerdict::Satisfied => {
                    debug!(%expected, polls, "Poll satisfied");
                    return Ok(pods);
                }
                PollVerdict::Pending(observation) => {
                    trace!(%expected, polls, %observation, "Poll pending");
                    last_observed = Some(observation);
                }
                PollVerdict::Terminal(reason) => {
                    return Err(PollError::TerminalState { expected, reason });
                }
            },
            Err(e) if e.is_transient() => {
                debug!(%expected, polls, error = %e, "Transient gateway error while polling");
                last_observed = Some(format!("gateway error: {e}"));
            }
            Err(source) => return Err(PollError::Gateway { expected, source }),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout {
                expected,
                last_observed,
                polls,
                elapsed_ms: u64::try_from(now.saturating_duration_since(start).as_millis())
                    .unwrap_or(u64::MAX),
            });
        }

        let sleep_for = schedule.interval.min(deadline.saturating_duration_since(now));
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PollError::Cancelled { expected }),
            () = sleep(sleep_for) => {}
        }
    }
}

fn summarize_phases(pods: &[Pod]) -> String {
    pods.iter()
        .map(|p| format!("{}={}", pod_name(p), pod_phase(p).unwrap_or("Unknown")))
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_ready(pod: &Pod) -> bool {
    pod_phase(pod) == Some("Running")
        && pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// Every observed pod is Running and Ready, and there is at least one.
#[must_use]
pub fn all_running() -> impl ReadinessPredicate {
    Condition::new("all pods running and ready", |pods: &[Pod]| {
        if pods.is_empty() {
            PollVerdict::Pending("no pods yet".to_string())
        } else if pods.iter().all(is_ready) {
            PollVerdict::Satisfied
        } else {
            PollVerdict::Pending(summarize_phases(pods))
        }
    })
}

/// No pod is observed.
#[must_use]
pub fn all_absent() -> impl ReadinessPredicate {
    Condition::new("all pods gone", |pods: &[Pod]| {
        if pods.is_empty() {
            PollVerdict::Satisfied
        } else {
            PollVerdict::Pending(format!(
                "{} remaining: {}",
                pods.len(),
                summarize_phases(pods)
            ))
        }
    })
}

/// Waiting reasons a container never recovers from.
const FATAL_WAITING_REASONS: &[&str] = &["InvalidImageName", "ErrImageNeverPull"];

/// The named ephemeral container is running inside the single observed pod.
#[must_use]
pub fn ephemeral_running(container: impl Into<String>) -> impl ReadinessPredicate {
    let container = container.into();
    let description = format!("ephemeral container {container} running");
    Condition::new(description, move |pods: &[Pod]| {
        let Some(pod) = pods.first() else {
            return PollVerdict::Terminal("pod no longer exists".to_string());
        };
        if is_finished(pod) {
            return PollVerdict::Terminal(format!(
                "pod entered phase {}",
                pod_phase(pod).unwrap_or("Unknown")
            ));
        }

        let status = pod
            .status
            .as_ref()
            .and_then(|s| s.ephemeral_container_statuses.as_ref())
            .and_then(|list| list.iter().find(|c| c.name == container));
        let Some(status) = status else {
            return PollVerdict::Pending(format!("{container} has no status yet"));
        };

        match &status.state {
            Some(ContainerState {
                running: Some(_), ..
            }) => PollVerdict::Satisfied,
            Some(ContainerState {
                terminated: Some(t),
                ..
            }) => PollVerdict::Terminal(format!(
                "{container} terminated with exit code {} ({})",
                t.exit_code,
                t.reason.as_deref().unwrap_or("no reason")
            )),
            Some(ContainerState {
                waiting: Some(w), ..
            }) => {
                let reason = w.reason.as_deref().unwrap_or("Waiting");
                if FATAL_WAITING_REASONS.contains(&reason) {
                    PollVerdict::Terminal(format!("{container} cannot start: {reason}"))
                } else {
                    PollVerdict::Pending(format!("{container} waiting: {reason}"))
                }
            }
            _ => PollVerdict::Pending(format!("{container} state unknown")),
        }
    })
}
