//! Multi-target coordination
//!
//! A single target runs inline and its failure is the caller's error. Several
//! targets run as one task each; failures stay with their session. Once
//! every session is terminal the completed captures are merged, exactly once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, MergeError, Result, SessionError};
use crate::merge::ArtifactMerger;
use crate::session::{SessionLauncher, SessionReport};
use crate::sink::SinkFactory;
use crate::target::Target;

/// Everything a run produced.
#[derive(Debug, Default)]
pub struct RunReport {
    /// One report per target, in target order
    pub sessions: Vec<SessionReport>,
    /// Combined artifact, when a merge ran and succeeded
    pub merged: Option<PathBuf>,
    pub merge_error: Option<MergeError>,
    /// The run was interrupted by the operator
    pub cancelled: bool,
}

impl RunReport {
    /// Targets whose session ended in `Failed`.
    #[must_use]
    pub fn failed_targets(&self) -> Vec<&Target> {
        self.sessions
            .iter()
            .filter(|r| !r.is_completed())
            .map(|r| &r.target)
            .collect()
    }

    #[must_use]
    pub fn completed(&self) -> usize {
        self.sessions.iter().filter(|r| r.is_completed()).count()
    }
}

/// Runs sessions for a target list. One coordinator drives one run.
pub struct Coordinator {
    launcher: Arc<SessionLauncher>,
    sinks: Arc<dyn SinkFactory>,
    merger: Arc<dyn ArtifactMerger>,
    finalized: AtomicBool,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        launcher: SessionLauncher,
        sinks: Arc<dyn SinkFactory>,
        merger: Arc<dyn ArtifactMerger>,
    ) -> Self {
        Self {
            launcher: Arc::new(launcher),
            sinks,
            merger,
            finalized: AtomicBool::new(false),
        }
    }

    /// Run every target to a terminal phase.
    ///
    /// Single-target failures are returned as errors. Multi-target failures
    /// are recorded in the report, which is never an error once sessions
    /// have started.
    pub async fn run(&self, targets: Vec<Target>, cancel: &CancellationToken) -> Result<RunReport> {
        let mut unique: Vec<Target> = Vec::with_capacity(targets.len());
        for target in targets {
            if !unique.contains(&target) {
                unique.push(target);
            }
        }

        match unique.len() {
            0 => Err(SessionError::Validation("no target pods given".to_string()).into()),
            1 => {
                let target = unique.remove(0);
                self.run_single(target, cancel).await
            }
            _ => self.run_multi(unique, cancel).await,
        }
    }

    async fn run_single(&self, target: Target, cancel: &CancellationToken) -> Result<RunReport> {
        let mut report = self.launcher.run(target, &*self.sinks, cancel).await;
        if !report.is_completed() {
            let err = report
                .error
                .take()
                .unwrap_or_else(|| SessionError::Aborted("session ended without a result".to_string()));
            return Err(Error::Session(err));
        }
        Ok(RunReport {
            sessions: vec![report],
            merged: None,
            merge_error: None,
            cancelled: cancel.is_cancelled(),
        })
    }

    async fn run_multi(&self, targets: Vec<Target>, cancel: &CancellationToken) -> Result<RunReport> {
        if !self.sinks.supports_multiple_targets() {
            return Err(SessionError::Validation(format!(
                "{} targets cannot share one capture destination; write to files instead",
                targets.len()
            ))
            .into());
        }

        info!(targets = targets.len(), "Starting sessions");
        let mut set = JoinSet::new();
        for (index, target) in targets.iter().cloned().enumerate() {
            let launcher = Arc::clone(&self.launcher);
            let sinks = Arc::clone(&self.sinks);
            let cancel = cancel.clone();
            set.spawn(async move { (index, launcher.run(target, &*sinks, &cancel).await) });
        }

        let mut slots: Vec<Option<SessionReport>> = targets.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, report)) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(report);
                    }
                }
                Err(e) => warn!(error = %e, "Session task ended without a report"),
            }
        }

        let sessions: Vec<SessionReport> = slots
            .into_iter()
            .zip(targets)
            .map(|(slot, target)| {
                slot.unwrap_or_else(|| SessionReport::aborted(target, "session task panicked"))
            })
            .collect();

        let mut run = RunReport {
            sessions,
            merged: None,
            merge_error: None,
            cancelled: cancel.is_cancelled(),
        };
        self.finalize(&mut run).await;
        Ok(run)
    }

    async fn finalize(&self, run: &mut RunReport) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            warn!("Merge already ran for this run; skipping");
            return;
        }

        let inputs: Vec<PathBuf> = run
            .sessions
            .iter()
            .filter_map(|r| r.mergeable_artifact().map(Path::to_path_buf))
            .collect();

        info!(
            completed = run.completed(),
            failed = run.failed_targets().len(),
            inputs = inputs.len(),
            "All sessions terminal"
        );

        match self.merger.merge(&inputs).await {
            Ok(path) => run.merged = Some(path),
            Err(e) => {
                warn!(error = %e, "Merge failed; per-target captures are kept");
                run.merge_error = Some(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionPhase;

    fn report(pod: &str, phase: SessionPhase, bytes: u64) -> SessionReport {
        let mut report = SessionReport::aborted(Target::new("ns", pod), "placeholder");
        report.error = None;
        report.phases = vec![SessionPhase::Pending, phase];
        report.bytes = bytes;
        report.artifact = Some(PathBuf::from(format!("{pod}.pcap")));
        report
    }

    #[test]
    fn failed_targets_lists_non_completed_sessions() {
        let run = RunReport {
            sessions: vec![
                report("a", SessionPhase::Completed, 10),
                report("b", SessionPhase::Failed, 0),
            ],
            ..RunReport::default()
        };
        assert_eq!(run.completed(), 1);
        let failed: Vec<&str> = run.failed_targets().iter().map(|t| t.pod.as_str()).collect();
        assert_eq!(failed, vec!["b"]);
    }
}
