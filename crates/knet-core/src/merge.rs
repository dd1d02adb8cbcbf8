//! Merge finalizer
//!
//! Combines the per-target capture files of a multi-target run into one
//! artifact with an external utility (`mergecap -w <out> <in...>`).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::MergeConfig;
use crate::error::MergeError;

/// Combines capture artifacts into one.
#[async_trait]
pub trait ArtifactMerger: Send + Sync {
    /// Merge `inputs`; returns the combined artifact's path.
    async fn merge(&self, inputs: &[PathBuf]) -> Result<PathBuf, MergeError>;
}

/// Runs an external merge tool.
#[derive(Debug, Clone)]
pub struct MergeTool {
    tool: String,
    output: PathBuf,
}

impl MergeTool {
    #[must_use]
    pub fn new(tool: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            output: output.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &MergeConfig) -> Self {
        Self::new(config.tool.clone(), config.output.clone())
    }

    #[must_use]
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Arguments passed to the tool.
    #[must_use]
    pub fn args(&self, inputs: &[PathBuf]) -> Vec<OsString> {
        let mut args = vec![OsString::from("-w"), self.output.clone().into_os_string()];
        args.extend(inputs.iter().map(|p| p.clone().into_os_string()));
        args
    }
}

#[async_trait]
impl ArtifactMerger for MergeTool {
    async fn merge(&self, inputs: &[PathBuf]) -> Result<PathBuf, MergeError> {
        if inputs.is_empty() {
            return Err(MergeError::NoInputs);
        }
        debug!(tool = %self.tool, inputs = inputs.len(), output = %self.output.display(), "Merging captures");

        let output = Command::new(&self.tool)
            .args(self.args(inputs))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| MergeError::Spawn {
                tool: self.tool.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(MergeError::Failed {
                tool: self.tool.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(output = %self.output.display(), inputs = inputs.len(), "Captures merged");
        Ok(self.output.clone())
    }
}
