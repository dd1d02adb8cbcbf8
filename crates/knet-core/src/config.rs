//! Configuration management for knet
//!
//! Handles loading and validation of knet.toml configuration files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "KNET_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Capture sidecar and sink settings
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Session lifecycle settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Merge finalizer settings
    #[serde(default)]
    pub merge: MergeConfig,

    /// Fleet agent settings
    #[serde(default)]
    pub fleet: FleetConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::ValidationError(format!(
                "unknown log format {other:?} (expected pretty or json)"
            ))),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Namespace used when none is given
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
            namespace: default_namespace(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Sidecar image carrying the diagnostic tools
    #[serde(default = "default_image")]
    pub image: String,

    /// How long the idle sidecar stays alive, in seconds
    #[serde(default = "default_sidecar_lifetime")]
    pub sidecar_lifetime_secs: u64,

    /// Capture program and fixed arguments; must write pcap to stdout
    #[serde(default = "default_capture_command")]
    pub command: Vec<String>,

    /// Interface passed with `-i`
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Optional BPF filter expression
    #[serde(default)]
    pub filter: Option<String>,

    /// Directory for per-target capture files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Viewer program reading pcap on stdin
    #[serde(default = "default_viewer")]
    pub viewer: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            sidecar_lifetime_secs: default_sidecar_lifetime(),
            command: default_capture_command(),
            interface: default_interface(),
            filter: None,
            output_dir: default_output_dir(),
            viewer: default_viewer(),
        }
    }
}

impl CaptureConfig {
    /// Full diagnostic command: program, interface, then the filter.
    #[must_use]
    pub fn capture_command(&self) -> Vec<String> {
        let mut command = self.command.clone();
        command.push("-i".to_string());
        command.push(self.interface.clone());
        if let Some(filter) = self.filter.as_deref().map(str::trim) {
            if !filter.is_empty() {
                command.push(filter.to_string());
            }
        }
        command
    }
}

fn default_image() -> String {
    "nicolaka/netshoot".to_string()
}

fn default_sidecar_lifetime() -> u64 {
    3600
}

fn default_capture_command() -> Vec<String> {
    ["tcpdump", "-U", "-w", "-"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_interface() -> String {
    "any".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_viewer() -> Vec<String> {
    ["wireshark", "-k", "-i", "-"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Injection attempts on patch conflicts (including the first)
    #[serde(default = "default_patch_attempts")]
    pub patch_attempts: u32,

    /// Readiness poll interval in milliseconds
    #[serde(default = "default_ready_interval")]
    pub ready_interval_ms: u64,

    /// Readiness deadline in seconds
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            patch_attempts: default_patch_attempts(),
            ready_interval_ms: default_ready_interval(),
            ready_timeout_secs: default_ready_timeout(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

fn default_patch_attempts() -> u32 {
    3
}

fn default_ready_interval() -> u64 {
    1000
}

fn default_ready_timeout() -> u64 {
    120
}

/// Merge finalizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeConfig {
    /// Merge utility invoked as `<tool> -w <output> <inputs...>`
    #[serde(default = "default_merge_tool")]
    pub tool: String,

    /// Combined artifact path, relative to the working directory
    #[serde(default = "default_merge_output")]
    pub output: PathBuf,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            tool: default_merge_tool(),
            output: default_merge_output(),
        }
    }
}

fn default_merge_tool() -> String {
    "mergecap".to_string()
}

fn default_merge_output() -> PathBuf {
    PathBuf::from("knet-merged.pcap")
}

/// Fleet agent configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetConfig {
    /// Namespace hosting the agent DaemonSets
    #[serde(default = "default_fleet_namespace")]
    pub namespace: String,

    /// Agent image
    #[serde(default = "default_agent_image")]
    pub agent_image: String,

    /// Poll interval for agent rollout/teardown in milliseconds
    #[serde(default = "default_fleet_interval")]
    pub poll_interval_ms: u64,

    /// Deadline for agent rollout/teardown in seconds
    #[serde(default = "default_fleet_timeout")]
    pub wait_timeout_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            namespace: default_fleet_namespace(),
            agent_image: default_agent_image(),
            poll_interval_ms: default_fleet_interval(),
            wait_timeout_secs: default_fleet_timeout(),
        }
    }
}

fn default_fleet_namespace() -> String {
    "kube-system".to_string()
}

fn default_agent_image() -> String {
    "quay.io/kata-containers/kata-deploy:latest".to_string()
}

fn default_fleet_interval() -> u64 {
    2000
}

fn default_fleet_timeout() -> u64 {
    600
}

fn invalid(msg: &str) -> Result<()> {
    Err(ConfigError::ValidationError(msg.to_string()).into())
}

impl Config {
    /// Default config file location (`~/.config/knet/knet.toml` on Linux).
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("knet").join("knet.toml"))
    }

    /// Load configuration.
    ///
    /// An explicit path (or `$KNET_CONFIG`) must exist. The default location
    /// is optional; when absent, built-in defaults are used.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ReadFailed(path.display().to_string(), e.to_string())
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make sessions hang or never run.
    pub fn validate(&self) -> Result<()> {
        if self.session.patch_attempts == 0 {
            return invalid("session.patch_attempts must be at least 1");
        }
        if self.session.ready_interval_ms == 0 {
            return invalid("session.ready_interval_ms must be non-zero");
        }
        if self.session.ready_timeout_secs == 0 {
            return invalid("session.ready_timeout_secs must be non-zero");
        }
        if self.capture.command.is_empty() {
            return invalid("capture.command must not be empty");
        }
        if self.capture.viewer.is_empty() {
            return invalid("capture.viewer must not be empty");
        }
        if self.capture.image.trim().is_empty() {
            return invalid("capture.image must not be empty");
        }
        if self.merge.tool.trim().is_empty() {
            return invalid("merge.tool must not be empty");
        }
        if self.fleet.poll_interval_ms == 0 || self.fleet.wait_timeout_secs == 0 {
            return invalid("fleet intervals must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.general.namespace, "default");
        assert_eq!(config.session.patch_attempts, 3);
        assert_eq!(config.merge.tool, "mergecap");
        assert_eq!(config.merge.output, PathBuf::from("knet-merged.pcap"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [capture]
            interface = "eth0"
            filter = "port 80"

            [session]
            ready_timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.image, "nicolaka/netshoot");
        assert_eq!(config.session.ready_timeout(), Duration::from_secs(30));
        assert_eq!(config.session.ready_interval(), Duration::from_secs(1));
        assert_eq!(
            config.capture.capture_command(),
            vec!["tcpdump", "-U", "-w", "-", "-i", "eth0", "port 80"]
        );
    }

    #[test]
    fn blank_filter_is_dropped() {
        let capture = CaptureConfig {
            filter: Some("   ".to_string()),
            ..CaptureConfig::default()
        };
        assert_eq!(
            capture.capture_command(),
            vec!["tcpdump", "-U", "-w", "-", "-i", "any"]
        );
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = Config::from_toml_str("[session]\npatch_attempts = 0\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::ValidationError(ref msg)) if msg.contains("patch_attempts")
        ));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = Config::from_toml_str("[session\n").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ParseFailed(_))));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knet.toml");
        std::fs::write(&path, "[general]\nlog_format = \"json\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.general.log_format, LogFormat::Json);
    }

    #[test]
    fn missing_explicit_file_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/knet.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ReadFailed(..))));
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
