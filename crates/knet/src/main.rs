//! kubectl-knet: network diagnosis for running pods
//!
//! Thin kubectl plugin over `knet-core`. Installed on `$PATH` as
//! `kubectl-knet`, it is invoked as `kubectl knet <command>`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use knet_core::config::{Config, LogFormat};
use knet_core::coordinator::{Coordinator, RunReport};
use knet_core::error::{
    Error, PollError, SessionError, StreamError, format_error_with_remediation,
};
use knet_core::fleet::FleetManager;
use knet_core::gateway::{ExecRequest, SharedGateway};
use knet_core::kube_gateway::KubeGateway;
use knet_core::logging::{LogConfig, init_logging};
use knet_core::merge::MergeTool;
use knet_core::session::{SessionLauncher, SessionSettings};
use knet_core::sink::{FileSinkFactory, SinkFactory, StdoutSinkFactory, ViewerSinkFactory};
use knet_core::stream::{RemoteCommand, forward_stdin};
use knet_core::target::{self, Target, collect_targets};

const EXIT_FAILURE: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

/// Namespace kubectl passes to plugins.
const NAMESPACE_ENV: &str = "KUBECTL_PLUGINS_CURRENT_NAMESPACE";

#[derive(Parser, Debug)]
#[command(name = "kubectl-knet")]
#[command(version, about = "Network diagnosis for running pods via ephemeral sidecars")]
struct Cli {
    /// Config file (default: ~/.config/knet/knet.toml or $KNET_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture traffic of one or more pods
    Tcpdump(TcpdumpArgs),
    /// Run a command in a pod's container
    Exec(ExecArgs),
    /// Install the node agent, its RBAC and runtime classes
    Deploy,
    /// Reset every node and remove the node agent
    Delete,
    /// Change node agent settings
    AgentConfig(AgentConfigArgs),
}

#[derive(Args, Debug)]
struct TcpdumpArgs {
    /// Namespace of the target pods
    #[arg(short = 'n', long, env = NAMESPACE_ENV)]
    namespace: Option<String>,

    /// Target pod (repeatable)
    #[arg(short = 'p', long = "pod", value_name = "POD")]
    pods: Vec<String>,

    /// Label selector adding every matching pod as a target
    #[arg(short = 'l', long)]
    selector: Option<String>,

    /// Container whose network is captured (default: first container)
    #[arg(short = 'c', long)]
    container: Option<String>,

    /// Interface to capture on
    #[arg(short = 'i', long)]
    interface: Option<String>,

    /// BPF filter expression
    #[arg(short = 'f', long)]
    filter: Option<String>,

    /// Directory for per-pod capture files
    #[arg(short = 'o', long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Stream into the configured viewer instead of files
    #[arg(long, conflicts_with = "stdout")]
    viewer: bool,

    /// Write raw capture bytes to stdout
    #[arg(long)]
    stdout: bool,

    /// Sidecar image
    #[arg(long)]
    image: Option<String>,

    /// Seconds to wait for the sidecar to start
    #[arg(long, value_name = "SECS")]
    ready_timeout: Option<u64>,
}

impl TcpdumpArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(interface) = &self.interface {
            config.capture.interface.clone_from(interface);
        }
        if let Some(filter) = &self.filter {
            config.capture.filter = Some(filter.clone());
        }
        if let Some(dir) = &self.output_dir {
            config.capture.output_dir.clone_from(dir);
        }
        if let Some(image) = &self.image {
            config.capture.image.clone_from(image);
        }
        if let Some(secs) = self.ready_timeout {
            config.session.ready_timeout_secs = secs;
        }
    }

    fn sinks(&self, config: &Config) -> Arc<dyn SinkFactory> {
        if self.stdout {
            Arc::new(StdoutSinkFactory)
        } else if self.viewer {
            Arc::new(ViewerSinkFactory::new(config.capture.viewer.clone()))
        } else {
            Arc::new(FileSinkFactory::new(config.capture.output_dir.clone()))
        }
    }
}

#[derive(Args, Debug)]
struct ExecArgs {
    /// Namespace of the pod
    #[arg(short = 'n', long, env = NAMESPACE_ENV)]
    namespace: Option<String>,

    /// Pod to run in
    #[arg(short = 'p', long)]
    pod: String,

    /// Container (default: first container)
    #[arg(short = 'c', long)]
    container: Option<String>,

    /// Command and arguments, after `--`
    #[arg(last = true, required = true, value_name = "CMD")]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct AgentConfigArgs {
    /// Enable or disable the runtime debug console
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    debug_console: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<Error>() {
                Some(e) => eprintln!("{}", format_error_with_remediation(e)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::from(failure_exit_code(&err))
        }
    }
}

/// Operator interrupts exit 130 whichever phase they hit.
fn failure_exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>() {
        Some(
            Error::Session(SessionError::Cancelled)
            | Error::Poll(PollError::Cancelled { .. })
            | Error::Cancelled(_),
        ) => EXIT_INTERRUPTED,
        _ => EXIT_FAILURE,
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }

    init_logging(&LogConfig {
        level: config.general.log_level.clone(),
        format: config.general.log_format,
        file: config.general.log_file.clone(),
    })
    .context("failed to initialize logging")?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let gateway: SharedGateway = Arc::new(KubeGateway::connect().await.map_err(Error::from)?);

    match cli.command {
        Commands::Tcpdump(args) => tcpdump(args, config, gateway, &cancel).await,
        Commands::Exec(args) => exec(args, &config, gateway, &cancel).await,
        Commands::Deploy => {
            FleetManager::new(gateway, config.fleet).deploy(&cancel).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Delete => {
            FleetManager::new(gateway, config.fleet).teardown(&cancel).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::AgentConfig(args) => {
            FleetManager::new(gateway, config.fleet)
                .configure_debug_console(args.debug_console, &cancel)
                .await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// First Ctrl-C cancels the run; a second one exits immediately.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted; stopping sessions (Ctrl-C again to exit now)");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
    });
}

async fn tcpdump(
    args: TcpdumpArgs,
    mut config: Config,
    gateway: SharedGateway,
    cancel: &CancellationToken,
) -> anyhow::Result<ExitCode> {
    args.apply(&mut config);
    config.validate()?;

    let namespace = args
        .namespace
        .clone()
        .unwrap_or_else(|| config.general.namespace.clone());
    let targets = collect_targets(
        &*gateway,
        &namespace,
        &args.pods,
        args.selector.as_deref(),
        args.container.as_deref(),
    )
    .await
    .map_err(Error::from)?;
    if targets.is_empty() {
        anyhow::bail!("no target pods in {namespace}: pass -p/--pod or a matching -l/--selector");
    }
    info!(namespace = %namespace, targets = targets.len(), "Starting capture");

    let launcher = SessionLauncher::new(gateway, SessionSettings::from_config(&config));
    let coordinator = Coordinator::new(
        launcher,
        args.sinks(&config),
        Arc::new(MergeTool::from_config(&config.merge)),
    );
    let report = coordinator.run(targets, cancel).await?;
    print_summary(&report);

    if !report.sessions.is_empty() && report.completed() == 0 {
        return Ok(ExitCode::from(EXIT_FAILURE));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(report: &RunReport) {
    for session in &report.sessions {
        let outcome = match (&session.error, &session.artifact) {
            (Some(err), _) => format!("error: {err}"),
            (None, Some(path)) => path.display().to_string(),
            (None, None) => String::new(),
        };
        eprintln!(
            "{:<48} {:<10} {:>12} bytes  {}",
            session.target.to_string(),
            session.final_phase().to_string(),
            session.bytes,
            outcome
        );
    }
    if let Some(merged) = &report.merged {
        eprintln!("merged capture: {}", merged.display());
    }
    if let Some(err) = &report.merge_error {
        eprintln!("merge skipped: {err}");
    }
    let failed = report.failed_targets();
    if !failed.is_empty() && report.sessions.len() > 1 {
        eprintln!("{} of {} targets failed", failed.len(), report.sessions.len());
    }
}

async fn exec(
    args: ExecArgs,
    config: &Config,
    gateway: SharedGateway,
    cancel: &CancellationToken,
) -> anyhow::Result<ExitCode> {
    let namespace = args
        .namespace
        .unwrap_or_else(|| config.general.namespace.clone());
    let pod = gateway
        .get(&namespace, &args.pod)
        .await
        .map_err(Error::from)?;
    let wanted = Target::new(&namespace, &args.pod).with_container(args.container);
    let resolved = target::resolve(&pod, &wanted).map_err(Error::from)?;

    let request = ExecRequest::capture(&namespace, &args.pod, &resolved.container, args.command)
        .with_stdin(true);
    let channels = gateway.open_exec(&request).await.map_err(Error::from)?;
    let mut remote = RemoteCommand::from(channels);
    if let Some(input) = remote.take_stdin() {
        tokio::spawn(async move {
            if let Err(e) = forward_stdin(tokio::io::stdin(), input).await {
                debug!(error = %e, "Stdin forwarding ended");
            }
        });
    }

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    match remote.pump(&mut stdout, &mut stderr, cancel).await {
        Ok(summary) if summary.stopped_by_operator => Ok(ExitCode::from(EXIT_INTERRUPTED)),
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(StreamError::RemoteExit { code }) => {
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(EXIT_FAILURE)))
        }
        Err(e) => Err(Error::from(e).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn tcpdump_accepts_repeated_pods() {
        let cli = parse(&[
            "kubectl-knet", "tcpdump", "-n", "shop", "-p", "web-a", "-p", "web-b", "-i", "eth0",
            "-f", "port 80",
        ]);
        let Commands::Tcpdump(args) = cli.command else {
            panic!("expected tcpdump");
        };
        assert_eq!(args.namespace.as_deref(), Some("shop"));
        assert_eq!(args.pods, vec!["web-a", "web-b"]);
        assert_eq!(args.interface.as_deref(), Some("eth0"));
        assert_eq!(args.filter.as_deref(), Some("port 80"));
    }

    #[test]
    fn viewer_and_stdout_conflict() {
        let err = Cli::try_parse_from([
            "kubectl-knet", "tcpdump", "-p", "web", "--viewer", "--stdout",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn overrides_apply_to_config() {
        let cli = parse(&[
            "kubectl-knet", "tcpdump", "-p", "web", "-i", "eth1", "-o", "/tmp/caps",
            "--image", "busybox", "--ready-timeout", "5",
        ]);
        let Commands::Tcpdump(args) = cli.command else {
            panic!("expected tcpdump");
        };
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.capture.interface, "eth1");
        assert_eq!(config.capture.output_dir, PathBuf::from("/tmp/caps"));
        assert_eq!(config.capture.image, "busybox");
        assert_eq!(config.session.ready_timeout_secs, 5);
        assert!(args.sinks(&config).supports_multiple_targets());
    }

    #[test]
    fn exec_requires_command_after_separator() {
        assert!(Cli::try_parse_from(["kubectl-knet", "exec", "-p", "web"]).is_err());

        let cli = parse(&["kubectl-knet", "exec", "-p", "web", "-c", "app", "--", "ls", "-la"]);
        let Commands::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.pod, "web");
        assert_eq!(args.container.as_deref(), Some("app"));
        assert_eq!(args.command, vec!["ls", "-la"]);
    }

    #[test]
    fn agent_config_takes_explicit_bool() {
        let cli = parse(&["kubectl-knet", "agent-config", "--debug-console", "false"]);
        let Commands::AgentConfig(args) = cli.command else {
            panic!("expected agent-config");
        };
        assert!(!args.debug_console);

        let cli = parse(&["kubectl-knet", "agent-config", "--debug-console", "true"]);
        let Commands::AgentConfig(args) = cli.command else {
            panic!("expected agent-config");
        };
        assert!(args.debug_console);
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = parse(&["kubectl-knet", "deploy", "--log-format", "json", "--log-level", "debug"]);
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Commands::Deploy));
    }

    #[test]
    fn interrupted_runs_exit_130() {
        let cancelled = anyhow::Error::from(Error::Session(SessionError::Cancelled));
        assert_eq!(failure_exit_code(&cancelled), EXIT_INTERRUPTED);

        let wait = anyhow::Error::from(Error::Poll(PollError::Cancelled {
            expected: "all pods running and ready".to_string(),
        }));
        assert_eq!(failure_exit_code(&wait), EXIT_INTERRUPTED);

        let invalid = anyhow::Error::from(Error::Session(SessionError::Validation(
            "no target pods given".to_string(),
        )));
        assert_eq!(failure_exit_code(&invalid), EXIT_FAILURE);
        assert_eq!(failure_exit_code(&anyhow::anyhow!("no target pods")), EXIT_FAILURE);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
