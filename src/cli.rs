use crate::model::{
    DeploymentMode, HealthCheckConfig, LaunchConfig, LaunchReport, ProcessRole, ProcessSpec,
    ReadinessStrategy, DEFAULT_API_PORT, DEFAULT_UI_PORT,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
pub(crate) enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
pub(crate) fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReadinessMode {
    /// Sleep for --startup-delay, then start the UI
    FixedDelay,
    /// Poll the API health endpoint with backoff
    HealthCheck,
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "juscash-launcher",
    version,
    about = "Start the JusCash verifier API and UI processes in order"
)]
pub struct Cli {
    /// Which processes to run in this container
    #[arg(long, value_enum, default_value_t = DeploymentMode::Combined, env = "JUSCASH_LAUNCHER_MODE")]
    pub mode: DeploymentMode,

    /// Address both servers bind to
    #[arg(long, default_value = "0.0.0.0", env = "JUSCASH_LAUNCHER_BIND")]
    pub bind: String,

    /// API port
    #[arg(long, default_value_t = DEFAULT_API_PORT, env = "JUSCASH_LAUNCHER_API_PORT")]
    pub api_port: u16,

    /// UI port
    #[arg(long, default_value_t = DEFAULT_UI_PORT, env = "JUSCASH_LAUNCHER_UI_PORT")]
    pub ui_port: u16,

    /// Host the UI uses to reach the API
    #[arg(long, default_value = "localhost", env = "JUSCASH_LAUNCHER_API_HOST")]
    pub api_host: String,

    /// ASGI server program for the API
    #[arg(long, default_value = "uvicorn", env = "JUSCASH_LAUNCHER_API_PROGRAM")]
    pub api_program: String,

    /// ASGI application target
    #[arg(long, default_value = "main:app", env = "JUSCASH_LAUNCHER_API_APP")]
    pub api_app: String,

    /// UI server program
    #[arg(long, default_value = "streamlit", env = "JUSCASH_LAUNCHER_UI_PROGRAM")]
    pub ui_program: String,

    /// UI script passed to `streamlit run`
    #[arg(long, default_value = "app_ui.py", env = "JUSCASH_LAUNCHER_UI_SCRIPT")]
    pub ui_script: String,

    /// How to decide the API is up before starting the UI
    #[arg(long, value_enum, default_value_t = ReadinessMode::HealthCheck, env = "JUSCASH_LAUNCHER_READINESS")]
    pub readiness: ReadinessMode,

    /// Delay between API and UI launch with --readiness fixed-delay
    #[arg(long, default_value = "5s", env = "JUSCASH_LAUNCHER_STARTUP_DELAY")]
    pub startup_delay: humantime::Duration,

    /// Health endpoint path
    #[arg(long, default_value = "/health", env = "JUSCASH_LAUNCHER_HEALTH_PATH")]
    pub health_path: String,

    /// Maximum number of health probes
    #[arg(long, default_value_t = 20, env = "JUSCASH_LAUNCHER_HEALTH_ATTEMPTS")]
    pub health_attempts: u32,

    /// Timeout for a single health probe
    #[arg(long, default_value = "2s", env = "JUSCASH_LAUNCHER_HEALTH_TIMEOUT")]
    pub health_timeout: humantime::Duration,

    /// First delay between health probes (doubles up to --health-max-backoff)
    #[arg(long, default_value = "250ms")]
    pub health_backoff: humantime::Duration,

    /// Upper bound for the delay between health probes
    #[arg(long, default_value = "2s")]
    pub health_max_backoff: humantime::Duration,

    /// Time children get to exit after SIGTERM before they are killed
    #[arg(long, default_value = "5s", env = "JUSCASH_LAUNCHER_SHUTDOWN_GRACE")]
    pub shutdown_grace: humantime::Duration,

    /// Print the launch report as JSON when the UI exits
    #[arg(long)]
    pub json: bool,

    /// Suppress progress messages
    #[arg(long)]
    pub silent: bool,

    /// Write the launch report as JSON to this path
    #[arg(long, env = "JUSCASH_LAUNCHER_REPORT_FILE")]
    pub report_file: Option<std::path::PathBuf>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    pub verbose: bool,
}

/// Build the API command line: `uvicorn main:app --host <bind> --port <port>`.
pub fn api_process(args: &Cli) -> ProcessSpec {
    ProcessSpec::new(ProcessRole::Api, &args.api_program)
        .arg(&args.api_app)
        .arg("--host")
        .arg(&args.bind)
        .arg("--port")
        .arg(args.api_port.to_string())
}

/// Build the UI command line: `streamlit run app_ui.py --server.address <bind> --server.port <port>`.
pub fn ui_process(args: &Cli) -> ProcessSpec {
    ProcessSpec::new(ProcessRole::Ui, &args.ui_program)
        .arg("run")
        .arg(&args.ui_script)
        .arg("--server.address")
        .arg(&args.bind)
        .arg("--server.port")
        .arg(args.ui_port.to_string())
}

/// Build a `LaunchConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> LaunchConfig {
    let readiness = match args.readiness {
        ReadinessMode::FixedDelay => ReadinessStrategy::FixedDelay {
            delay: Duration::from(args.startup_delay),
        },
        ReadinessMode::HealthCheck => ReadinessStrategy::HealthCheck(HealthCheckConfig {
            path: args.health_path.clone(),
            max_attempts: args.health_attempts,
            attempt_timeout: Duration::from(args.health_timeout),
            initial_backoff: Duration::from(args.health_backoff),
            max_backoff: Duration::from(args.health_max_backoff),
        }),
    };

    LaunchConfig {
        mode: args.mode,
        api_host: args.api_host.clone(),
        api_port: args.api_port,
        ui_port: args.ui_port,
        api: args.mode.launches_api().then(|| api_process(args)),
        ui: ui_process(args),
        readiness,
        shutdown_grace: Duration::from(args.shutdown_grace),
        user_agent: format!("juscash-launcher/{}", env!("CARGO_PKG_VERSION")),
    }
}

/// Run the coordinator and return the report of the finished launch.
pub async fn run(args: Cli) -> Result<LaunchReport> {
    if args.api_port == args.ui_port && args.mode.launches_api() {
        return Err(anyhow::anyhow!(
            "--api-port and --ui-port must differ (both are {})",
            args.api_port
        ));
    }

    let (out_tx, out_handle) = spawn_output_writer();
    let report = crate::orchestrator::run_controller(&args, out_tx.clone())
        .await
        .context("launcher failed")?;

    crate::orchestrator::process_run_completion(&args, &report, &out_tx)?;

    drop(out_tx);
    let _ = out_handle.await;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("juscash-launcher").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults_match_container_layout() {
        let cfg = build_config(&parse(&[]));
        assert_eq!(cfg.mode, DeploymentMode::Combined);
        assert_eq!(cfg.api_port, 8000);
        assert_eq!(cfg.ui_port, 8501);
        assert_eq!(cfg.api_base_url().as_deref(), Some("http://localhost:8000"));
        assert_eq!(
            cfg.api.as_ref().map(|p| p.command_line()).as_deref(),
            Some("uvicorn main:app --host 0.0.0.0 --port 8000")
        );
        assert_eq!(
            cfg.ui.command_line(),
            "streamlit run app_ui.py --server.address 0.0.0.0 --server.port 8501"
        );
        match cfg.readiness {
            ReadinessStrategy::HealthCheck(h) => {
                assert_eq!(h.path, "/health");
                assert_eq!(h.max_attempts, 20);
            }
            other => panic!("unexpected readiness {other:?}"),
        }
    }

    #[test]
    fn fixed_delay_defaults_to_five_seconds() {
        let cfg = build_config(&parse(&["--readiness", "fixed-delay"]));
        match cfg.readiness {
            ReadinessStrategy::FixedDelay { delay } => assert_eq!(delay, Duration::from_secs(5)),
            other => panic!("unexpected readiness {other:?}"),
        }
    }

    #[test]
    fn ui_only_mode_drops_api_process() {
        let cfg = build_config(&parse(&["--mode", "ui-only", "--ui-port", "9000"]));
        assert!(cfg.api.is_none());
        assert_eq!(cfg.api_base_url(), None);
        assert!(cfg.ui.command_line().ends_with("--server.port 9000"));
    }

    #[test]
    fn custom_ports_flow_into_base_url() {
        let cfg = build_config(&parse(&["--api-port", "9100", "--api-host", "api"]));
        assert_eq!(cfg.api_base_url().as_deref(), Some("http://api:9100"));
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["juscash-launcher", "--mode", "both"]).is_err());
    }
}
