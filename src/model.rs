use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Environment variable through which the UI process discovers the API.
pub const API_BASE_URL_ENV: &str = "JUSCASH_API_BASE_URL";
/// Environment variable holding the model API key consumed by the API process.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

pub const DEFAULT_API_PORT: u16 = 8000;
pub const DEFAULT_UI_PORT: u16 = 8501;

/// Which collaborator processes a deployment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    /// API and UI in the same container.
    Combined,
    /// UI only; the API is hosted elsewhere.
    UiOnly,
}

impl DeploymentMode {
    pub fn launches_api(self) -> bool {
        matches!(self, DeploymentMode::Combined)
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentMode::Combined => f.write_str("combined"),
            DeploymentMode::UiOnly => f.write_str("ui-only"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessRole {
    Api,
    Ui,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Api => f.write_str("API"),
            ProcessRole::Ui => f.write_str("UI"),
        }
    }
}

/// A child process to launch: program, arguments and extra environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub role: ProcessRole,
    pub program: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(role: ProcessRole, program: impl Into<String>) -> Self {
        Self {
            role,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Render the command line for progress messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub path: String,
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/health".into(),
            max_attempts: 20,
            attempt_timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// How the coordinator decides the API had enough time to come up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStrategy {
    FixedDelay {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    HealthCheck(HealthCheckConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub mode: DeploymentMode,
    /// Host used in the base URL handed to the UI.
    pub api_host: String,
    pub api_port: u16,
    pub ui_port: u16,
    /// `None` when the mode does not launch the API.
    pub api: Option<ProcessSpec>,
    pub ui: ProcessSpec,
    pub readiness: ReadinessStrategy,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    pub user_agent: String,
}

impl LaunchConfig {
    /// Base URL exported to the UI; only combined deployments produce one.
    pub fn api_base_url(&self) -> Option<String> {
        self.mode
            .launches_api()
            .then(|| api_base_url(&self.api_host, self.api_port))
    }
}

pub fn api_base_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}")
}

/// Coordinator progress. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CoordinatorState {
    NotStarted,
    ApiLaunching,
    ApiLaunchedWaiting,
    UiLaunched,
}

impl CoordinatorState {
    pub fn can_advance_to(self, next: CoordinatorState) -> bool {
        use CoordinatorState::*;
        matches!(
            (self, next),
            (NotStarted, ApiLaunching)
                | (ApiLaunching, ApiLaunchedWaiting)
                | (ApiLaunchedWaiting, UiLaunched)
                | (NotStarted, UiLaunched)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApiStatus {
    NotLaunched,
    SpawnFailed { error: String },
    /// Fixed delay elapsed; readiness unknown.
    Waited { delay_ms: u64 },
    Ready { attempts: u32 },
    Unready { attempts: u32, last_error: String },
    Exited { code: Option<i32> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UiOutcome {
    Exited { code: i32 },
    SpawnFailed { error: String, code: i32 },
    /// The coordinator received a termination signal and stopped the UI.
    Interrupted { signal: i32 },
}

impl UiOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            UiOutcome::Exited { code } | UiOutcome::SpawnFailed { code, .. } => *code,
            UiOutcome::Interrupted { signal } => 128 + signal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchReport {
    pub started_utc: String,
    pub finished_utc: String,
    pub mode: DeploymentMode,
    pub api_base_url: Option<String>,
    pub api: ApiStatus,
    #[serde(default)]
    pub api_pid: Option<u32>,
    /// Set when the API exited while the UI was still running.
    #[serde(default)]
    pub api_exited_early: bool,
    #[serde(default)]
    pub ui_pid: Option<u32>,
    pub ui: UiOutcome,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LaunchEvent {
    StateChanged {
        state: CoordinatorState,
    },
    Spawned {
        role: ProcessRole,
        pid: Option<u32>,
        command: String,
    },
    SpawnFailed {
        role: ProcessRole,
        error: String,
    },
    ReadinessProbe {
        attempt: u32,
        ok: bool,
        detail: String,
    },
    ApiReadiness {
        status: ApiStatus,
    },
    ApiExited {
        code: Option<i32>,
    },
    Info(InfoEvent),
}

/// Structured info events emitted by the launcher and rendered by the CLI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    ApiKeyLoaded(bool),
    ExportingBaseUrl { url: String },
    ShutdownRequested { signal: i32 },
}

impl InfoEvent {
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::ApiKeyLoaded(true) => format!("{API_KEY_ENV} loaded"),
            InfoEvent::ApiKeyLoaded(false) => {
                format!("{API_KEY_ENV} is not set; verification requests will fail")
            }
            InfoEvent::ExportingBaseUrl { url } => format!("{API_BASE_URL_ENV}={url}"),
            InfoEvent::ShutdownRequested { signal } => {
                format!("Received signal {signal}, stopping processes")
            }
        }
    }
}
