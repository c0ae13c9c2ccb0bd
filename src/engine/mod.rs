pub(crate) mod process;
pub(crate) mod readiness;

use crate::model::{
    ApiStatus, CoordinatorState, InfoEvent, LaunchConfig, LaunchEvent, LaunchReport, ProcessRole,
    UiOutcome, API_BASE_URL_ENV, API_KEY_ENV,
};
use anyhow::Result;
use self::process::{exit_code_from_status, ManagedChild};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Stop both processes; the coordinator exits with `128 + signal`.
    Shutdown { signal: i32 },
}

/// Tracks the coordinator state and announces every transition.
struct StateTracker<'a> {
    state: CoordinatorState,
    event_tx: &'a mpsc::UnboundedSender<LaunchEvent>,
}

impl<'a> StateTracker<'a> {
    fn new(event_tx: &'a mpsc::UnboundedSender<LaunchEvent>) -> Self {
        Self {
            state: CoordinatorState::NotStarted,
            event_tx,
        }
    }

    fn advance(&mut self, next: CoordinatorState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
        let _ = self
            .event_tx
            .send(LaunchEvent::StateChanged { state: next });
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

/// How the wait for API readiness ended.
enum WaitOutcome {
    Done(ApiStatus),
    Shutdown { signal: i32 },
}

pub struct Launcher {
    cfg: LaunchConfig,
}

impl Launcher {
    pub fn new(cfg: LaunchConfig) -> Self {
        Self { cfg }
    }

    /// Launch the configured processes and block until the UI exits.
    ///
    /// Failures of the API are recorded in the report and never abort the run; only the UI decides
    /// the exit code.
    pub async fn run(
        self,
        event_tx: mpsc::UnboundedSender<LaunchEvent>,
        mut control_rx: mpsc::UnboundedReceiver<EngineControl>,
    ) -> Result<LaunchReport> {
        let started_utc = now_rfc3339();
        let mut tracker = StateTracker::new(&event_tx);
        let api_base_url = self.cfg.api_base_url();
        let mut controls_open = true;

        let mut report = LaunchReport {
            started_utc,
            finished_utc: String::new(),
            mode: self.cfg.mode,
            api_base_url: api_base_url.clone(),
            api: ApiStatus::NotLaunched,
            api_pid: None,
            api_exited_early: false,
            ui_pid: None,
            ui: UiOutcome::Exited { code: 0 },
            exit_code: 0,
        };

        let mut api_child: Option<ManagedChild> = None;
        if let (Some(spec), Some(base_url)) = (self.cfg.api.as_ref(), api_base_url.as_deref()) {
            let key_loaded = std::env::var_os(API_KEY_ENV).is_some_and(|v| !v.is_empty());
            if !key_loaded {
                warn!("{API_KEY_ENV} is not set in the coordinator environment");
            }
            let _ = event_tx.send(LaunchEvent::Info(InfoEvent::ApiKeyLoaded(key_loaded)));

            tracker.advance(CoordinatorState::ApiLaunching);
            match process::spawn(spec) {
                Ok(child) => {
                    info!(pid = ?child.pid(), "API process started");
                    report.api_pid = child.pid();
                    let _ = event_tx.send(LaunchEvent::Spawned {
                        role: ProcessRole::Api,
                        pid: child.pid(),
                        command: spec.command_line(),
                    });
                    api_child = Some(child);
                }
                Err(e) => {
                    warn!(error = %e, "API process failed to start, continuing with UI");
                    report.api = ApiStatus::SpawnFailed {
                        error: e.to_string(),
                    };
                    let _ = event_tx.send(LaunchEvent::SpawnFailed {
                        role: ProcessRole::Api,
                        error: e.to_string(),
                    });
                }
            }
            tracker.advance(CoordinatorState::ApiLaunchedWaiting);

            if let Some(api) = api_child.as_mut() {
                let outcome = {
                    let wait = readiness::wait_for_api(
                        &self.cfg.readiness,
                        base_url,
                        &self.cfg.user_agent,
                        api,
                        &event_tx,
                    );
                    tokio::pin!(wait);
                    loop {
                        tokio::select! {
                            status = &mut wait => break WaitOutcome::Done(status),
                            ctrl = control_rx.recv(), if controls_open => match ctrl {
                                Some(EngineControl::Shutdown { signal }) => {
                                    break WaitOutcome::Shutdown { signal }
                                }
                                None => controls_open = false,
                            },
                        }
                    }
                };
                match outcome {
                    WaitOutcome::Done(status) => {
                        match &status {
                            ApiStatus::Ready { attempts } => info!(attempts, "API is ready"),
                            ApiStatus::Waited { .. } => {}
                            other => warn!(status = ?other, "API not confirmed ready, starting UI anyway"),
                        }
                        report.api = status.clone();
                        let _ = event_tx.send(LaunchEvent::ApiReadiness { status: status.clone() });
                        // Already reaped; nothing left to supervise.
                        if matches!(status, ApiStatus::Exited { .. }) {
                            api_child = None;
                        }
                    }
                    WaitOutcome::Shutdown { signal } => {
                        let _ = event_tx.send(LaunchEvent::Info(InfoEvent::ShutdownRequested { signal }));
                        api.terminate(self.cfg.shutdown_grace).await;
                        report.ui = UiOutcome::Interrupted { signal };
                        return Ok(self.finish(report));
                    }
                }
            }
        }

        let mut ui_spec = self.cfg.ui.clone();
        if let Some(url) = api_base_url.as_deref() {
            let _ = event_tx.send(LaunchEvent::Info(InfoEvent::ExportingBaseUrl {
                url: url.to_string(),
            }));
            ui_spec = ui_spec.with_env(API_BASE_URL_ENV, url);
        }

        tracker.advance(CoordinatorState::UiLaunched);
        let mut ui_child = match process::spawn(&ui_spec) {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "UI process failed to start");
                let _ = event_tx.send(LaunchEvent::SpawnFailed {
                    role: ProcessRole::Ui,
                    error: e.to_string(),
                });
                report.ui = UiOutcome::SpawnFailed {
                    error: e.to_string(),
                    code: e.exit_code(),
                };
                if let Some(api) = api_child.as_mut() {
                    api.terminate(self.cfg.shutdown_grace).await;
                }
                return Ok(self.finish(report));
            }
        };
        info!(pid = ?ui_child.pid(), "UI process started");
        report.ui_pid = ui_child.pid();
        let _ = event_tx.send(LaunchEvent::Spawned {
            role: ProcessRole::Ui,
            pid: ui_child.pid(),
            command: ui_spec.command_line(),
        });

        report.ui = loop {
            tokio::select! {
                status = ui_child.wait() => {
                    break match status {
                        Ok(status) => UiOutcome::Exited { code: exit_code_from_status(status) },
                        Err(e) => {
                            error!(error = %e, "failed to wait for UI process");
                            UiOutcome::Exited { code: 1 }
                        }
                    };
                }
                // Take nothing out of `api_child` until this branch wins.
                api_exit = async {
                    match api_child.as_mut() {
                        Some(api) => api.wait().await,
                        None => futures::future::pending().await,
                    }
                } => {
                    let code = api_exit.ok().and_then(|s| s.code());
                    warn!(?code, "API process exited while UI is running");
                    report.api = ApiStatus::Exited { code };
                    report.api_exited_early = true;
                    let _ = event_tx.send(LaunchEvent::ApiExited { code });
                    api_child = None;
                }
                ctrl = control_rx.recv(), if controls_open => {
                    match ctrl {
                        Some(EngineControl::Shutdown { signal }) => {
                            let _ = event_tx.send(LaunchEvent::Info(InfoEvent::ShutdownRequested { signal }));
                            ui_child.terminate(self.cfg.shutdown_grace).await;
                            break UiOutcome::Interrupted { signal };
                        }
                        None => controls_open = false,
                    }
                }
            }
        };

        if let Some(api) = api_child.as_mut() {
            api.terminate(self.cfg.shutdown_grace).await;
        }
        Ok(self.finish(report))
    }

    fn finish(&self, mut report: LaunchReport) -> LaunchReport {
        report.finished_utc = now_rfc3339();
        report.exit_code = report.ui.exit_code();
        report
    }
}
