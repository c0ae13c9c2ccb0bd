//! Launch lifecycle controller.
//!
//! Owns the launcher task, forwards termination signals to it and renders its events as progress
//! messages.

use crate::cli::{build_config, Cli, OutputLine};
use crate::engine::{EngineControl, Launcher};
use crate::model::{ApiStatus, CoordinatorState, LaunchEvent, LaunchReport};
use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, warn};

/// Turn a launcher event into a progress line. `None` for events that are only logged.
pub(crate) fn render_event(event: &LaunchEvent) -> Option<String> {
    match event {
        LaunchEvent::StateChanged { state } => match state {
            CoordinatorState::NotStarted => None,
            CoordinatorState::ApiLaunching => Some("Starting API...".into()),
            CoordinatorState::ApiLaunchedWaiting => Some("Waiting for API...".into()),
            CoordinatorState::UiLaunched => Some("Starting UI...".into()),
        },
        LaunchEvent::Spawned { role, pid, command } => Some(match pid {
            Some(pid) => format!("{role} running (pid {pid}): {command}"),
            None => format!("{role} running: {command}"),
        }),
        LaunchEvent::SpawnFailed { role, error } => Some(format!("{role} failed to start: {error}")),
        LaunchEvent::ReadinessProbe { ok: false, .. } => None,
        LaunchEvent::ReadinessProbe {
            attempt, ok: true, ..
        } => Some(format!("API healthy after {attempt} probe(s)")),
        LaunchEvent::ApiReadiness { status } => match status {
            ApiStatus::Unready {
                attempts,
                last_error,
            } => Some(format!(
                "API not ready after {attempts} probe(s) ({last_error}); starting UI anyway"
            )),
            ApiStatus::Exited { code } => Some(format!(
                "API exited during startup (code {}); starting UI anyway",
                code.map(|c| c.to_string()).unwrap_or_else(|| "-".into())
            )),
            _ => None,
        },
        LaunchEvent::ApiExited { code } => Some(format!(
            "API exited (code {})",
            code.map(|c| c.to_string()).unwrap_or_else(|| "-".into())
        )),
        LaunchEvent::Info(info) => Some(info.to_message()),
    }
}

/// Forward SIGINT/SIGTERM to the launcher as shutdown requests.
fn spawn_signal_forwarder(ctrl_tx: UnboundedSender<EngineControl>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut term, mut int) = match (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
            ) {
                (Ok(t), Ok(i)) => (t, i),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "failed to install signal handlers");
                    return;
                }
            };
            let signal = tokio::select! {
                _ = term.recv() => 15,
                _ = int.recv() => 2,
            };
            debug!(signal, "termination signal received");
            let _ = ctrl_tx.send(EngineControl::Shutdown { signal });
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = ctrl_tx.send(EngineControl::Shutdown { signal: 2 });
            }
        }
    })
}

/// Run one launch to completion, emitting progress to `out_tx`.
pub(crate) async fn run_controller(
    args: &Cli,
    out_tx: UnboundedSender<OutputLine>,
) -> Result<LaunchReport> {
    let cfg = build_config(args);
    debug!(config = ?cfg, "launch configuration");

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<LaunchEvent>();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<EngineControl>();

    let signals = spawn_signal_forwarder(ctrl_tx);
    let launcher = Launcher::new(cfg);
    let handle = tokio::spawn(async move { launcher.run(event_tx, ctrl_rx).await });

    while let Some(ev) = event_rx.recv().await {
        if args.silent {
            continue;
        }
        if let Some(line) = render_event(&ev) {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }

    let report = handle
        .await
        .context("launcher task failed")?
        .context("launch failed")?;

    // Dropping a JoinHandle does not cancel the task.
    signals.abort();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InfoEvent, ProcessRole};

    #[test]
    fn renders_coordinator_steps() {
        let lines: Vec<String> = [
            CoordinatorState::ApiLaunching,
            CoordinatorState::ApiLaunchedWaiting,
            CoordinatorState::UiLaunched,
        ]
        .into_iter()
        .filter_map(|state| render_event(&LaunchEvent::StateChanged { state }))
        .collect();
        assert_eq!(
            lines,
            vec!["Starting API...", "Waiting for API...", "Starting UI..."]
        );
    }

    #[test]
    fn failed_probes_are_not_rendered() {
        let ev = LaunchEvent::ReadinessProbe {
            attempt: 1,
            ok: false,
            detail: "connection refused".into(),
        };
        assert!(render_event(&ev).is_none());
    }

    #[test]
    fn renders_spawn_and_info() {
        let spawned = LaunchEvent::Spawned {
            role: ProcessRole::Ui,
            pid: Some(42),
            command: "streamlit run app_ui.py".into(),
        };
        assert_eq!(
            render_event(&spawned).unwrap(),
            "UI running (pid 42): streamlit run app_ui.py"
        );

        let url = LaunchEvent::Info(InfoEvent::ExportingBaseUrl {
            url: "http://localhost:8000".into(),
        });
        assert_eq!(
            render_event(&url).unwrap(),
            "JUSCASH_API_BASE_URL=http://localhost:8000"
        );
    }

    #[test]
    fn unready_api_mentions_fallthrough() {
        let ev = LaunchEvent::ApiReadiness {
            status: ApiStatus::Unready {
                attempts: 20,
                last_error: "refused".into(),
            },
        };
        assert!(render_event(&ev).unwrap().contains("starting UI anyway"));
    }
}
