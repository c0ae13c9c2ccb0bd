//! Text summary builder for CLI output.

use crate::model::{ApiStatus, LaunchReport, UiOutcome};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn code_or_dash(code: Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "-".into())
}

pub(crate) fn build_text_summary(report: &LaunchReport) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("Mode: {}", report.mode));
    if let Some(url) = report.api_base_url.as_deref() {
        lines.push(format!("API base URL: {url}"));
    }

    let api = match &report.api {
        ApiStatus::NotLaunched => "not launched".to_string(),
        ApiStatus::SpawnFailed { error } => format!("failed to start ({error})"),
        ApiStatus::Waited { delay_ms } => format!("started, waited {delay_ms} ms"),
        ApiStatus::Ready { attempts } => format!("ready after {attempts} probe(s)"),
        ApiStatus::Unready {
            attempts,
            last_error,
        } => format!("not ready after {attempts} probe(s): {last_error}"),
        ApiStatus::Exited { code } => format!("exited (code {})", code_or_dash(*code)),
    };
    if report.api_exited_early {
        lines.push(format!("API: {api}, while UI was running"));
    } else {
        lines.push(format!("API: {api}"));
    }

    let ui = match &report.ui {
        UiOutcome::Exited { code } => format!("exited (code {code})"),
        UiOutcome::SpawnFailed { error, .. } => format!("failed to start ({error})"),
        UiOutcome::Interrupted { signal } => format!("stopped by signal {signal}"),
    };
    lines.push(format!("UI: {ui}"));
    lines.push(format!("Exit code: {}", report.exit_code));

    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeploymentMode;

    #[test]
    fn ui_only_summary_omits_base_url() {
        let report = LaunchReport {
            started_utc: String::new(),
            finished_utc: String::new(),
            mode: DeploymentMode::UiOnly,
            api_base_url: None,
            api: ApiStatus::NotLaunched,
            api_pid: None,
            api_exited_early: false,
            ui_pid: Some(1),
            ui: UiOutcome::Interrupted { signal: 15 },
            exit_code: 143,
        };
        let lines = build_text_summary(&report).lines;
        assert_eq!(
            lines,
            vec![
                "Mode: ui-only",
                "API: not launched",
                "UI: stopped by signal 15",
                "Exit code: 143",
            ]
        );
    }
}
