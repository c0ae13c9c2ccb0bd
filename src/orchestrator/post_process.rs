//! Post-launch processing: report export and final output.

use crate::cli::{Cli, OutputLine};
use crate::model::LaunchReport;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::sync::mpsc::UnboundedSender;

/// Write the report as pretty JSON, creating parent directories as needed.
pub(crate) fn export_json(path: &Path, report: &LaunchReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Export and print the finished report according to the output flags.
pub(crate) fn process_run_completion(
    args: &Cli,
    report: &LaunchReport,
    out_tx: &UnboundedSender<OutputLine>,
) -> Result<()> {
    if let Some(path) = args.report_file.as_deref() {
        match export_json(path, report) {
            Ok(()) if !args.silent => {
                let _ = out_tx.send(OutputLine::Stderr(format!(
                    "Saved report: {}",
                    path.display()
                )));
            }
            Ok(()) => {}
            // The UI exit code must win over a failed export.
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "report export failed"),
        }
    }

    if args.json {
        let out = serde_json::to_string_pretty(report)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else if !args.silent {
        for line in crate::text_summary::build_text_summary(report).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    Ok(())
}
