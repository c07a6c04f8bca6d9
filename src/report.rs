use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

use crate::constants::HISTORY_FILE;
use crate::health::ObservedService;
use crate::stage::{Stage, StageRecord, StageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub target_image: String,
    pub succeeded: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub failing_services: Vec<ObservedService>,
    #[serde(default)]
    pub stages: Vec<StageRecord>,
}

/// Terminal outcome of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub succeeded: bool,
    pub failing_services: Vec<ObservedService>,
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
    pub exit_code: i32,
    pub revision: Option<String>,
    pub image_reference: Option<String>,
    pub stages: Vec<StageRecord>,
    pub rollback: Option<RollbackOutcome>,
}

fn glyph(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Success => "ok",
        StageStatus::Failed => "FAIL",
        StageStatus::Skipped => "skip",
        StageStatus::Running => "..",
        StageStatus::Pending => "--",
    }
}

pub fn render_text(result: &DeploymentResult) -> String {
    let mut out = String::new();
    let verdict = if result.succeeded { "succeeded" } else { "FAILED" };
    let _ = writeln!(out, "Deployment {verdict} on {}", result.host);
    if let Some(image) = &result.image_reference {
        let _ = writeln!(out, "  image:    {image}");
    }
    if let Some(revision) = &result.revision {
        let _ = writeln!(out, "  revision: {revision}");
    }
    let _ = writeln!(out, "  at:       {}", result.timestamp.to_rfc3339());

    if !result.stages.is_empty() {
        let _ = writeln!(out);
        for record in &result.stages {
            let duration = record
                .duration_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_default();
            let _ = write!(
                out,
                "  [{:>4}] {:<12} {:>8}",
                glyph(record.status),
                record.stage.as_str(),
                duration
            );
            match &record.message {
                Some(message) => {
                    let _ = writeln!(out, "  {message}");
                }
                None => {
                    let _ = writeln!(out);
                }
            }
        }
    }

    if let Some(error) = &result.error {
        let stage = result
            .failed_stage
            .map(|stage| stage.as_str())
            .unwrap_or("unknown");
        let _ = writeln!(out, "\nFailed at {stage}: {error}");
    }
    write_services(&mut out, &result.failing_services);

    if let Some(rollback) = &result.rollback {
        let outcome = if rollback.succeeded { "restored" } else { "FAILED" };
        let _ = writeln!(out, "\nRollback to {}: {outcome}", rollback.target_image);
        if let Some(error) = &rollback.error {
            let _ = writeln!(out, "  {error}");
        }
        write_services(&mut out, &rollback.failing_services);
    }
    out
}

fn write_services(out: &mut String, services: &[ObservedService]) {
    for svc in services {
        let _ = writeln!(
            out,
            "\n  {} (state: {:?}, health: {:?})",
            svc.name, svc.state, svc.health
        );
        for line in &svc.log_tail {
            let _ = writeln!(out, "    | {line}");
        }
    }
}

fn append_history(state_dir: &Path, result: &DeploymentResult) -> Result<()> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create state dir {}", state_dir.display()))?;
    let path = state_dir.join(HISTORY_FILE);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{}", serde_json::to_string(result)?)?;
    Ok(())
}

/// Prints the result and appends it to the local history. Never fails.
pub fn report(result: &DeploymentResult, format: ReportFormat, state_dir: Option<&Path>) {
    match format {
        ReportFormat::Json => match serde_json::to_string_pretty(result) {
            Ok(json) => println!("{json}"),
            Err(err) => tracing::warn!("failed to serialize deployment result: {err}"),
        },
        ReportFormat::Text => print!("{}", render_text(result)),
    }

    let failing: Vec<&str> = result
        .failing_services
        .iter()
        .map(|svc| svc.name.as_str())
        .collect();
    if result.succeeded {
        tracing::info!(
            host = %result.host,
            image = ?result.image_reference,
            revision = ?result.revision,
            "deployment succeeded"
        );
    } else {
        tracing::error!(
            host = %result.host,
            stage = ?result.failed_stage.map(Stage::as_str),
            exit_code = result.exit_code,
            failing = ?failing,
            "deployment failed"
        );
    }

    if let Some(dir) = state_dir {
        if let Err(err) = append_history(dir, result) {
            tracing::warn!("failed to record deployment history: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{ServiceHealth, ServiceState};

    fn failed_result() -> DeploymentResult {
        let mut record = StageRecord::new(Stage::Pull);
        record.start();
        record.finish(false, Some("exit 1: no such host".to_string()));
        DeploymentResult {
            succeeded: false,
            failing_services: vec![ObservedService {
                name: "backend".to_string(),
                state: ServiceState::Running,
                health: ServiceHealth::Unhealthy,
                log_tail: vec!["Traceback (most recent call last):".to_string()],
            }],
            timestamp: Utc::now(),
            host: "deploy@erp.example.com:22".to_string(),
            failed_stage: Some(Stage::Pull),
            error: Some("reconcile: image pull failed".to_string()),
            exit_code: 31,
            revision: Some("abc123".to_string()),
            image_reference: Some("ghcr.io/acme/erp:v2".to_string()),
            stages: vec![record],
            rollback: None,
        }
    }

    #[test]
    fn text_report_names_stage_and_log_tail() {
        let text = render_text(&failed_result());
        assert!(text.starts_with("Deployment FAILED on deploy@erp.example.com:22"));
        assert!(text.contains("[FAIL] pull"));
        assert!(text.contains("Failed at pull: reconcile: image pull failed"));
        assert!(text.contains("    | Traceback (most recent call last):"));
    }

    #[test]
    fn history_is_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let result = failed_result();
        report(&result, ReportFormat::Json, Some(dir.path()));
        report(&result, ReportFormat::Text, Some(dir.path()));
        let history = std::fs::read_to_string(dir.path().join(HISTORY_FILE)).unwrap();
        let lines: Vec<&str> = history.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: DeploymentResult = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.failed_stage, Some(Stage::Pull));
        assert_eq!(parsed.failing_services[0].log_tail.len(), 1);
    }
}
