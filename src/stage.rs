use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stages, in execution order. Reconcile sub-steps are separate stages so a
/// failure names the exact step (`pull`, `down`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Provision,
    Sync,
    Precondition,
    Snapshot,
    Pull,
    Down,
    Up,
    Settle,
    Prune,
    Verify,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Sync => "sync",
            Self::Precondition => "precondition",
            Self::Snapshot => "snapshot",
            Self::Pull => "pull",
            Self::Down => "down",
            Self::Up => "up",
            Self::Settle => "settle",
            Self::Prune => "prune",
            Self::Verify => "verify",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub message: Option<String>,
}

impl StageRecord {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            message: None,
        }
    }

    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
        tracing::info!(stage = %self.stage, "stage started");
    }

    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
        if success {
            tracing::info!(stage = %self.stage, duration_ms = ?self.duration_ms, "stage finished");
        } else {
            tracing::warn!(stage = %self.stage, message = ?message, "stage failed");
        }
        self.message = message;
    }

    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }
}

/// Ordered stage log for one run.
#[derive(Debug, Clone, Default)]
pub struct StageLog {
    records: Vec<StageRecord>,
}

impl StageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, stage: Stage) {
        let mut record = StageRecord::new(stage);
        record.start();
        self.records.push(record);
    }

    /// Closes the most recent open record for `stage`.
    pub fn finish(&mut self, stage: Stage, success: bool, message: Option<String>) {
        if let Some(record) = self
            .records
            .iter_mut()
            .rev()
            .find(|r| r.stage == stage && r.status == StageStatus::Running)
        {
            record.finish(success, message);
        }
    }

    pub fn skip(&mut self, stage: Stage, reason: &str) {
        let mut record = StageRecord::new(stage);
        record.skip(Some(reason.to_string()));
        self.records.push(record);
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<StageRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_closes_the_running_record() {
        let mut log = StageLog::new();
        log.start(Stage::Pull);
        log.finish(Stage::Pull, false, Some("network unreachable".to_string()));
        log.skip(Stage::Prune, "pipeline aborted");

        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, StageStatus::Failed);
        assert!(records[0].duration_ms.is_some());
        assert_eq!(records[1].status, StageStatus::Skipped);
    }

    #[test]
    fn stage_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Stage::Pull).unwrap(), "\"pull\"");
    }
}
