//! Per-host step results

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::info;

/// Outcome of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Already in the desired state
    Ok,
    Changed,
    Skipped,
}

impl StepStatus {
    pub fn from_changed(changed: bool) -> Self {
        if changed {
            StepStatus::Changed
        } else {
            StepStatus::Ok
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Ok => write!(f, "ok"),
            StepStatus::Changed => write!(f, "changed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
}

/// Ordered record of everything a play did on one host
#[derive(Debug, Clone, Serialize)]
pub struct PlayRecap {
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<StepResult>,
}

impl PlayRecap {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            started_at: Utc::now(),
            steps: Vec::new(),
        }
    }

    /// Record a step and log its status
    pub fn record(&mut self, name: impl Into<String>, status: StepStatus) -> StepStatus {
        let name = name.into();
        info!(host = %self.host, step = %name, status = %status, "Step finished");
        self.steps.push(StepResult { name, status });
        status
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    pub fn changed(&self) -> bool {
        self.count(StepStatus::Changed) > 0
    }

    pub fn status_of(&self, name: &str) -> Option<StepStatus> {
        self.steps.iter().find(|s| s.name == name).map(|s| s.status)
    }

    pub fn log_summary(&self) {
        let elapsed = Utc::now() - self.started_at;
        info!(
            host = %self.host,
            ok = self.count(StepStatus::Ok),
            changed = self.count(StepStatus::Changed),
            skipped = self.count(StepStatus::Skipped),
            elapsed_secs = elapsed.num_seconds(),
            "Play recap"
        );
    }
}

impl fmt::Display for PlayRecap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<24} : ok={:<4} changed={:<4} skipped={}",
            self.host,
            self.count(StepStatus::Ok),
            self.count(StepStatus::Changed),
            self.count(StepStatus::Skipped)
        )
    }
}
