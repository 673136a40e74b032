use std::{fmt::Write as _, path::Path};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// How one entity left the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Retired,
    Skipped,
    Failed,
}

impl Outcome {
    /// Label used in the report's detail lines.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Retired => "RETIRED",
            Outcome::Skipped => "SKIPPED",
            Outcome::Failed => "FAILED",
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Retired => "retired",
            Outcome::Skipped => "skipped",
            Outcome::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit entry for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeRecord {
    pub entity_id: String,
    pub outcome: Outcome,
    pub reason: Option<String>,
}

impl OutcomeRecord {
    pub fn retired(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            outcome: Outcome::Retired,
            reason: None,
        }
    }

    pub fn skipped(entity_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            outcome: Outcome::Skipped,
            reason: Some(reason.into()),
        }
    }

    pub fn failed(entity_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            outcome: Outcome::Failed,
            reason: Some(reason.into()),
        }
    }
}

/// Aggregate counts over the outcome log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub retired: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl OutcomeCounts {
    pub fn total(&self) -> u64 {
        self.retired + self.skipped + self.failed
    }
}

/// Ordered per-run outcome log and its text rendering.
#[derive(Debug, Clone)]
pub struct AuditReporter {
    title: String,
    started_at: DateTime<Utc>,
    records: Vec<OutcomeRecord>,
    incomplete: bool,
}

impl AuditReporter {
    pub fn new(title: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            started_at,
            records: Vec::new(),
            incomplete: false,
        }
    }

    pub fn record(&mut self, record: OutcomeRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[OutcomeRecord] {
        &self.records
    }

    /// Tag the report as covering a run that ended early.
    pub fn mark_incomplete(&mut self) {
        self.incomplete = true;
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for record in &self.records {
            match record.outcome {
                Outcome::Retired => counts.retired += 1,
                Outcome::Skipped => counts.skipped += 1,
                Outcome::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Render the report: header, run timestamp, counts, a blank line, then
    /// one line per entity in processing order.
    pub fn flush(&self) -> String {
        let counts = self.counts();
        let mut out = String::new();

        let _ = writeln!(out, "Retention report: {}", self.title);
        let _ = writeln!(
            out,
            "Run at: {}",
            self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let _ = writeln!(out, "Processed: {}", counts.total());
        let _ = writeln!(out, "Retired: {}", counts.retired);
        let _ = writeln!(out, "Skipped: {}", counts.skipped);
        let _ = writeln!(out, "Failed: {}", counts.failed);
        let _ = writeln!(
            out,
            "Status: {}",
            if self.incomplete { "incomplete" } else { "complete" }
        );
        out.push('\n');

        for record in &self.records {
            let _ = write!(out, "{}: Entity ID {}", record.outcome.label(), record.entity_id);
            if let Some(reason) = &record.reason {
                let _ = write!(out, " - Reason: {}", reason);
            }
            out.push('\n');
        }
        out
    }

    /// Write the rendered report to `path`, creating parent directories.
    pub async fn write_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.flush()).await
    }
}
