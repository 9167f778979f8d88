use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::ledger::Ledger;
use crate::models::{ApplicationState, ErrorKind};

#[derive(Debug, Default, Clone, Serialize)]
pub struct StateCounts {
    pub discovered: u32,
    pub scored: u32,
    pub queued: u32,
    pub in_progress: u32,
    pub submitted: u32,
    pub failed: u32,
    pub skipped: u32,
    pub needs_review: u32,
}

impl StateCounts {
    fn bump(&mut self, state: ApplicationState) {
        match state {
            ApplicationState::Discovered => self.discovered += 1,
            ApplicationState::Scored => self.scored += 1,
            ApplicationState::Queued => self.queued += 1,
            ApplicationState::InProgress => self.in_progress += 1,
            ApplicationState::Submitted => self.submitted += 1,
            ApplicationState::Failed => self.failed += 1,
            ApplicationState::Skipped => self.skipped += 1,
            ApplicationState::NeedsReview => self.needs_review += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source_id: String,
    pub submitted: u32,
    pub failed: u32,
    pub needs_review: u32,
    pub skipped: u32,
    /// submitted / (submitted + failed + needs_review), when any attempts
    /// reached a terminal outcome.
    pub success_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub id: i64,
    pub source_id: String,
    pub title: String,
    pub organization: String,
    pub score: f64,
    pub state: ApplicationState,
    pub attempts: u32,
    pub last_error: Option<ErrorKind>,
    pub confirmation_id: Option<String>,
}

/// Session output artifact: final state of every record plus per-source
/// rates, exported as JSON next to a full ledger dump.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub profile_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub duration_secs: f64,
    pub counts: StateCounts,
    pub per_source: Vec<SourceStats>,
    pub average_submitted_score: Option<f64>,
    pub records: Vec<RecordSummary>,
}

pub fn build(
    ledger: &Ledger,
    profile_id: &str,
    session_id: &str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> Result<SessionReport> {
    let records = ledger.list_records(profile_id)?;

    let mut counts = StateCounts::default();
    let mut sources: BTreeMap<String, SourceStats> = BTreeMap::new();
    let mut submitted_scores = Vec::new();

    for rec in &records {
        counts.bump(rec.state);
        let stats = sources
            .entry(rec.source_id.clone())
            .or_insert_with(|| SourceStats {
                source_id: rec.source_id.clone(),
                submitted: 0,
                failed: 0,
                needs_review: 0,
                skipped: 0,
                success_rate: None,
            });
        match rec.state {
            ApplicationState::Submitted => {
                stats.submitted += 1;
                submitted_scores.push(rec.score);
            }
            ApplicationState::Failed => stats.failed += 1,
            ApplicationState::NeedsReview => stats.needs_review += 1,
            ApplicationState::Skipped => stats.skipped += 1,
            _ => {}
        }
    }

    let per_source = sources
        .into_values()
        .map(|mut s| {
            let terminal = s.submitted + s.failed + s.needs_review;
            if terminal > 0 {
                s.success_rate = Some(f64::from(s.submitted) / f64::from(terminal));
            }
            s
        })
        .collect();

    let average_submitted_score = if submitted_scores.is_empty() {
        None
    } else {
        Some(submitted_scores.iter().sum::<f64>() / submitted_scores.len() as f64)
    };

    Ok(SessionReport {
        session_id: session_id.to_string(),
        profile_id: profile_id.to_string(),
        started_at: started_at.to_rfc3339(),
        finished_at: finished_at.to_rfc3339(),
        duration_secs: (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
        counts,
        per_source,
        average_submitted_score,
        records: records
            .iter()
            .map(|r| RecordSummary {
                id: r.id,
                source_id: r.source_id.clone(),
                title: r.title.clone(),
                organization: r.organization.clone(),
                score: r.score,
                state: r.state,
                attempts: r.attempts,
                last_error: r.last_error,
                confirmation_id: r.confirmation_id.clone(),
            })
            .collect(),
    })
}

impl SessionReport {
    /// Writes `report.json` and an append-only `ledger.json` dump under
    /// `<dir>/<session_id>/`. The ledger dump is re-ingestable for audit.
    pub fn export(&self, ledger: &Ledger, dir: &Path) -> Result<PathBuf> {
        let out = dir.join(&self.session_id);
        std::fs::create_dir_all(&out)
            .with_context(|| format!("Failed to create output dir: {}", out.display()))?;

        let report_path = out.join("report.json");
        std::fs::write(&report_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", report_path.display()))?;

        let transitions = ledger.transitions_for_profile(&self.profile_id)?;
        let ledger_path = out.join("ledger.json");
        std::fs::write(&ledger_path, serde_json::to_string_pretty(&transitions)?)
            .with_context(|| format!("Failed to write {}", ledger_path.display()))?;

        Ok(out)
    }

    pub fn print_summary(&self) {
        println!("Session {} ({})", self.session_id, self.profile_id);
        println!(
            "  submitted: {}  failed: {}  needs review: {}  skipped: {}  still queued: {}",
            self.counts.submitted,
            self.counts.failed,
            self.counts.needs_review,
            self.counts.skipped,
            self.counts.queued,
        );
        if let Some(avg) = self.average_submitted_score {
            println!("  average submitted score: {:.1}", avg);
        }
        println!("  duration: {:.1}s", self.duration_secs);
        for s in &self.per_source {
            let rate = s
                .success_rate
                .map(|r| format!("{:.0}%", r * 100.0))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<16} submitted {:<4} failed {:<4} review {:<4} rate {}",
                s.source_id, s.submitted, s.failed, s.needs_review, rate
            );
        }
    }
}
