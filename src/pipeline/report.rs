//! Run tally and the failure report that drives `retry`.

use crate::models::Stage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Partial,
    Failed,
}

/// One row of the failure report. An empty `trial_id` stands for a whole
/// listing page that could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialFailure {
    pub trial_id: String,
    pub listing_url: String,
    pub stage: Stage,
    pub capture: CaptureStatus,
    pub reason: String,
}

impl TrialFailure {
    pub fn covers_whole_page(&self) -> bool {
        self.trial_id.is_empty()
    }
}

/// A listing page the scan had to skip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    pub page: u32,
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub trials_attempted: usize,
    pub trials_fully_captured: usize,
    pub trials_partially_captured: usize,
    pub trials_failed: usize,
    pub failures: Vec<TrialFailure>,
    pub failed_pages: Vec<PageFailure>,
    pub pages_visited: Vec<u32>,
    pub malformed_cards: usize,
    pub stopped_early: bool,
}

impl RunReport {
    pub fn record_full(&mut self) {
        self.trials_attempted += 1;
        self.trials_fully_captured += 1;
    }

    pub fn record_partial(&mut self, failure: TrialFailure) {
        self.trials_attempted += 1;
        self.trials_partially_captured += 1;
        self.failures.push(failure);
    }

    pub fn record_failed(&mut self, failure: TrialFailure) {
        self.trials_attempted += 1;
        self.trials_failed += 1;
        self.failures.push(failure);
    }

    pub fn record_failed_page(&mut self, page: u32, url: &str, reason: String) {
        warn!(page, url, "listing page skipped: {}", reason);
        self.failed_pages.push(PageFailure {
            page,
            url: url.to_string(),
            reason,
        });
    }

    /// Everything worth re-running: per-trial failures plus skipped pages.
    pub fn retry_rows(&self) -> Vec<TrialFailure> {
        let pages = self.failed_pages.iter().map(|p| TrialFailure {
            trial_id: String::new(),
            listing_url: p.url.clone(),
            stage: Stage::ListingFetch,
            capture: CaptureStatus::Failed,
            reason: p.reason.clone(),
        });
        self.failures.iter().cloned().chain(pages).collect()
    }

    pub fn log_summary(&self) {
        info!(
            attempted = self.trials_attempted,
            full = self.trials_fully_captured,
            partial = self.trials_partially_captured,
            failed = self.trials_failed,
            pages = self.pages_visited.len(),
            failed_pages = self.failed_pages.len(),
            malformed_cards = self.malformed_cards,
            stopped_early = self.stopped_early,
            "run finished"
        );
        for f in &self.failures {
            warn!(trial_id = %f.trial_id, stage = %f.stage, capture = ?f.capture, "{}", f.reason);
        }
    }
}

// ── Failure CSV ───────────────────────────────────────────────────────────────

pub fn write_failures_csv(path: &Path, rows: &[TrialFailure]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    info!("Wrote {} failure row(s) to {:?}", rows.len(), path);
    Ok(())
}

pub fn read_failures_csv(path: &Path) -> Result<Vec<TrialFailure>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    reader.deserialize().collect()
}
