//! Persistence layer: one blob per trial capture plus one keyed record per trial.
//!
//! Both writes are idempotent overwrites keyed by trial_id (last writer wins).
//! The record-store item is replaced wholesale, never field-merged, so a later
//! partial capture can reduce the completeness of an earlier full one.

pub mod blob_store;
pub mod record_store;

use crate::error::PersistError;
use crate::models::{TrialCapture, TrialRow};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

pub use self::blob_store::FsBlobStore;
pub use self::record_store::DuckDbRecordStore;

// ── Store traits ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `body` under `key`, replacing any existing object.
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), PersistError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or wholesale-replace the item for `row.trial_id`.
    async fn upsert(&self, row: &TrialRow) -> Result<(), PersistError>;
}

// ── Persistence ───────────────────────────────────────────────────────────────

/// Outcome of the two independent writes for one capture.
#[derive(Debug)]
pub struct PersistResult {
    pub blob_key: String,
    pub blob: Result<(), PersistError>,
    pub record: Result<(), PersistError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Stored,
    /// Exactly one of the two writes failed.
    Degraded,
    Failed,
}

impl PersistResult {
    pub fn outcome(&self) -> PersistOutcome {
        match (self.blob.is_ok(), self.record.is_ok()) {
            (true, true) => PersistOutcome::Stored,
            (false, false) => PersistOutcome::Failed,
            _ => PersistOutcome::Degraded,
        }
    }
}

#[derive(Clone)]
pub struct Persistence {
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    historize: bool,
}

impl Persistence {
    pub fn new(blobs: Arc<dyn BlobStore>, records: Arc<dyn RecordStore>, historize: bool) -> Self {
        Self { blobs, records, historize }
    }

    /// Deterministic object key for a capture.
    pub fn blob_key(&self, capture: &TrialCapture) -> String {
        if self.historize {
            format!(
                "{}/capture-{}.json",
                capture.trial_id,
                capture.fetched_at.format("%Y%m%dT%H%M%SZ")
            )
        } else {
            format!("{}/capture.json", capture.trial_id)
        }
    }

    pub async fn persist(&self, capture: &TrialCapture) -> PersistResult {
        let blob_key = self.blob_key(capture);

        let blob = match serde_json::to_vec_pretty(capture) {
            Ok(body) => self.blobs.put(&blob_key, body).await,
            Err(source) => Err(PersistError::Serialize {
                trial_id: capture.trial_id.clone(),
                source,
            }),
        };

        let record = match TrialRow::from_capture(capture) {
            Ok(row) => self.records.upsert(&row).await,
            Err(source) => Err(PersistError::Serialize {
                trial_id: capture.trial_id.clone(),
                source,
            }),
        };

        if let Err(e) = &blob {
            warn!(trial_id = %capture.trial_id, "blob write failed: {}", e);
        }
        if let Err(e) = &record {
            warn!(trial_id = %capture.trial_id, "record upsert failed: {}", e);
        }
        debug!(trial_id = %capture.trial_id, key = %blob_key, "persisted capture");

        PersistResult { blob_key, blob, record }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory stores for tests.

    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryBlobStore {
        pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
        pub fail: bool,
    }

    #[async_trait]
    impl BlobStore for MemoryBlobStore {
        async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), PersistError> {
            if self.fail {
                return Err(PersistError::Blob {
                    key: key.to_string(),
                    source: std::io::Error::other("blob store unreachable"),
                });
            }
            self.objects.lock().unwrap().insert(key.to_string(), body);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemoryRecordStore {
        pub rows: Mutex<BTreeMap<String, TrialRow>>,
        pub fail: bool,
    }

    #[async_trait]
    impl RecordStore for MemoryRecordStore {
        async fn upsert(&self, row: &TrialRow) -> Result<(), PersistError> {
            if self.fail {
                return Err(PersistError::Poisoned);
            }
            self.rows
                .lock()
                .unwrap()
                .insert(row.trial_id.clone(), row.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::models::*;
    use chrono::{TimeZone, Utc};
    use std::collections::{BTreeMap, BTreeSet};

    pub fn summary(trial_id: &str) -> TrialSummary {
        TrialSummary {
            trial_id: trial_id.to_string(),
            title: Reported::Reported("A study".into()),
            sponsor: Reported::Reported("Acme".into()),
            countries: BTreeSet::from(["DE".to_string()]),
            listing_page_number: 1,
            sponsor_protocol_number: Reported::NotReported,
            medical_condition: Reported::Reported("Asthma".into()),
            disease: Reported::NotReported,
            population_age: Reported::NotReported,
            gender: Reported::Reported("Female, Male".into()),
            start_date: Reported::Reported(CalendarDate::Parsed(
                chrono::NaiveDate::from_ymd_opt(2022, 3, 1).unwrap(),
            )),
            protocol_links: Vec::new(),
            results_url: None,
        }
    }

    pub fn capture(trial_id: &str, condition: Option<&str>) -> TrialCapture {
        let mut protocol = ProtocolRecord::not_reported(trial_id);
        protocol.medical_condition = condition.map(str::to_string).into();
        protocol.full_title = Reported::Reported("Full title".into());
        protocol.clinical_trial_type = Reported::Reported("EEA CTA".into());
        protocol.sponsor_status = Reported::Reported("Commercial".into());
        TrialCapture {
            trial_id: trial_id.to_string(),
            fetched_at: Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap(),
            raw_html: BTreeMap::from([(page_type::CARD.to_string(), "<table/>".to_string())]),
            summary: summary(trial_id),
            protocol,
            result: Some(ResultRecord::not_available(trial_id)),
            missing: Vec::new(),
        }
    }
}
