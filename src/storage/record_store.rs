use super::RecordStore;
use crate::config::validate_identifier;
use crate::error::PersistError;
use crate::models::TrialRow;
use crate::pipeline::report::RunReport;
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use duckdb::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

// ── Schema ────────────────────────────────────────────────────────────────────

fn ddl(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    trial_id               VARCHAR PRIMARY KEY,
    title                  VARCHAR,
    sponsor                VARCHAR,
    countries              VARCHAR NOT NULL,
    listing_page           BIGINT NOT NULL,
    disease                VARCHAR,
    population_age         VARCHAR,
    gender                 VARCHAR,
    start_date             VARCHAR,
    protocol_urls          VARCHAR NOT NULL,
    results_url            VARCHAR,
    sponsor_protocol_code  VARCHAR,
    eudract_number         VARCHAR,
    medical_condition      VARCHAR,
    trial_phase            VARCHAR,
    population             VARCHAR,
    -- JSON arrays / objects
    endpoints              VARCHAR,
    member_state_statuses  VARCHAR NOT NULL,
    first_entered          VARCHAR,
    clinical_trial_type    VARCHAR,
    sponsor_status         VARCHAR,
    results_status         VARCHAR,
    result_fields          VARCHAR,
    coverage_warnings      VARCHAR,
    capture_status         VARCHAR NOT NULL,
    missing_sections       VARCHAR NOT NULL,
    fetched_at             TIMESTAMP NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS scrape_runs_id_seq;

CREATE TABLE IF NOT EXISTS scrape_runs (
    id                          BIGINT PRIMARY KEY DEFAULT nextval('scrape_runs_id_seq'),
    finished_at                 TIMESTAMP NOT NULL,
    trials_attempted            BIGINT NOT NULL,
    trials_fully_captured       BIGINT NOT NULL,
    trials_partially_captured   BIGINT NOT NULL,
    trials_failed               BIGINT NOT NULL,
    pages_visited               BIGINT NOT NULL,
    stopped_early               BOOLEAN NOT NULL
);
"#
    )
}

/// A past run as recorded in `scrape_runs`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLogEntry {
    pub finished_at: NaiveDateTime,
    pub attempted: i64,
    pub full: i64,
    pub partial: i64,
    pub failed: i64,
}

/// Columns read back for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTrial {
    pub trial_id: String,
    pub title: Option<String>,
    pub medical_condition: Option<String>,
    pub gender: Option<String>,
    pub start_date: Option<String>,
    pub clinical_trial_type: Option<String>,
    pub sponsor_status: Option<String>,
    pub results_status: Option<String>,
    pub coverage_warnings: Option<String>,
    pub capture_status: String,
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Keyed record store backed by DuckDB; one row per trial_id.
pub struct DuckDbRecordStore {
    conn: Mutex<Connection>,
    table: String,
}

impl DuckDbRecordStore {
    pub fn open(path: &Path, table: &str) -> Result<Self, PersistError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PersistError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, table)
    }

    pub fn open_in_memory(table: &str) -> Result<Self, PersistError> {
        Self::with_connection(Connection::open_in_memory()?, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self, PersistError> {
        validate_identifier(table)?;
        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PersistError> {
        self.conn.lock().map_err(|_| PersistError::Poisoned)
    }

    pub fn run_migrations(&self) -> Result<(), PersistError> {
        info!(table = %self.table, "Running migrations…");
        self.conn()?.execute_batch(&ddl(&self.table))?;
        info!("Migrations done.");
        Ok(())
    }

    pub fn count(&self) -> Result<i64, PersistError> {
        let conn = self.conn()?;
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        Ok(conn.query_row(&sql, [], |r| r.get(0))?)
    }

    pub fn get(&self, trial_id: &str) -> Result<Option<StoredTrial>, PersistError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT trial_id, title, medical_condition, gender, start_date,
                    clinical_trial_type, sponsor_status, results_status,
                    coverage_warnings, capture_status
             FROM {} WHERE trial_id = ?",
            self.table
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![trial_id], |r| {
            Ok(StoredTrial {
                trial_id: r.get(0)?,
                title: r.get(1)?,
                medical_condition: r.get(2)?,
                gender: r.get(3)?,
                start_date: r.get(4)?,
                clinical_trial_type: r.get(5)?,
                sponsor_status: r.get(6)?,
                results_status: r.get(7)?,
                coverage_warnings: r.get(8)?,
                capture_status: r.get(9)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    // ── Run log ───────────────────────────────────────────────────────────────

    pub fn log_run(&self, report: &RunReport) -> Result<(), PersistError> {
        self.conn()?.execute(
            r#"INSERT INTO scrape_runs
               (finished_at, trials_attempted, trials_fully_captured,
                trials_partially_captured, trials_failed, pages_visited, stopped_early)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            params![
                Utc::now().naive_utc(),
                report.trials_attempted as i64,
                report.trials_fully_captured as i64,
                report.trials_partially_captured as i64,
                report.trials_failed as i64,
                report.pages_visited.len() as i64,
                report.stopped_early,
            ],
        )?;
        Ok(())
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunLogEntry>, PersistError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT finished_at, trials_attempted, trials_fully_captured,
                      trials_partially_captured, trials_failed
               FROM scrape_runs ORDER BY id DESC LIMIT ?"#,
        )?;
        let runs = stmt
            .query_map(params![limit as i64], |r| {
                Ok(RunLogEntry {
                    finished_at: r.get(0)?,
                    attempted: r.get(1)?,
                    full: r.get(2)?,
                    partial: r.get(3)?,
                    failed: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}

#[async_trait]
impl RecordStore for DuckDbRecordStore {
    /// INSERT OR REPLACE: an existing row for the trial is replaced wholesale.
    async fn upsert(&self, row: &TrialRow) -> Result<(), PersistError> {
        let sql = format!(
            r#"INSERT OR REPLACE INTO {} (
                   trial_id, title, sponsor, countries, listing_page,
                   disease, population_age, gender, start_date, protocol_urls, results_url,
                   sponsor_protocol_code, eudract_number, medical_condition,
                   trial_phase, population, endpoints, member_state_statuses,
                   first_entered, clinical_trial_type, sponsor_status,
                   results_status, result_fields, coverage_warnings, capture_status,
                   missing_sections, fetched_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                       ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            self.table
        );

        self.conn()?
            .execute(
                &sql,
                params![
                    row.trial_id,
                    row.title,
                    row.sponsor,
                    row.countries,
                    row.listing_page,
                    row.disease,
                    row.population_age,
                    row.gender,
                    row.start_date,
                    row.protocol_urls,
                    row.results_url,
                    row.sponsor_protocol_code,
                    row.eudract_number,
                    row.medical_condition,
                    row.trial_phase,
                    row.population,
                    row.endpoints,
                    row.member_state_statuses,
                    row.first_entered,
                    row.clinical_trial_type,
                    row.sponsor_status,
                    row.results_status,
                    row.result_fields,
                    row.coverage_warnings,
                    row.capture_status,
                    row.missing_sections,
                    row.fetched_at,
                ],
            )
            .map_err(|source| PersistError::Record {
                trial_id: row.trial_id.clone(),
                source,
            })?;
        Ok(())
    }
}
