use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ── Field states ──────────────────────────────────────────────────────────────

/// A field that may be absent in the source. Absence is kept explicit so the
/// persisted schema never loses a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Reported<T> {
    Reported(T),
    NotReported,
}

impl<T> Reported<T> {
    pub fn is_reported(&self) -> bool {
        matches!(self, Reported::Reported(_))
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Reported::Reported(v) => Some(v),
            Reported::NotReported => None,
        }
    }
}

impl<T> Default for Reported<T> {
    fn default() -> Self {
        Reported::NotReported
    }
}

impl<T> From<Option<T>> for Reported<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Reported::Reported(v),
            None => Reported::NotReported,
        }
    }
}

/// A source date: either canonicalised or kept verbatim when the format is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CalendarDate {
    Parsed(NaiveDate),
    Unparsed(String),
}

impl CalendarDate {
    /// Canonical rendering: ISO date, or the raw text for unparsed values.
    pub fn canonical(&self) -> String {
        match self {
            CalendarDate::Parsed(d) => d.format("%Y-%m-%d").to_string(),
            CalendarDate::Unparsed(raw) => raw.clone(),
        }
    }
}

// ── Listing ───────────────────────────────────────────────────────────────────

/// One per-member-state protocol link on a trial card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolLink {
    pub country_code: String,
    pub listed_status: Reported<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialSummary {
    pub trial_id: String,
    pub title: Reported<String>,
    pub sponsor: Reported<String>,
    pub countries: BTreeSet<String>,
    pub listing_page_number: u32,
    pub sponsor_protocol_number: Reported<String>,
    pub medical_condition: Reported<String>,
    pub disease: Reported<String>,
    pub population_age: Reported<String>,
    pub gender: Reported<String>,
    pub start_date: Reported<CalendarDate>,
    pub protocol_links: Vec<ProtocolLink>,
    pub results_url: Option<String>,
}

/// A parsed card together with the HTML fragment it came from.
#[derive(Debug, Clone)]
pub struct ListingCard {
    pub summary: TrialSummary,
    pub raw_html: String,
}

// ── Protocol ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRecord {
    pub trial_id: String,
    pub sponsor_protocol_code: Reported<String>,
    pub eudract_number: Reported<String>,
    pub medical_condition: Reported<String>,
    pub trial_phase: Reported<String>,
    pub population: Reported<String>,
    pub endpoints: Reported<Vec<String>>,
    pub member_state_statuses: BTreeMap<String, Reported<String>>,
    pub full_title: Reported<String>,
    pub clinical_trial_type: Reported<String>,
    pub sponsor_status: Reported<String>,
    pub first_entered: Reported<CalendarDate>,
}

impl ProtocolRecord {
    /// Record for a trial with no protocol section at all.
    pub fn not_reported(trial_id: &str) -> Self {
        Self {
            trial_id: trial_id.to_string(),
            sponsor_protocol_code: Reported::NotReported,
            eudract_number: Reported::NotReported,
            medical_condition: Reported::NotReported,
            trial_phase: Reported::NotReported,
            population: Reported::NotReported,
            endpoints: Reported::NotReported,
            member_state_statuses: BTreeMap::new(),
            full_title: Reported::NotReported,
            clinical_trial_type: Reported::NotReported,
            sponsor_status: Reported::NotReported,
            first_entered: Reported::NotReported,
        }
    }
}

/// One fetched protocol page, tagged with the member state it belongs to.
#[derive(Debug, Clone)]
pub struct ProtocolPage {
    pub country_code: String,
    pub listed_status: Reported<String>,
    pub html: String,
}

// ── Results ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultsStatus {
    NotAvailable,
    Available,
}

impl ResultsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultsStatus::NotAvailable => "NOT_AVAILABLE",
            ResultsStatus::Available => "AVAILABLE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub trial_id: String,
    pub results_status: ResultsStatus,
    pub summary_fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coverage_warnings: Vec<String>,
}

impl ResultRecord {
    pub fn not_available(trial_id: &str) -> Self {
        Self {
            trial_id: trial_id.to_string(),
            results_status: ResultsStatus::NotAvailable,
            summary_fields: BTreeMap::new(),
            coverage_warnings: Vec::new(),
        }
    }
}

// ── Capture ───────────────────────────────────────────────────────────────────

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ListingFetch,
    ProtocolFetch,
    ResultsFetch,
    BlobWrite,
    RecordWrite,
    Task,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::ListingFetch => "listing_fetch",
            Stage::ProtocolFetch => "protocol_fetch",
            Stage::ResultsFetch => "results_fetch",
            Stage::BlobWrite => "blob_write",
            Stage::RecordWrite => "record_write",
            Stage::Task => "task",
        };
        f.write_str(s)
    }
}

/// A section that could not be captured for a trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingSection {
    pub stage: Stage,
    pub page: String,
    pub reason: String,
}

/// Keys for `TrialCapture::raw_html`.
pub mod page_type {
    pub const CARD: &str = "card";
    pub const RESULTS: &str = "results";

    pub fn protocol(country_code: &str) -> String {
        format!("protocol/{}", country_code)
    }
}

/// The unit of persistence: raw pages plus the normalised record for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialCapture {
    pub trial_id: String,
    pub fetched_at: DateTime<Utc>,
    pub raw_html: BTreeMap<String, String>,
    pub summary: TrialSummary,
    pub protocol: ProtocolRecord,
    /// `None` only when the results section could not be fetched; see `missing`.
    pub result: Option<ResultRecord>,
    pub missing: Vec<MissingSection>,
}

impl TrialCapture {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

// ── Record-store row ──────────────────────────────────────────────────────────

/// Flattened attributes written to the keyed record store.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialRow {
    pub trial_id: String,
    pub title: Option<String>,
    pub sponsor: Option<String>,
    pub countries: String,
    pub listing_page: i64,
    pub disease: Option<String>,
    pub population_age: Option<String>,
    pub gender: Option<String>,
    pub start_date: Option<String>,
    /// JSON object: country code → protocol page URL.
    pub protocol_urls: String,
    pub results_url: Option<String>,
    pub sponsor_protocol_code: Option<String>,
    pub eudract_number: Option<String>,
    pub medical_condition: Option<String>,
    pub trial_phase: Option<String>,
    pub population: Option<String>,
    pub endpoints: Option<String>,
    pub member_state_statuses: String,
    pub first_entered: Option<String>,
    pub clinical_trial_type: Option<String>,
    pub sponsor_status: Option<String>,
    pub results_status: Option<String>,
    pub result_fields: Option<String>,
    pub coverage_warnings: Option<String>,
    pub capture_status: String,
    pub missing_sections: String,
    pub fetched_at: chrono::NaiveDateTime,
}

impl TrialRow {
    pub fn from_capture(capture: &TrialCapture) -> Result<Self, serde_json::Error> {
        let protocol = &capture.protocol;
        let summary = &capture.summary;

        let title = protocol
            .full_title
            .as_option()
            .or(summary.title.as_option())
            .cloned();
        let medical_condition = protocol
            .medical_condition
            .as_option()
            .or(summary.medical_condition.as_option())
            .cloned();

        let endpoints = match protocol.endpoints.as_option() {
            Some(list) => Some(serde_json::to_string(list)?),
            None => None,
        };
        let statuses: BTreeMap<&String, Option<&String>> = protocol
            .member_state_statuses
            .iter()
            .map(|(k, v)| (k, v.as_option()))
            .collect();
        let result_fields = match &capture.result {
            Some(r) if !r.summary_fields.is_empty() => Some(serde_json::to_string(&r.summary_fields)?),
            _ => None,
        };
        let coverage_warnings = match &capture.result {
            Some(r) if !r.coverage_warnings.is_empty() => {
                Some(serde_json::to_string(&r.coverage_warnings)?)
            }
            _ => None,
        };
        let protocol_urls: BTreeMap<&String, &String> = summary
            .protocol_links
            .iter()
            .map(|l| (&l.country_code, &l.url))
            .collect();

        Ok(Self {
            trial_id: capture.trial_id.clone(),
            title,
            sponsor: summary.sponsor.as_option().cloned(),
            countries: serde_json::to_string(&summary.countries)?,
            listing_page: summary.listing_page_number as i64,
            disease: summary.disease.as_option().cloned(),
            population_age: summary.population_age.as_option().cloned(),
            gender: summary.gender.as_option().cloned(),
            start_date: summary.start_date.as_option().map(CalendarDate::canonical),
            protocol_urls: serde_json::to_string(&protocol_urls)?,
            results_url: summary.results_url.clone(),
            sponsor_protocol_code: protocol
                .sponsor_protocol_code
                .as_option()
                .or(summary.sponsor_protocol_number.as_option())
                .cloned(),
            eudract_number: protocol.eudract_number.as_option().cloned(),
            medical_condition,
            trial_phase: protocol.trial_phase.as_option().cloned(),
            population: protocol.population.as_option().cloned(),
            endpoints,
            member_state_statuses: serde_json::to_string(&statuses)?,
            first_entered: protocol.first_entered.as_option().map(CalendarDate::canonical),
            clinical_trial_type: protocol.clinical_trial_type.as_option().cloned(),
            sponsor_status: protocol.sponsor_status.as_option().cloned(),
            results_status: capture
                .result
                .as_ref()
                .map(|r| r.results_status.as_str().to_string()),
            result_fields,
            coverage_warnings,
            capture_status: if capture.is_complete() { "full" } else { "partial" }.to_string(),
            missing_sections: serde_json::to_string(&capture.missing)?,
            fetched_at: capture.fetched_at.naive_utc(),
        })
    }
}
