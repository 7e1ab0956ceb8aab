//! Pipeline orchestrator: ties scraper → storage together.
//!
//! ## Scan modes
//!
//! `ScanRange::Pages` walks listing pages `start..=end`, stopping early at the
//! first page without cards (the register's real last page was passed).
//!
//! `ScanRange::Dates` first asks the search endpoint how many pages the date
//! filter yields, then walks `1..=pages` exactly like page mode.
//!
//! Each page goes through
//! `FETCHING_LISTING → DISPATCHING_DETAILS → PERSISTING → (NEXT_PAGE | DONE)`.
//! Trial-level problems are tallied in the `RunReport`; only configuration and
//! infrastructure failures abort a run.

pub mod report;

use crate::config::{AppConfig, PipelineConfig};
use crate::error::{ConfigurationError, PipelineError};
use crate::models::{
    ListingCard, MissingSection, ProtocolPage, ResultRecord, Stage, TrialCapture, page_type,
};
use crate::scraper::parsers::card::ParsedListing;
use crate::scraper::parsers::{parse_listing, parse_protocol, parse_result, parse_search_outcome};
use crate::scraper::{ListingQuery, PageSource, Register, listing_page_of};
use crate::storage::{PersistOutcome, Persistence};
use chrono::{NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};
use url::Url;

pub use self::report::{CaptureStatus, RunReport, TrialFailure};

// ── Scan range ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRange {
    Dates { start: NaiveDate, end: NaiveDate },
    Pages { start: u32, end: u32 },
}

impl ScanRange {
    /// Pick the scan mode from optional CLI bounds. Exactly one complete pair
    /// must be given.
    pub fn from_bounds(
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
        start_page: Option<u32>,
        end_page: Option<u32>,
    ) -> Result<Self, ConfigurationError> {
        let any_date = start_date.is_some() || end_date.is_some();
        let any_page = start_page.is_some() || end_page.is_some();

        match (any_date, any_page) {
            (false, false) => Err(ConfigurationError::MissingRange),
            (true, true) => Err(ConfigurationError::BothModes),
            (true, false) => {
                let (Some(start), Some(end)) = (start_date, end_date) else {
                    return Err(ConfigurationError::IncompleteDateRange);
                };
                if start > end {
                    return Err(ConfigurationError::StartAfterEnd {
                        start: start.to_string(),
                        end: end.to_string(),
                    });
                }
                Ok(ScanRange::Dates { start, end })
            }
            (false, true) => {
                let (Some(start), Some(end)) = (start_page, end_page) else {
                    return Err(ConfigurationError::IncompletePageRange);
                };
                if start == 0 {
                    return Err(ConfigurationError::ZeroPage);
                }
                if start > end {
                    return Err(ConfigurationError::StartAfterEnd {
                        start: start.to_string(),
                        end: end.to_string(),
                    });
                }
                Ok(ScanRange::Pages { start, end })
            }
        }
    }
}

// ── Per-trial work ────────────────────────────────────────────────────────────

/// What a detail task hands back to the orchestrator.
#[derive(Debug)]
enum TrialOutcome {
    Captured(Box<TrialCapture>),
    Failed(TrialFailure),
    /// Not started because a stop was requested.
    Skipped,
}

/// Fetch and parse the protocol and results sections of one card.
async fn capture_trial(source: &dyn PageSource, card: ListingCard, listing_url: &str) -> TrialOutcome {
    let ListingCard { summary, raw_html: card_html } = card;
    let trial_id = summary.trial_id.clone();

    let mut raw_html = BTreeMap::from([(page_type::CARD.to_string(), card_html)]);
    let mut missing = Vec::new();

    let mut pages = Vec::with_capacity(summary.protocol_links.len());
    let mut unfetched = Vec::new();
    for link in &summary.protocol_links {
        let key = page_type::protocol(&link.country_code);
        match source.fetch(&link.url).await {
            Ok(content) => {
                raw_html.insert(key, content.body.clone());
                pages.push(ProtocolPage {
                    country_code: link.country_code.clone(),
                    listed_status: link.listed_status.clone(),
                    html: content.body,
                });
            }
            Err(e) => {
                warn!(trial_id = %trial_id, country = %link.country_code, "protocol fetch failed: {}", e);
                unfetched.push(link);
                missing.push(MissingSection {
                    stage: Stage::ProtocolFetch,
                    page: key,
                    reason: e.to_string(),
                });
            }
        }
    }

    if !summary.protocol_links.is_empty() && pages.is_empty() {
        return TrialOutcome::Failed(TrialFailure {
            trial_id,
            listing_url: listing_url.to_string(),
            stage: Stage::ProtocolFetch,
            capture: CaptureStatus::Failed,
            reason: join_reasons(&missing),
        });
    }

    let mut protocol = parse_protocol(&trial_id, &pages);
    // The card still tells us the status of member states whose page failed.
    for link in unfetched {
        protocol
            .member_state_statuses
            .entry(link.country_code.clone())
            .or_insert_with(|| link.listed_status.clone());
    }

    let result = match &summary.results_url {
        None => Some(ResultRecord::not_available(&trial_id)),
        Some(url) => match source.fetch(url).await {
            Ok(content) => {
                let record = parse_result(&trial_id, &content.body)
                    .unwrap_or_else(|| ResultRecord::not_available(&trial_id));
                raw_html.insert(page_type::RESULTS.to_string(), content.body);
                Some(record)
            }
            Err(e) => {
                warn!(trial_id = %trial_id, "results fetch failed: {}", e);
                missing.push(MissingSection {
                    stage: Stage::ResultsFetch,
                    page: page_type::RESULTS.to_string(),
                    reason: e.to_string(),
                });
                None
            }
        },
    };

    debug!(trial_id = %trial_id, pages = pages.len(), missing = missing.len(), "trial assembled");

    TrialOutcome::Captured(Box::new(TrialCapture {
        trial_id,
        fetched_at: Utc::now(),
        raw_html,
        summary,
        protocol,
        result,
        missing,
    }))
}

fn join_reasons(missing: &[MissingSection]) -> String {
    missing
        .iter()
        .map(|m| format!("{}: {}", m.page, m.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

#[derive(Debug)]
enum ScanState {
    Init,
    FetchingListing(u32),
    DispatchingDetails { page: u32, url: String, cards: Vec<ListingCard> },
    Persisting { page: u32, url: String, outcomes: Vec<(String, TrialOutcome)> },
    NextPage(u32),
    Done,
}

/// Mutable bookkeeping for one run.
#[derive(Debug)]
struct Progress {
    report: RunReport,
    first_listing: bool,
    first_persist: bool,
}

impl Progress {
    fn new() -> Self {
        Self {
            report: RunReport::default(),
            first_listing: true,
            first_persist: true,
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    register: Register,
    source: Arc<dyn PageSource>,
    persistence: Persistence,
    stop: watch::Receiver<bool>,
}

impl Pipeline {
    pub fn new(
        config: &AppConfig,
        source: Arc<dyn PageSource>,
        persistence: Persistence,
    ) -> Result<Self, ConfigurationError> {
        // Sender dropped: the flag stays false unless `with_stop` replaces it.
        let (_, stop) = watch::channel(false);
        Ok(Self {
            config: config.pipeline.clone(),
            register: Register::new(&config.register.base_url)?,
            source,
            persistence,
            stop,
        })
    }

    /// Finish the trials already started, persist them, then end the run.
    pub fn with_stop(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = stop;
        self
    }

    pub async fn run(&self, range: ScanRange) -> Result<RunReport, PipelineError> {
        let (query, first, last) = match range {
            ScanRange::Pages { start, end } => (ListingQuery::All, start, end),
            ScanRange::Dates { start, end } => {
                let query = ListingQuery::Dates { from: start, to: end };
                let pages = self.resolve_pages(&query).await?;
                if pages == 0 {
                    info!(%start, %end, "no trials in date range");
                    return Ok(RunReport::default());
                }
                (query, 1, pages)
            }
        };

        info!(first, last, concurrency = self.config.effective_concurrency(), "=== Scanning listing pages ===");
        let mut progress = Progress::new();
        self.scan(&query, first, last, &mut progress).await?;

        progress.report.log_summary();
        Ok(progress.report)
    }

    /// Re-run only what a previous failure report lists, one listing page at a time.
    pub async fn retry_failures(&self, failures: Vec<TrialFailure>) -> Result<RunReport, PipelineError> {
        // listing url -> wanted trial ids (None: every card on the page)
        let mut wanted: BTreeMap<String, Option<BTreeSet<String>>> = BTreeMap::new();
        for f in failures {
            let entry = wanted
                .entry(f.listing_url.clone())
                .or_insert_with(|| Some(BTreeSet::new()));
            if f.covers_whole_page() {
                *entry = None;
            } else if let Some(ids) = entry {
                ids.insert(f.trial_id);
            }
        }

        info!(pages = wanted.len(), "=== Retrying failures ===");
        let mut progress = Progress::new();

        for (url, ids) in wanted {
            if stop_requested(&self.stop) {
                progress.report.stopped_early = true;
                break;
            }
            let page = listing_page_of(&url).unwrap_or(0);
            let Some(listing) = self.fetch_listing(&url, page, &mut progress).await? else {
                continue;
            };
            let mut cards = listing.cards;
            if let Some(ids) = &ids {
                cards.retain(|c| ids.contains(&c.summary.trial_id));
                // Re-ranking can move a trial off its old page; keep it in the report.
                for id in ids {
                    if !cards.iter().any(|c| &c.summary.trial_id == id) {
                        warn!(trial_id = %id, url = %url, "trial no longer on its listing page");
                        progress.report.record_failed(TrialFailure {
                            trial_id: id.clone(),
                            listing_url: url.clone(),
                            stage: Stage::ListingFetch,
                            capture: CaptureStatus::Failed,
                            reason: "not found on listing page".to_string(),
                        });
                    }
                }
            }
            let outcomes = self.dispatch(&url, cards).await;
            self.persist_page(page, &url, outcomes, &mut progress).await?;
        }

        progress.report.log_summary();
        Ok(progress.report)
    }

    async fn resolve_pages(&self, query: &ListingQuery) -> Result<u32, PipelineError> {
        let url = self.register.outcome_url(query);
        let content = self.source.fetch(&url).await?;
        let outcome = parse_search_outcome(&content.body)?;
        info!(results = outcome.results, pages = outcome.pages, "date range resolved");
        Ok(outcome.pages)
    }

    async fn scan(
        &self,
        query: &ListingQuery,
        first: u32,
        last: u32,
        progress: &mut Progress,
    ) -> Result<(), PipelineError> {
        let mut state = ScanState::Init;

        loop {
            state = match state {
                ScanState::Init => ScanState::FetchingListing(first),

                ScanState::FetchingListing(page) => {
                    if stop_requested(&self.stop) {
                        progress.report.stopped_early = true;
                        ScanState::Done
                    } else {
                        let url = self.register.listing_url(query, page);
                        match self.fetch_listing(&url, page, progress).await? {
                            Some(listing) if listing.cards.is_empty() && listing.malformed == 0 => {
                                info!(page, "page has no cards, end of listing reached");
                                ScanState::Done
                            }
                            Some(listing) if listing.cards.is_empty() => {
                                warn!(page, malformed = listing.malformed, "no valid cards on page");
                                ScanState::NextPage(page)
                            }
                            Some(listing) => ScanState::DispatchingDetails {
                                page,
                                url,
                                cards: listing.cards,
                            },
                            None => ScanState::NextPage(page),
                        }
                    }
                }

                ScanState::DispatchingDetails { page, url, cards } => {
                    info!(page, trials = cards.len(), "dispatching detail fetches");
                    let outcomes = self.dispatch(&url, cards).await;
                    ScanState::Persisting { page, url, outcomes }
                }

                ScanState::Persisting { page, url, outcomes } => {
                    self.persist_page(page, &url, outcomes, progress).await?;
                    if progress.report.stopped_early {
                        ScanState::Done
                    } else {
                        ScanState::NextPage(page)
                    }
                }

                ScanState::NextPage(page) if page >= last => ScanState::Done,
                ScanState::NextPage(page) => ScanState::FetchingListing(page + 1),

                ScanState::Done => break,
            };
        }
        Ok(())
    }

    /// `Ok(None)` when the page could not be read; it is recorded and skipped.
    async fn fetch_listing(
        &self,
        url: &str,
        page: u32,
        progress: &mut Progress,
    ) -> Result<Option<ParsedListing>, PipelineError> {
        let first = std::mem::replace(&mut progress.first_listing, false);

        let content = match self.source.fetch(url).await {
            Ok(content) => content,
            Err(e) if first && e.is_connection_loss() => {
                error!(url, "register unreachable: {}", e);
                return Err(PipelineError::Infrastructure(e.to_string()));
            }
            Err(e) => {
                progress.report.record_failed_page(page, url, e.to_string());
                return Ok(None);
            }
        };

        progress.report.pages_visited.push(page);
        // Relative card links resolve against the page actually served.
        let base = Url::parse(&content.url).unwrap_or_else(|_| self.register.base().clone());
        match parse_listing(&content.body, page, &base) {
            Ok(listing) => {
                progress.report.malformed_cards += listing.malformed;
                Ok(Some(listing))
            }
            Err(e) => {
                progress.report.record_failed_page(page, url, e.to_string());
                Ok(None)
            }
        }
    }

    /// Run the detail fetches for one page under the concurrency limit.
    /// Outcomes come back in card order.
    async fn dispatch(&self, listing_url: &str, cards: Vec<ListingCard>) -> Vec<(String, TrialOutcome)> {
        let sem = Arc::new(Semaphore::new(self.config.effective_concurrency()));
        let mut handles = Vec::with_capacity(cards.len());

        for card in cards {
            let trial_id = card.summary.trial_id.clone();
            let source = Arc::clone(&self.source);
            let sem = Arc::clone(&sem);
            let stop = self.stop.clone();
            let listing_url = listing_url.to_string();

            let handle = tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return TrialOutcome::Skipped;
                };
                if stop_requested(&stop) {
                    return TrialOutcome::Skipped;
                }
                capture_trial(source.as_ref(), card, &listing_url).await
            });

            handles.push((trial_id, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (trial_id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Task panic for {}: {}", trial_id, e);
                    TrialOutcome::Failed(TrialFailure {
                        trial_id: trial_id.clone(),
                        listing_url: listing_url.to_string(),
                        stage: Stage::Task,
                        capture: CaptureStatus::Failed,
                        reason: e.to_string(),
                    })
                }
            };
            outcomes.push((trial_id, outcome));
        }
        outcomes
    }

    /// Persist every assembled capture of a page, in card order, and tally.
    async fn persist_page(
        &self,
        page: u32,
        listing_url: &str,
        outcomes: Vec<(String, TrialOutcome)>,
        progress: &mut Progress,
    ) -> Result<(), PipelineError> {
        for (trial_id, outcome) in outcomes {
            let capture = match outcome {
                TrialOutcome::Captured(capture) => capture,
                TrialOutcome::Failed(failure) => {
                    warn!(trial_id = %trial_id, stage = %failure.stage, "trial failed: {}", failure.reason);
                    progress.report.record_failed(failure);
                    continue;
                }
                TrialOutcome::Skipped => {
                    debug!(trial_id = %trial_id, "skipped after stop request");
                    progress.report.stopped_early = true;
                    continue;
                }
            };

            let result = self.persistence.persist(&capture).await;
            let first = std::mem::replace(&mut progress.first_persist, false);

            let mut problems: Vec<(Stage, String)> = capture
                .missing
                .iter()
                .map(|m| (m.stage, format!("{}: {}", m.page, m.reason)))
                .collect();
            if let Err(e) = &result.blob {
                problems.push((Stage::BlobWrite, e.to_string()));
            }
            if let Err(e) = &result.record {
                problems.push((Stage::RecordWrite, e.to_string()));
            }

            let failure = |capture_status: CaptureStatus| TrialFailure {
                trial_id: trial_id.clone(),
                listing_url: listing_url.to_string(),
                stage: problems.first().map_or(Stage::Task, |(stage, _)| *stage),
                capture: capture_status,
                reason: problems
                    .iter()
                    .map(|(_, reason)| reason.as_str())
                    .collect::<Vec<_>>()
                    .join("; "),
            };

            match result.outcome() {
                PersistOutcome::Failed if first => {
                    error!(trial_id = %trial_id, "both stores failed on the first write of the run");
                    return Err(PipelineError::Infrastructure(failure(CaptureStatus::Failed).reason));
                }
                PersistOutcome::Failed => progress.report.record_failed(failure(CaptureStatus::Failed)),
                PersistOutcome::Stored if capture.is_complete() => {
                    info!(trial_id = %trial_id, page, blob = %result.blob_key, "captured");
                    progress.report.record_full();
                }
                PersistOutcome::Stored | PersistOutcome::Degraded => {
                    info!(trial_id = %trial_id, page, problems = problems.len(), "partially captured");
                    progress.report.record_partial(failure(CaptureStatus::Partial));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::scraper::PageContent;
    use crate::storage::memory::{MemoryBlobStore, MemoryRecordStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const BASE: &str = "https://www.clinicaltrialsregister.eu";

    /// Canned responses by URL; anything unknown is a 404.
    #[derive(Default)]
    struct StubSource {
        pages: HashMap<String, Result<String, FetchError>>,
        fetched: Mutex<Vec<String>>,
        /// Raise the stop flag as soon as this URL is requested.
        stop_on: Option<(String, watch::Sender<bool>)>,
    }

    impl StubSource {
        fn page(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
            self.pages.insert(url.into(), Ok(body.into()));
            self
        }

        fn failing(mut self, url: impl Into<String>, status: Option<u16>, attempts: u32) -> Self {
            let url = url.into();
            self.pages.insert(
                url.clone(),
                Err(FetchError {
                    url,
                    last_status: status,
                    attempts,
                    reason: "retries exhausted".into(),
                }),
            );
            self
        }

        fn stop_when_fetched(mut self, url: impl Into<String>, stop: watch::Sender<bool>) -> Self {
            self.stop_on = Some((url.into(), stop));
            self
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for StubSource {
        async fn fetch(&self, url: &str) -> Result<PageContent, FetchError> {
            self.fetched.lock().unwrap().push(url.to_string());
            if let Some((trigger, stop)) = &self.stop_on {
                if trigger == url {
                    stop.send(true).unwrap();
                }
            }
            match self.pages.get(url) {
                Some(Ok(body)) => Ok(PageContent {
                    url: url.to_string(),
                    status: 200,
                    body: body.clone(),
                }),
                Some(Err(e)) => Err(e.clone()),
                None => Err(FetchError {
                    url: url.to_string(),
                    last_status: Some(404),
                    attempts: 1,
                    reason: "HTTP 404 Not Found".into(),
                }),
            }
        }
    }

    fn card(id: &str, countries: &[&str], with_results: bool) -> String {
        let links: String = countries
            .iter()
            .map(|cc| format!(r#"<a href="/ctr-search/trial/{id}/{cc}">{cc}</a> (Ongoing) "#))
            .collect();
        let results = if with_results {
            format!(r#"<a href="/ctr-search/trial/{id}/results">View results</a>"#)
        } else {
            "(No results available)".to_string()
        };
        format!(
            r#"<table class="result">
                 <tr><td><span class="label">EudraCT Number:</span> {id}</td></tr>
                 <tr><td><span class="label">Full Title:</span> Trial {id}</td></tr>
                 <tr><td><span class="label">Trial protocol:</span> {links}</td></tr>
                 <tr><td><span class="label">Trial results:</span> {results}</td></tr>
               </table>"#
        )
    }

    fn listing(cards: &[String]) -> String {
        format!(r#"<html><body><div id="tabs">{}</div></body></html>"#, cards.concat())
    }

    fn protocol_page(cc: &str) -> String {
        format!(
            r#"<html><body><table>
                 <tr><td class="cellBlue" colspan="3">Summary</td></tr>
                 <tr><td></td><td>Trial Status</td><td>Ongoing in {cc}</td></tr>
                 <tr><td class="cellBlue" colspan="3">E. General Information on the Trial</td></tr>
                 <tr><td>E.1.1</td><td>Medical condition(s) being investigated</td><td>Asthma</td></tr>
               </table></body></html>"#
        )
    }

    fn protocol_url(id: &str, cc: &str) -> String {
        format!("{BASE}/ctr-search/trial/{id}/{cc}")
    }

    fn page_url(page: u32) -> String {
        format!("{BASE}/ctr-search/search?query=&page={page}")
    }

    struct Harness {
        source: Arc<StubSource>,
        blobs: Arc<MemoryBlobStore>,
        records: Arc<MemoryRecordStore>,
    }

    impl Harness {
        fn new(source: StubSource) -> Self {
            Self {
                source: Arc::new(source),
                blobs: Arc::new(MemoryBlobStore::default()),
                records: Arc::new(MemoryRecordStore::default()),
            }
        }

        fn pipeline(&self, concurrency: usize) -> Pipeline {
            let mut config = AppConfig::default();
            config.pipeline.concurrency = concurrency;
            let persistence = Persistence::new(self.blobs.clone(), self.records.clone(), false);
            Pipeline::new(&config, self.source.clone(), persistence).unwrap()
        }
    }

    #[test]
    fn test_scan_range_validation() {
        let d = |day| NaiveDate::from_ymd_opt(2022, 12, day);

        assert!(matches!(
            ScanRange::from_bounds(None, None, None, None),
            Err(ConfigurationError::MissingRange)
        ));
        assert!(matches!(
            ScanRange::from_bounds(d(1), d(31), Some(1), Some(2)),
            Err(ConfigurationError::BothModes)
        ));
        assert!(matches!(
            ScanRange::from_bounds(d(1), None, None, None),
            Err(ConfigurationError::IncompleteDateRange)
        ));
        assert!(matches!(
            ScanRange::from_bounds(None, None, None, Some(3)),
            Err(ConfigurationError::IncompletePageRange)
        ));
        assert!(matches!(
            ScanRange::from_bounds(d(31), d(1), None, None),
            Err(ConfigurationError::StartAfterEnd { .. })
        ));
        assert!(matches!(
            ScanRange::from_bounds(None, None, Some(9), Some(3)),
            Err(ConfigurationError::StartAfterEnd { .. })
        ));
        assert!(matches!(
            ScanRange::from_bounds(None, None, Some(0), Some(3)),
            Err(ConfigurationError::ZeroPage)
        ));
        assert_eq!(
            ScanRange::from_bounds(None, None, Some(5), Some(5)).unwrap(),
            ScanRange::Pages { start: 5, end: 5 }
        );
    }

    #[tokio::test]
    async fn test_page_past_the_end_attempts_nothing() {
        let h = Harness::new(StubSource::default().page(page_url(5), listing(&[])));
        let report = h.pipeline(1).run(ScanRange::Pages { start: 5, end: 5 }).await.unwrap();

        assert_eq!(report.trials_attempted, 0);
        assert_eq!(report.pages_visited, vec![5]);
        assert!(report.failures.is_empty());
        assert!(h.records.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_date_range_resolves_to_reported_page_count() {
        let outcome_url =
            format!("{BASE}/ctr-search/search?query=&dateFrom=2022-12-01&dateTo=2022-12-31");
        let outcome = r#"<div id="tabs-1"><div class="outcome">
            140 result(s) found. Displaying page 1 of 7.</div></div>"#;

        let mut source = StubSource::default().page(outcome_url, outcome);
        for page in 1..=8 {
            let url = format!(
                "{BASE}/ctr-search/search?query=&dateFrom=2022-12-01&dateTo=2022-12-31&page={page}"
            );
            let id = format!("2022-00000{page}-01");
            source = source.page(url, listing(&[card(&id, &[], false)]));
        }
        let h = Harness::new(source);

        let range = ScanRange::Dates {
            start: NaiveDate::from_ymd_opt(2022, 12, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2022, 12, 31).unwrap(),
        };
        let report = h.pipeline(1).run(range).await.unwrap();

        assert_eq!(report.pages_visited, (1..=7).collect::<Vec<u32>>());
        assert!(!h.source.fetched().iter().any(|u| u.ends_with("page=8")));
        assert_eq!(report.trials_attempted, 7);
        assert_eq!(report.trials_fully_captured, 7);
    }

    #[tokio::test]
    async fn test_unrecognised_outcome_aborts_date_run() {
        let outcome_url =
            format!("{BASE}/ctr-search/search?query=&dateFrom=2022-12-01&dateTo=2022-12-02");
        let h = Harness::new(StubSource::default().page(outcome_url, "<html>maintenance</html>"));
        let range = ScanRange::Dates {
            start: NaiveDate::from_ymd_opt(2022, 12, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2022, 12, 2).unwrap(),
        };
        assert!(matches!(h.pipeline(1).run(range).await, Err(PipelineError::Outcome(_))));
    }

    #[tokio::test]
    async fn test_protocol_exhaustion_fails_only_that_trial() {
        let ok_a = "2022-000001-01";
        let broken = "2022-000002-02";
        let ok_b = "2022-000003-03";

        let source = StubSource::default()
            .page(
                page_url(1),
                listing(&[card(ok_a, &["DE"], false), card(broken, &["FR"], false), card(ok_b, &["DE"], false)]),
            )
            .page(protocol_url(ok_a, "DE"), protocol_page("DE"))
            .failing(protocol_url(broken, "FR"), Some(503), 3)
            .page(protocol_url(ok_b, "DE"), protocol_page("DE"));
        let h = Harness::new(source);

        let report = h.pipeline(2).run(ScanRange::Pages { start: 1, end: 1 }).await.unwrap();

        assert_eq!(report.trials_attempted, 3);
        assert_eq!(report.trials_fully_captured, 2);
        assert_eq!(report.trials_failed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].trial_id, broken);
        assert_eq!(report.failures[0].stage, Stage::ProtocolFetch);
        assert!(report.failures[0].reason.contains("3 attempt(s)"));

        let rows = h.records.rows.lock().unwrap();
        assert!(rows.contains_key(ok_a) && rows.contains_key(ok_b));
        assert!(!rows.contains_key(broken));
        assert_eq!(rows[ok_a].medical_condition.as_deref(), Some("Asthma"));
    }

    #[tokio::test]
    async fn test_results_fetch_failure_is_partial_capture() {
        let id = "2022-000001-01";
        let source = StubSource::default()
            .page(page_url(1), listing(&[card(id, &["DE"], true)]))
            .page(protocol_url(id, "DE"), protocol_page("DE"))
            .failing(format!("{BASE}/ctr-search/trial/{id}/results"), Some(500), 4);
        let h = Harness::new(source);

        let report = h.pipeline(1).run(ScanRange::Pages { start: 1, end: 1 }).await.unwrap();

        assert_eq!(report.trials_partially_captured, 1);
        assert_eq!(report.failures[0].stage, Stage::ResultsFetch);
        assert_eq!(report.failures[0].capture, CaptureStatus::Partial);
        assert_eq!(report.failures[0].listing_url, page_url(1));

        let rows = h.records.rows.lock().unwrap();
        assert_eq!(rows[id].capture_status, "partial");
        assert_eq!(rows[id].results_status, None);
        assert_eq!(h.blobs.objects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trial_without_links_is_fully_captured() {
        let id = "2019-000001-01";
        let h = Harness::new(StubSource::default().page(page_url(1), listing(&[card(id, &[], false)])));

        let report = h.pipeline(1).run(ScanRange::Pages { start: 1, end: 3 }).await.unwrap();

        assert_eq!(report.trials_fully_captured, 1);
        // Pages 2 and 3 are unknown to the stub (404): recorded and skipped.
        assert_eq!(report.failed_pages.len(), 2);
        let rows = h.records.rows.lock().unwrap();
        assert_eq!(rows[id].results_status.as_deref(), Some("NOT_AVAILABLE"));
        assert_eq!(rows[id].title.as_deref(), Some(format!("Trial {id}").as_str()));
    }

    #[tokio::test]
    async fn test_first_listing_connection_loss_aborts() {
        let h = Harness::new(StubSource::default().failing(page_url(1), None, 4));
        let result = h.pipeline(1).run(ScanRange::Pages { start: 1, end: 2 }).await;
        assert!(matches!(result, Err(PipelineError::Infrastructure(_))));
    }

    #[tokio::test]
    async fn test_unreachable_stores_abort_on_first_write() {
        let id = "2019-000001-01";
        let mut h = Harness::new(StubSource::default().page(page_url(1), listing(&[card(id, &[], false)])));
        h.blobs = Arc::new(MemoryBlobStore { fail: true, ..Default::default() });
        h.records = Arc::new(MemoryRecordStore { fail: true, ..Default::default() });

        let result = h.pipeline(1).run(ScanRange::Pages { start: 1, end: 1 }).await;
        assert!(matches!(result, Err(PipelineError::Infrastructure(_))));
    }

    #[tokio::test]
    async fn test_stop_before_start_attempts_nothing() {
        let h = Harness::new(
            StubSource::default().page(page_url(1), listing(&[card("2019-000001-01", &[], false)])),
        );
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = h
            .pipeline(1)
            .with_stop(rx)
            .run(ScanRange::Pages { start: 1, end: 4 })
            .await
            .unwrap();

        assert!(report.stopped_early);
        assert_eq!(report.trials_attempted, 0);
        assert!(h.source.fetched().is_empty());
    }

    #[tokio::test]
    async fn test_retry_processes_only_listed_trials() {
        let a = "2022-000001-01";
        let b = "2022-000002-02";
        let source = StubSource::default()
            .page(page_url(3), listing(&[card(a, &[], false), card(b, &[], false)]))
            .page(page_url(4), listing(&[card("2022-000009-09", &[], false)]));
        let h = Harness::new(source);

        let failures = vec![
            TrialFailure {
                trial_id: b.to_string(),
                listing_url: page_url(3),
                stage: Stage::ProtocolFetch,
                capture: CaptureStatus::Failed,
                reason: "HTTP 503".into(),
            },
            TrialFailure {
                trial_id: String::new(),
                listing_url: page_url(4),
                stage: Stage::ListingFetch,
                capture: CaptureStatus::Failed,
                reason: "HTTP 500".into(),
            },
        ];
        let report = h.pipeline(1).retry_failures(failures).await.unwrap();

        assert_eq!(report.trials_attempted, 2);
        let rows = h.records.rows.lock().unwrap();
        assert!(rows.contains_key(b));
        assert!(rows.contains_key("2022-000009-09"));
        assert!(!rows.contains_key(a));
        assert_eq!(rows[b].listing_page, 3);
    }

    #[tokio::test]
    async fn test_retry_reports_trial_missing_from_its_page() {
        let present = "2022-000001-01";
        let moved = "2022-000002-02";
        let h = Harness::new(
            StubSource::default().page(page_url(3), listing(&[card(present, &[], false)])),
        );

        let failures = vec![TrialFailure {
            trial_id: moved.to_string(),
            listing_url: page_url(3),
            stage: Stage::ProtocolFetch,
            capture: CaptureStatus::Failed,
            reason: "HTTP 503".into(),
        }];
        let report = h.pipeline(1).retry_failures(failures).await.unwrap();

        assert_eq!(report.trials_attempted, 1);
        assert_eq!(report.trials_failed, 1);
        assert_eq!(report.failures[0].trial_id, moved);
        assert_eq!(report.failures[0].reason, "not found on listing page");
        assert_eq!(report.failures[0].listing_url, page_url(3));
        // Still listed for the next retry.
        assert_eq!(report.retry_rows().len(), 1);
        assert!(h.records.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_page_of_only_malformed_cards_does_not_end_scan() {
        let id = "2022-000002-02";
        let orphan = r#"<table class="result">
                          <tr><td><span class="label">Sponsor Name:</span> Orphan</td></tr>
                        </table>"#;
        let source = StubSource::default()
            .page(page_url(1), listing(&[orphan.to_string()]))
            .page(page_url(2), listing(&[card(id, &[], false)]));
        let h = Harness::new(source);

        let report = h.pipeline(1).run(ScanRange::Pages { start: 1, end: 2 }).await.unwrap();

        assert_eq!(report.pages_visited, vec![1, 2]);
        assert_eq!(report.malformed_cards, 1);
        assert_eq!(report.trials_fully_captured, 1);
        assert!(h.records.rows.lock().unwrap().contains_key(id));
    }

    #[tokio::test]
    async fn test_stop_mid_run_finishes_trial_in_flight() {
        let ids = ["2022-000001-01", "2022-000002-02", "2022-000003-03"];
        let (tx, rx) = watch::channel(false);
        let mut source = StubSource::default()
            .page(
                page_url(1),
                listing(&ids.map(|id| card(id, &["DE"], false))),
            )
            .page(page_url(2), listing(&[card("2022-000009-09", &[], false)]))
            .stop_when_fetched(protocol_url(ids[0], "DE"), tx);
        for id in ids {
            source = source.page(protocol_url(id, "DE"), protocol_page("DE"));
        }
        let h = Harness::new(source);

        let report = h
            .pipeline(1)
            .with_stop(rx)
            .run(ScanRange::Pages { start: 1, end: 2 })
            .await
            .unwrap();

        assert!(report.stopped_early);
        assert_eq!(report.trials_attempted, 1);
        assert_eq!(report.trials_fully_captured, 1);

        let rows = h.records.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows.contains_key(ids[0]));
        let objects = h.blobs.objects.lock().unwrap();
        assert_eq!(objects.len(), 1);
        assert!(objects.contains_key(&format!("{}/capture.json", ids[0])));

        let fetched = h.source.fetched();
        assert!(!fetched.contains(&protocol_url(ids[1], "DE")));
        assert!(!fetched.contains(&page_url(2)));
    }

    #[tokio::test]
    async fn test_failed_member_state_keeps_listed_status() {
        let id = "2022-000001-01";
        let source = StubSource::default()
            .page(page_url(1), listing(&[card(id, &["DE", "FR"], false)]))
            .page(protocol_url(id, "DE"), protocol_page("DE"))
            .failing(protocol_url(id, "FR"), Some(503), 3);
        let h = Harness::new(source);

        let report = h.pipeline(1).run(ScanRange::Pages { start: 1, end: 1 }).await.unwrap();

        assert_eq!(report.trials_partially_captured, 1);
        let rows = h.records.rows.lock().unwrap();
        assert_eq!(rows[id].capture_status, "partial");
        let statuses: BTreeMap<String, Option<String>> =
            serde_json::from_str(&rows[id].member_state_statuses).unwrap();
        assert_eq!(statuses.get("FR"), Some(&Some("Ongoing".to_string())));
        assert!(statuses.contains_key("DE"));
    }
}
