pub mod cleaner;
pub mod http_client;
pub mod parsers;

use crate::error::{ConfigurationError, FetchError};
use async_trait::async_trait;
use chrono::NaiveDate;
use url::Url;

pub use self::http_client::HttpClient;

/// A fetched page that passed the content-signature check.
#[derive(Debug, Clone)]
pub struct PageContent {
    pub url: String,
    pub status: u16,
    pub body: String,
}

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable page source. Implementations hold no per-call mutable state and
/// may be used concurrently for different URLs.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<PageContent, FetchError>;
}

// ── Register URLs ─────────────────────────────────────────────────────────────

/// The search filter a listing scan runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingQuery {
    All,
    Dates { from: NaiveDate, to: NaiveDate },
}

/// URL builder for the EU Clinical Trials Register.
#[derive(Debug, Clone)]
pub struct Register {
    base: Url,
}

impl Register {
    pub fn new(base_url: &str) -> Result<Self, ConfigurationError> {
        let base = Url::parse(base_url.trim_end_matches('/'))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn search_url(&self) -> Url {
        let mut url = self.base.clone();
        url.set_path("/ctr-search/search");
        url
    }

    /// Listing page `page` (1-based) for `query`.
    pub fn listing_url(&self, query: &ListingQuery, page: u32) -> String {
        let mut url = self.search_url();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("query", "");
            if let ListingQuery::Dates { from, to } = query {
                pairs.append_pair("dateFrom", &from.format("%Y-%m-%d").to_string());
                pairs.append_pair("dateTo", &to.format("%Y-%m-%d").to_string());
            }
            pairs.append_pair("page", &page.to_string());
        }
        url.to_string()
    }

    /// The unpaged search used to read the result and page counts.
    pub fn outcome_url(&self, query: &ListingQuery) -> String {
        let mut url = self.search_url();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("query", "");
            if let ListingQuery::Dates { from, to } = query {
                pairs.append_pair("dateFrom", &from.format("%Y-%m-%d").to_string());
                pairs.append_pair("dateTo", &to.format("%Y-%m-%d").to_string());
            }
        }
        url.to_string()
    }
}

/// Page number of a listing URL, if it carries one.
pub fn listing_page_of(url: &str) -> Option<u32> {
    Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == "page")
        .and_then(|(_, v)| v.parse().ok())
}
