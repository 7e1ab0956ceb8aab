use super::{Section, extract_sections, selector};
use crate::models::{ResultRecord, ResultsStatus};
use crate::scraper::cleaner::{label_matches, non_empty, parse_count, parse_date};
use scraper::Html;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Text the register shows instead of a results tab.
const NO_RESULTS_MARKERS: &[&str] = &[
    "no results available",
    "results are not available",
    "results not yet available",
];

const RESULTS_CONTAINERS: &str = "#resultContent, #results, div.results, table.results";

#[derive(Debug, Clone, Copy)]
enum Coerce {
    Text,
    Date,
    Count,
}

/// Recognised summary fields: output key, source label prefix, coercion.
const RESULT_FIELDS: &[(&str, &str, Coerce)] = &[
    ("global_end_of_trial_date", "Global end of trial date", Coerce::Date),
    ("results_version", "Results version number", Coerce::Text),
    ("version_publication_date", "This version publication date", Coerce::Date),
    ("first_version_publication_date", "First version publication date", Coerce::Date),
    ("primary_completion_date", "Primary completion date", Coerce::Date),
    ("worldwide_subjects", "Worldwide total number of subjects", Coerce::Count),
    ("eea_subjects", "EEA total number of subjects", Coerce::Count),
    ("summary_report", "Summary report(s)", Coerce::Text),
    ("recruitment_details", "Recruitment details", Coerce::Text),
];

/// Parse a trial's results page.
///
/// `None` means the register posts no results for the trial. Any other
/// page is `AVAILABLE`; fields are extracted independently and a layout
/// with nothing recognisable degrades to an empty mapping plus a warning.
/// Output depends only on the input text.
pub fn parse_result(trial_id: &str, html: &str) -> Option<ResultRecord> {
    let lower = html.to_lowercase();
    if NO_RESULTS_MARKERS.iter().any(|m| lower.contains(m)) {
        debug!(trial_id, "results page carries a no-results marker");
        return None;
    }

    let doc = Html::parse_document(html);
    let has_container = selector(RESULTS_CONTAINERS)
        .map(|sel| doc.select(&sel).next().is_some())
        .unwrap_or(false);

    let mut record = ResultRecord {
        trial_id: trial_id.to_string(),
        results_status: ResultsStatus::Available,
        summary_fields: BTreeMap::new(),
        coverage_warnings: Vec::new(),
    };

    let sections = match extract_sections(&doc) {
        Ok(sections) => sections,
        Err(e) => {
            if !has_container {
                return None;
            }
            record.coverage_warnings.push(format!("results layout unreadable: {}", e));
            return Some(record);
        }
    };

    let has_results_heading = sections
        .iter()
        .any(|s| s.title.to_lowercase().contains("results information"));
    if !has_container && !has_results_heading {
        debug!(trial_id, "no results tab on page");
        return None;
    }

    for (key, label, coerce) in RESULT_FIELDS {
        if let Some(value) = extract(&sections, label, *coerce) {
            record.summary_fields.insert((*key).to_string(), value);
        }
    }

    if record.summary_fields.is_empty() {
        warn!(trial_id, "results layout not recognised; no summary fields extracted");
        record
            .coverage_warnings
            .push("no recognised result fields".to_string());
    }

    Some(record)
}

fn extract(sections: &[Section], label: &str, coerce: Coerce) -> Option<String> {
    let raw = sections
        .iter()
        .flat_map(|s| s.fields.iter())
        .find(|(l, _)| label_matches(l, label))
        .map(|(_, v)| v.as_str())?;
    let text = non_empty(raw)?;

    Some(match coerce {
        Coerce::Text => text,
        Coerce::Date => parse_date(&text)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or(text),
        Coerce::Count => parse_count(&text).map(|n| n.to_string()).unwrap_or(text),
    })
}
