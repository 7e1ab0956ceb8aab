//! HTML parsers for the three register page types.
//!
//! Detail and results pages are rendered as stacks of tables: a heading row
//! ("A. Protocol Information") followed by labelled rows
//! (`<td>A.1</td><td>Label</td><td>Value</td>`). `extract_sections` turns that
//! layout into ordered label/value pairs that the page-specific parsers query.

pub mod card;
pub mod protocol;
pub mod result;

use crate::error::ParseError;
use crate::scraper::cleaner::{clean_label, label_matches, normalise_text};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;

pub use card::parse_listing;
pub use protocol::parse_protocol;
pub use result::parse_result;

pub(crate) fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn element_text(el: ElementRef<'_>) -> String {
    normalise_text(&el.text().collect::<Vec<_>>().join(" "))
}

// ── Labelled sections ─────────────────────────────────────────────────────────

pub(crate) const SUMMARY_SECTION: &str = "Summary";

static SECTION_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]\.\s+\S").expect("static regex"));

#[derive(Debug, Clone, Default)]
pub(crate) struct Section {
    pub title: String,
    pub fields: Vec<(String, String)>,
}

impl Section {
    pub fn find(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(l, _)| label_matches(l, label))
            .map(|(_, v)| v.as_str())
    }
}

/// Walk every table row in document order and group label/value rows under
/// the most recent heading. Rows before any heading land in `Summary`.
pub(crate) fn extract_sections(doc: &Html) -> Result<Vec<Section>, ParseError> {
    let row_sel = selector("tr")?;
    let cell_sel = selector("td, th")?;

    let mut sections = vec![Section {
        title: SUMMARY_SECTION.to_string(),
        fields: Vec::new(),
    }];

    for tr in doc.select(&row_sel) {
        // Nested tables are visited through their own rows.
        let cells: Vec<String> = tr
            .select(&cell_sel)
            .filter(|cell| {
                cell.parent()
                    .and_then(ElementRef::wrap)
                    .is_some_and(|p| p.id() == tr.id())
            })
            .map(element_text)
            .collect();

        match cells.as_slice() {
            [] => continue,
            [single] => {
                if is_heading(&tr, single) {
                    sections.push(Section {
                        title: single.clone(),
                        fields: Vec::new(),
                    });
                }
            }
            [.., label, value] => {
                let label = clean_label(label);
                if label.is_empty() {
                    continue;
                }
                if let Some(current) = sections.last_mut() {
                    current.fields.push((label, value.clone()));
                }
            }
        }
    }

    Ok(sections)
}

fn is_heading(tr: &ElementRef<'_>, text: &str) -> bool {
    if SECTION_HEADING.is_match(text) {
        return true;
    }
    tr.descendants()
        .filter_map(ElementRef::wrap)
        .any(|el| el.value().classes().any(|c| c == "cellBlue" || c == "sectionHeading"))
}

/// First value for `label` across all sections, in document order.
pub(crate) fn find_field<'a>(sections: &'a [Section], label: &str) -> Option<&'a str> {
    sections.iter().find_map(|s| s.find(label))
}

/// Every (label, value) pair whose label satisfies `pred`, in document order.
pub(crate) fn fields_where<'a>(
    sections: &'a [Section],
    pred: impl Fn(&str) -> bool,
) -> impl Iterator<Item = (&'a str, &'a str)> {
    sections
        .iter()
        .flat_map(|s| s.fields.iter())
        .filter(move |(l, _)| pred(l))
        .map(|(l, v)| (l.as_str(), v.as_str()))
}

// ── Search outcome ────────────────────────────────────────────────────────────

/// Counts reported at the top of a search results page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOutcome {
    pub results: u64,
    pub pages: u32,
}

static OUTCOME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+) result\(s\) found.*?page \d+ of (\d+)").expect("static regex")
});

static NO_RESULTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(no results found|0 result\(s\) found)").expect("static regex")
});

/// Parse "12,345 result(s) found for: ... Displaying page 1 of 618."
pub fn parse_search_outcome(html: &str) -> Result<SearchOutcome, ParseError> {
    let doc = Html::parse_document(html);
    let outcome_sel = selector("#tabs-1 .outcome, div.outcome")?;

    let text = doc
        .select(&outcome_sel)
        .next()
        .map(element_text)
        .unwrap_or_default()
        .replace(',', "");

    if let Some(caps) = OUTCOME.captures(&text) {
        let results = caps[1].parse().unwrap_or(0);
        let pages = caps[2].parse().unwrap_or(0);
        return Ok(SearchOutcome { results, pages });
    }

    if NO_RESULTS.is_match(&text) || NO_RESULTS.is_match(html) {
        return Ok(SearchOutcome { results: 0, pages: 0 });
    }

    Err(ParseError::UnrecognisedOutcome(text))
}
