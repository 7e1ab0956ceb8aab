use super::{element_text, selector};
use crate::error::ParseError;
use crate::models::{ListingCard, ProtocolLink, Reported, TrialSummary};
use crate::scraper::cleaner::{
    clean_label, country_code_from_url, label_matches, non_empty, normalise_text,
    normalise_trial_id, reported_text, to_calendar_date,
};
use regex::Regex;
use scraper::{ElementRef, Html};
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::{debug, warn};
use url::Url;

static PARENTHESISED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^)]+)\)").expect("static regex"));

/// Cards parsed from one listing page, in document order.
#[derive(Debug, Default)]
pub struct ParsedListing {
    pub cards: Vec<ListingCard>,
    pub malformed: usize,
}

/// Parse the `table.result` trial cards on a search results page.
///
/// Order follows the document, which is the register's own ranking. A page
/// without cards is a normal end-of-range signal and yields an empty listing.
pub fn parse_listing(html: &str, page: u32, base: &Url) -> Result<ParsedListing, ParseError> {
    let doc = Html::parse_document(html);
    let card_sel = selector("table.result")?;
    let cell_sel = selector("td")?;
    let link_sel = selector("a[href]")?;

    let mut listing = ParsedListing::default();

    for (index, table) in doc.select(&card_sel).enumerate() {
        let fields: Vec<CardField> = table
            .select(&cell_sel)
            .flat_map(|td| labelled_values(td, &link_sel, base))
            .collect();

        match build_summary(&fields, page) {
            Ok(summary) => listing.cards.push(ListingCard {
                summary,
                raw_html: table.html(),
            }),
            Err(e) => {
                warn!(page, card = index, "skipping malformed card: {}", e);
                listing.malformed += 1;
            }
        }
    }

    debug!(
        page,
        cards = listing.cards.len(),
        malformed = listing.malformed,
        "parsed listing page"
    );
    Ok(listing)
}

// ── Card internals ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CardField {
    label: String,
    text: String,
    links: Vec<(String, String)>,
    /// Text between each link and the next, e.g. "(Ongoing)".
    trailing: Vec<String>,
}

/// Split a cell of the form `<span class="label">Label:</span> value ...`
/// into labelled values. One cell may carry several labels.
fn labelled_values(td: ElementRef<'_>, link_sel: &scraper::Selector, base: &Url) -> Vec<CardField> {
    let mut fields: Vec<CardField> = Vec::new();

    for child in td.children() {
        if let Some(el) = ElementRef::wrap(child) {
            if el.value().classes().any(|c| c == "label") {
                fields.push(CardField {
                    label: clean_label(&element_text(el)),
                    ..Default::default()
                });
                continue;
            }
            let Some(current) = fields.last_mut() else { continue };
            let anchors: Vec<ElementRef<'_>> = if el.value().name() == "a" {
                vec![el]
            } else {
                el.select(link_sel).collect()
            };
            if anchors.is_empty() {
                push_text(current, &element_text(el));
            }
            for a in anchors {
                if let Some(href) = a.value().attr("href") {
                    let url = base
                        .join(href)
                        .map(|u| u.to_string())
                        .unwrap_or_else(|_| href.to_string());
                    current.links.push((element_text(a), url));
                    current.trailing.push(String::new());
                }
            }
        } else if let Some(text) = child.value().as_text() {
            if let Some(current) = fields.last_mut() {
                push_text(current, text);
            }
        }
    }

    for field in &mut fields {
        field.text = normalise_text(&field.text)
            .trim_start_matches([':', '*', ' '])
            .to_string();
    }
    fields
}

fn push_text(field: &mut CardField, text: &str) {
    match field.trailing.last_mut() {
        Some(tail) => {
            tail.push(' ');
            tail.push_str(text);
        }
        None => {
            field.text.push(' ');
            field.text.push_str(text);
        }
    }
}

fn lookup<'a>(fields: &'a [CardField], label: &str) -> Option<&'a CardField> {
    fields.iter().find(|f| label_matches(&f.label, label))
}

fn text_of<'a>(fields: &'a [CardField], label: &str) -> Option<&'a str> {
    lookup(fields, label).map(|f| f.text.as_str())
}

fn build_summary(fields: &[CardField], page: u32) -> Result<TrialSummary, ParseError> {
    let trial_id = text_of(fields, "EudraCT Number")
        .and_then(normalise_trial_id)
        .ok_or(ParseError::MissingField { field: "trial_id" })?;

    let protocol_links: Vec<ProtocolLink> = lookup(fields, "Trial protocol")
        .map(|f| {
            f.links
                .iter()
                .zip(f.trailing.iter())
                .filter_map(|((text, url), tail)| {
                    let country_code = non_empty(text)
                        .map(|t| t.to_uppercase())
                        .or_else(|| country_code_from_url(url))?;
                    let listed_status = PARENTHESISED
                        .captures(tail)
                        .and_then(|c| non_empty(&c[1]))
                        .into();
                    Some(ProtocolLink {
                        country_code,
                        listed_status,
                        url: url.clone(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let countries: BTreeSet<String> = protocol_links
        .iter()
        .map(|l| l.country_code.clone())
        .collect();

    let results_url = lookup(fields, "Trial results")
        .and_then(|f| f.links.first())
        .map(|(_, url)| url.clone());

    Ok(TrialSummary {
        trial_id,
        title: reported_text(text_of(fields, "Full Title").or(text_of(fields, "Title"))),
        sponsor: reported_text(text_of(fields, "Sponsor Name")),
        countries,
        listing_page_number: page,
        sponsor_protocol_number: reported_text(text_of(fields, "Sponsor Protocol Number")),
        medical_condition: reported_text(text_of(fields, "Medical condition")),
        disease: reported_text(text_of(fields, "Disease")),
        population_age: reported_text(text_of(fields, "Population Age")),
        gender: reported_text(text_of(fields, "Gender")),
        start_date: text_of(fields, "Start Date")
            .and_then(to_calendar_date)
            .map_or(Reported::NotReported, Reported::Reported),
        protocol_links,
        results_url,
    })
}
