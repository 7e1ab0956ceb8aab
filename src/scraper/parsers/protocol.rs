use super::{Section, extract_sections, fields_where, find_field};
use crate::models::{CalendarDate, ProtocolPage, ProtocolRecord, Reported};
use crate::scraper::cleaner::{label_matches, non_empty, parse_yes_no, to_calendar_date};
use regex::Regex;
use scraper::Html;
use std::sync::LazyLock;
use tracing::{debug, warn};

const EUDRACT_NUMBER: &str = "EudraCT number";
const PROTOCOL_CODE: &str = "Sponsor's protocol code number";
const FULL_TITLE: &str = "Full title of the trial";
const CONDITION: &str = "Medical condition(s) being investigated";
const TRIAL_STATUS: &str = "Trial Status";
const TRIAL_TYPE: &str = "Clinical Trial Type";
const SPONSOR_STATUS: &str = "Status of the sponsor";
const FIRST_ENTERED: &str = "Date on which this record was first entered";
const ENDPOINT_LABELS: &[&str] = &["Primary end point(s)", "Secondary end point(s)"];

/// Label prefix → population group reported when the answer is "Yes".
const POPULATION_GROUPS: &[(&str, &str)] = &[
    ("Trial has subjects under 18", "Under 18"),
    ("Adults (18-64 years)", "Adults (18-64 years)"),
    ("Elderly (>=65 years)", "Elderly (>=65 years)"),
    ("Female", "Female"),
    ("Male", "Male"),
];

static PHASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(Phase (I{1,3}|IV)\)").expect("static regex"));

/// Fields read from a single member state's protocol page.
#[derive(Debug, Default)]
struct PageFields {
    eudract_number: Option<String>,
    sponsor_protocol_code: Option<String>,
    full_title: Option<String>,
    medical_condition: Option<String>,
    trial_phase: Option<String>,
    population: Option<String>,
    endpoints: Option<Vec<String>>,
    clinical_trial_type: Option<String>,
    sponsor_status: Option<String>,
    first_entered: Option<CalendarDate>,
    trial_status: Option<String>,
}

/// Merge the per-member-state protocol pages of one trial.
///
/// Shared fields come from the first page that reports them; later pages
/// never replace a populated value. Each page contributes its own entry to
/// `member_state_statuses`. No usable section at all yields a record with
/// every field not reported.
pub fn parse_protocol(trial_id: &str, pages: &[ProtocolPage]) -> ProtocolRecord {
    let mut record = ProtocolRecord::not_reported(trial_id);
    let mut any_section = false;

    for page in pages {
        let doc = Html::parse_document(&page.html);
        let sections = match extract_sections(&doc) {
            Ok(sections) => sections,
            Err(e) => {
                warn!(trial_id, country = %page.country_code, "protocol page unreadable: {}", e);
                continue;
            }
        };
        if sections.iter().all(|s| s.fields.is_empty()) {
            debug!(trial_id, country = %page.country_code, "no protocol section on page");
            continue;
        }
        any_section = true;

        let fields = read_page(&sections);

        let status = fields
            .trial_status
            .clone()
            .map(Reported::Reported)
            .unwrap_or_else(|| page.listed_status.clone());
        record
            .member_state_statuses
            .entry(page.country_code.clone())
            .or_insert(status);

        fill(&mut record.eudract_number, fields.eudract_number);
        fill(&mut record.sponsor_protocol_code, fields.sponsor_protocol_code);
        fill(&mut record.full_title, fields.full_title);
        fill(&mut record.medical_condition, fields.medical_condition);
        fill(&mut record.trial_phase, fields.trial_phase);
        fill(&mut record.population, fields.population);
        fill(&mut record.endpoints, fields.endpoints);
        fill(&mut record.clinical_trial_type, fields.clinical_trial_type);
        fill(&mut record.sponsor_status, fields.sponsor_status);
        fill(&mut record.first_entered, fields.first_entered);
    }

    if !any_section {
        return ProtocolRecord::not_reported(trial_id);
    }
    record
}

/// First-non-empty-wins.
fn fill<T>(slot: &mut Reported<T>, value: Option<T>) {
    if slot.is_reported() {
        return;
    }
    if let Some(v) = value {
        *slot = Reported::Reported(v);
    }
}

fn text(sections: &[Section], label: &str) -> Option<String> {
    find_field(sections, label).and_then(non_empty)
}

fn read_page(sections: &[Section]) -> PageFields {
    let phases: Vec<String> = fields_where(sections, |l| PHASE.is_match(l))
        .filter(|(_, v)| parse_yes_no(v) == Some(true))
        .filter_map(|(l, _)| PHASE.captures(l).map(|c| format!("Phase {}", &c[1])))
        .fold(Vec::new(), |mut acc, p| {
            if !acc.contains(&p) {
                acc.push(p);
            }
            acc
        });

    let mut population: Vec<&str> = Vec::new();
    for (label, value) in fields_where(sections, |_| true) {
        if parse_yes_no(value) != Some(true) {
            continue;
        }
        if let Some((_, group)) = POPULATION_GROUPS
            .iter()
            .find(|(prefix, _)| label_matches(label, prefix))
        {
            if !population.contains(group) {
                population.push(*group);
            }
        }
    }

    let endpoints: Vec<String> = fields_where(sections, |l| {
        ENDPOINT_LABELS.iter().any(|e| label_matches(l, e))
    })
    .filter_map(|(_, v)| non_empty(v))
    .fold(Vec::new(), |mut acc, e| {
        if !acc.contains(&e) {
            acc.push(e);
        }
        acc
    });

    PageFields {
        eudract_number: text(sections, EUDRACT_NUMBER),
        sponsor_protocol_code: text(sections, PROTOCOL_CODE),
        full_title: text(sections, FULL_TITLE),
        medical_condition: text(sections, CONDITION),
        trial_phase: (!phases.is_empty()).then(|| phases.join(", ")),
        population: (!population.is_empty()).then(|| population.join(", ")),
        endpoints: (!endpoints.is_empty()).then_some(endpoints),
        clinical_trial_type: text(sections, TRIAL_TYPE),
        sponsor_status: text(sections, SPONSOR_STATUS),
        first_entered: find_field(sections, FIRST_ENTERED).and_then(to_calendar_date),
        trial_status: text(sections, TRIAL_STATUS),
    }
}
