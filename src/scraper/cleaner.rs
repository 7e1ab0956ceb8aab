use crate::models::{CalendarDate, Reported};
use chrono::NaiveDate;

// ── Text ──────────────────────────────────────────────────────────────────────

/// Register text that stands in for a missing value.
const PLACEHOLDERS: &[&str] = &[
    "information not present in eudract",
    "not available",
    "n/a",
    "-",
    "—",
];

/// Whitespace collapse (including non-breaking spaces) and trim. Input is DOM
/// text, so entities were already decoded exactly once by the HTML parser.
pub fn normalise_text(s: &str) -> String {
    s.split(|c: char| c.is_whitespace() || c == '\u{a0}')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn is_placeholder(s: &str) -> bool {
    let lower = s.trim().to_lowercase();
    lower.is_empty() || PLACEHOLDERS.contains(&lower.as_str())
}

/// Normalised text, or `None` when nothing meaningful is left.
pub fn non_empty(s: &str) -> Option<String> {
    let text = normalise_text(s);
    if is_placeholder(&text) { None } else { Some(text) }
}

pub fn reported_text(s: Option<&str>) -> Reported<String> {
    s.and_then(non_empty).into()
}

/// "Sponsor Name:" → "Sponsor Name", "Start Date*:" → "Start Date"
pub fn clean_label(s: &str) -> String {
    normalise_text(s)
        .trim_end_matches([':', '*', ' '])
        .to_string()
}

/// Case-insensitive prefix match on a cleaned label.
pub fn label_matches(label: &str, wanted: &str) -> bool {
    label.to_lowercase().starts_with(&wanted.to_lowercase())
}

// ── Dates ─────────────────────────────────────────────────────────────────────

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%Y/%m/%d",
    "%d.%m.%Y",
    "%d %B %Y",
    "%d %b %Y",
    "%B %d, %Y",
    "%b %d, %Y",
];

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = normalise_text(s);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&s, fmt).ok())
}

/// Canonical date, or the verbatim text when the format is unknown.
/// Empty input yields `None`; unknown formats are never dropped.
pub fn to_calendar_date(s: &str) -> Option<CalendarDate> {
    let text = non_empty(s)?;
    Some(match parse_date(&text) {
        Some(d) => CalendarDate::Parsed(d),
        None => CalendarDate::Unparsed(text),
    })
}

// ── Coercion ──────────────────────────────────────────────────────────────────

pub fn parse_yes_no(s: &str) -> Option<bool> {
    match normalise_text(s).to_lowercase().as_str() {
        "yes" | "y" | "true" => Some(true),
        "no" | "n" | "false" => Some(false),
        _ => None,
    }
}

/// "1,234" → 1234 | "1 234" → 1234 | "approx. 50" → None
pub fn parse_count(s: &str) -> Option<u64> {
    let cleaned: String = normalise_text(s)
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '.'))
        .collect();
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    cleaned.parse().ok()
}

/// EudraCT numbers are kept as printed, minus surrounding noise.
pub fn normalise_trial_id(s: &str) -> Option<String> {
    let id = normalise_text(s);
    if id.is_empty() || id.contains(' ') {
        None
    } else {
        Some(id)
    }
}

/// "/ctr-search/trial/2022-000123-45/DE" → "DE"
pub fn country_code_from_url(url: &str) -> Option<String> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_text() {
        assert_eq!(normalise_text("  Breast\n\t cancer  "), "Breast cancer");
        assert_eq!(normalise_text("a\u{a0}\u{a0}b"), "a b");
        assert_eq!(normalise_text("R&D; fish & chips"), "R&D; fish & chips");
        // Already-decoded text that literally contains an entity stays as printed.
        assert_eq!(normalise_text("A &amp; B"), "A &amp; B");
    }

    #[test]
    fn test_placeholders_are_empty() {
        assert_eq!(non_empty("Information not present in EudraCT"), None);
        assert_eq!(non_empty("   "), None);
        assert_eq!(non_empty(" Asthma "), Some("Asthma".to_string()));
    }

    #[test]
    fn test_clean_label() {
        assert_eq!(clean_label("Sponsor Name:"), "Sponsor Name");
        assert_eq!(clean_label("Start Date*:"), "Start Date");
        assert!(label_matches("EudraCT Number", "eudract number"));
    }

    #[test]
    fn test_parse_date_formats() {
        let d = NaiveDate::from_ymd_opt(2022, 12, 1).unwrap();
        assert_eq!(parse_date("2022-12-01"), Some(d));
        assert_eq!(parse_date("01/12/2022"), Some(d));
        assert_eq!(parse_date("1 December 2022"), Some(d));
        assert_eq!(parse_date("01 Dec 2022"), Some(d));
        assert_eq!(parse_date("sometime in 2022"), None);
    }

    #[test]
    fn test_unknown_date_kept_verbatim() {
        assert_eq!(
            to_calendar_date("Q4 2022"),
            Some(CalendarDate::Unparsed("Q4 2022".to_string()))
        );
        assert_eq!(to_calendar_date(""), None);
    }

    #[test]
    fn test_coercions() {
        assert_eq!(parse_yes_no(" Yes "), Some(true));
        assert_eq!(parse_yes_no("No"), Some(false));
        assert_eq!(parse_yes_no("maybe"), None);
        assert_eq!(parse_count("1,234"), Some(1234));
        assert_eq!(parse_count("approx. 50"), None);
        assert_eq!(country_code_from_url("/ctr-search/trial/2022-000123-45/de"), Some("DE".into()));
        assert_eq!(normalise_trial_id(" 2022-000123-45 "), Some("2022-000123-45".into()));
        assert_eq!(normalise_trial_id(""), None);
    }
}
