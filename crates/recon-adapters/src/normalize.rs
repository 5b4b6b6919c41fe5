//! Wire value → canonical scalar conversion. Nothing here returns an error:
//! input that cannot be read is `None`, and callers treat it as absent.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Status,
    Person,
    Date,
    Duration,
    Decimal,
    Labels,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonKind {
    Person,
    Team,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonRef {
    pub id: String,
    pub kind: PersonKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Status(String),
    People(Vec<PersonRef>),
    Date(NaiveDate),
    /// Decimal hours, two places.
    Hours(f64),
    Decimal(Decimal),
    Labels(Vec<String>),
    Text(String),
}

pub fn normalize(kind: FieldKind, raw: &str) -> Option<FieldValue> {
    match kind {
        FieldKind::Status => status(raw).map(FieldValue::Status),
        FieldKind::Person => people(raw).map(FieldValue::People),
        FieldKind::Date => date(raw).map(FieldValue::Date),
        FieldKind::Duration => hours(raw).map(FieldValue::Hours),
        FieldKind::Decimal => decimal(raw).map(FieldValue::Decimal),
        FieldKind::Labels => labels(raw).map(FieldValue::Labels),
        FieldKind::Text => text(raw).map(FieldValue::Text),
    }
}

fn parse_json(raw: &str) -> Option<JsonValue> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        serde_json::from_str(trimmed).ok()
    } else {
        None
    }
}

pub fn text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Board status columns arrive either as the label or as `{"label": ...}`.
pub fn status(raw: &str) -> Option<String> {
    if let Some(json) = parse_json(raw) {
        return json
            .get("label")
            .or_else(|| json.get("text"))
            .and_then(JsonValue::as_str)
            .and_then(text);
    }
    text(raw)
}

/// `{"personsAndTeams": [{"id": 1, "kind": "person"}]}`, a bare id, or comma-separated ids.
pub fn people(raw: &str) -> Option<Vec<PersonRef>> {
    if let Some(json) = parse_json(raw) {
        let entries = json.get("personsAndTeams").unwrap_or(&json).as_array()?;
        let refs = entries
            .iter()
            .filter_map(|entry| {
                let id = match entry.get("id")? {
                    JsonValue::String(s) => s.trim().to_string(),
                    JsonValue::Number(n) => n.to_string(),
                    _ => return None,
                };
                let kind = match entry.get("kind").and_then(JsonValue::as_str) {
                    Some("team") | Some("group") => PersonKind::Team,
                    _ => PersonKind::Person,
                };
                Some(PersonRef { id, kind })
            })
            .collect::<Vec<_>>();
        return (!refs.is_empty()).then_some(refs);
    }
    let refs = raw
        .split(',')
        .filter_map(text)
        .map(|id| PersonRef {
            id,
            kind: PersonKind::Person,
        })
        .collect::<Vec<_>>();
    (!refs.is_empty()).then_some(refs)
}

/// ISO date, RFC 3339 timestamp, `MM/DD/YYYY`, or `{"date": ...}`.
pub fn date(raw: &str) -> Option<NaiveDate> {
    if let Some(json) = parse_json(raw) {
        return json.get("date").and_then(JsonValue::as_str).and_then(date);
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(trimmed).ok().map(|dt| dt.date_naive()))
        .or_else(|| NaiveDate::parse_from_str(trimmed, "%m/%d/%Y").ok())
}

/// First day of the month for `YYYY-MM`, `MM/YYYY`, or any full date.
pub fn month(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(&format!("{trimmed}-01"), "%Y-%m-%d")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(&format!("01/{trimmed}"), "%d/%m/%Y").ok())
        .or_else(|| date(trimmed))
        .map(recon_core::FinancialEntry::month_of)
}

/// Seconds, `HH:MM:SS`, `HH:MM`, or `{"duration": seconds}` → hours rounded to 2 places.
pub fn hours(raw: &str) -> Option<f64> {
    let seconds = if let Some(json) = parse_json(raw) {
        json.get("duration")?.as_f64()?
    } else {
        let trimmed = raw.trim();
        if trimmed.contains(':') {
            clock_seconds(trimmed)?
        } else {
            trimmed.parse::<f64>().ok()?
        }
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some((seconds / 3600.0 * 100.0).round() / 100.0)
}

fn clock_seconds(text: &str) -> Option<f64> {
    let parts = text
        .split(':')
        .map(|p| p.trim().parse::<u32>().ok())
        .collect::<Option<Vec<_>>>()?;
    let (h, m, s) = match parts.as_slice() {
        [h, m] => (*h, *m, 0),
        [h, m, s] => (*h, *m, *s),
        _ => return None,
    };
    if m >= 60 || s >= 60 {
        return None;
    }
    Some(f64::from(h) * 3600.0 + f64::from(m) * 60.0 + f64::from(s))
}

const CURRENCY_CODES: &[&str] = &["USD", "EUR", "GBP", "CAD", "AUD"];

/// Money-ish text: `$1,234.50`, `USD 99`, `(450.00)` for negatives.
pub fn decimal(raw: &str) -> Option<Decimal> {
    let mut text = raw.trim().to_string();
    if text.is_empty() {
        return None;
    }
    for code in CURRENCY_CODES {
        text = text.replace(code, "");
    }
    let mut negative = false;
    let mut trimmed = text.trim();
    if trimmed.starts_with('(') && trimmed.ends_with(')') {
        negative = true;
        trimmed = &trimmed[1..trimmed.len() - 1];
    }
    let cleaned = trimmed
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '€' | '£' | ' ' | '\u{a0}'))
        .collect::<String>();
    let value = Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .ok()?;
    Some(if negative { -value } else { value })
}

/// `{"labels": [...]}`, a JSON array, or comma-separated text.
pub fn labels(raw: &str) -> Option<Vec<String>> {
    let values = if let Some(json) = parse_json(raw) {
        let array = json.get("labels").unwrap_or(&json).as_array()?;
        array
            .iter()
            .filter_map(|v| v.as_str().and_then(text))
            .collect::<Vec<_>>()
    } else {
        raw.split(',').filter_map(text).collect::<Vec<_>>()
    };
    (!values.is_empty()).then_some(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn durations_become_decimal_hours() {
        assert_eq!(normalize(FieldKind::Duration, "01:30:00"), Some(FieldValue::Hours(1.5)));
        assert_eq!(normalize(FieldKind::Duration, "{\"duration\": 5400}"), Some(FieldValue::Hours(1.5)));
        assert_eq!(hours("5400"), Some(1.5));
        assert_eq!(hours("0:20"), Some(0.33));
        assert_eq!(hours("1000"), Some(0.28));
    }

    #[test]
    fn malformed_durations_are_absent() {
        assert_eq!(normalize(FieldKind::Duration, "soon"), None);
        assert_eq!(hours("1:75:00"), None);
        assert_eq!(hours("{\"running\": true}"), None);
        assert_eq!(hours(""), None);
        assert_eq!(hours("-60"), None);
    }

    #[test]
    fn dates_in_several_shapes() {
        let jan15 = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(date("2024-01-15"), Some(jan15));
        assert_eq!(date("2024-01-15T10:00:00Z"), Some(jan15));
        assert_eq!(date("01/15/2024"), Some(jan15));
        assert_eq!(date("{\"date\":\"2024-01-15\",\"time\":null}"), Some(jan15));
        assert_eq!(date("next week"), None);
    }

    #[test]
    fn months_truncate_to_first_day() {
        let jan = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(month("2024-01"), Some(jan));
        assert_eq!(month("01/2024"), Some(jan));
        assert_eq!(month("2024-01-31"), Some(jan));
        assert_eq!(month("Q1"), None);
    }

    #[test]
    fn decimals_tolerate_money_formatting() {
        assert_eq!(decimal("$1,234.50"), Some(dec!(1234.50)));
        assert_eq!(decimal("USD 99"), Some(dec!(99)));
        assert_eq!(decimal("(450.00)"), Some(dec!(-450.00)));
        assert_eq!(decimal("-12"), Some(dec!(-12)));
        assert_eq!(decimal("n/a"), None);
    }

    #[test]
    fn people_distinguish_teams() {
        let refs = people(r#"{"personsAndTeams":[{"id":11,"kind":"person"},{"id":"7","kind":"team"}]}"#).unwrap();
        assert_eq!(refs[0], PersonRef { id: "11".into(), kind: PersonKind::Person });
        assert_eq!(refs[1].kind, PersonKind::Team);
        assert_eq!(people(r#"{"personsAndTeams":[]}"#), None);
    }

    #[test]
    fn labels_from_json_or_text() {
        assert_eq!(labels(r#"{"labels":["SEO","Paid"]}"#), Some(vec!["SEO".into(), "Paid".into()]));
        assert_eq!(labels(r#"["a"," b "]"#), Some(vec!["a".into(), "b".into()]));
        assert_eq!(labels("x, y,,"), Some(vec!["x".into(), "y".into()]));
        assert_eq!(labels("  "), None);
    }

    #[test]
    fn status_reads_label_object() {
        assert_eq!(status(r#"{"index":1,"label":"Done"}"#), Some("Done".into()));
        assert_eq!(normalize(FieldKind::Status, " Working on it "), Some(FieldValue::Status("Working on it".into())));
        assert_eq!(normalize(FieldKind::Text, ""), None);
    }
}
