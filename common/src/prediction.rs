//! Per-frame prediction records and their reduction into a single verdict.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const UNKNOWN_LABEL: &str = "Unknown";
pub const UNAVAILABLE: &str = "N/A";

/// A confidence as reported by the classification service: either a number or
/// numeric text. The scale (fraction or percentage) is not known per record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Confidence {
    Number(f64),
    Text(String),
}

impl Confidence {
    /// Numeric value, if one can be read. Text is parsed leniently (leading
    /// numeric prefix, so `"92%"` reads as 92). Non-finite values are rejected.
    pub fn value(&self) -> Option<f64> {
        let v = match self {
            Confidence::Number(n) => Some(*n),
            Confidence::Text(s) => parse_leading_float(s),
        }?;
        v.is_finite().then_some(v)
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Number(n) => write!(f, "{n}"),
            Confidence::Text(s) => f.write_str(s),
        }
    }
}

/// One frame's classification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    #[serde(default = "unavailable_confidence", deserialize_with = "de_confidence")]
    pub confidence: Confidence,
    #[serde(rename = "classLabel", default = "unknown_label", deserialize_with = "de_label")]
    pub class_label: String,
}

impl PredictionRecord {
    pub fn new(confidence: Confidence, class_label: impl Into<String>) -> Self {
        Self {
            confidence,
            class_label: class_label.into(),
        }
    }

    /// Placeholder for a frame the service returned nothing for.
    pub fn unknown() -> Self {
        Self::new(Confidence::Text(UNAVAILABLE.into()), UNKNOWN_LABEL)
    }

    pub fn is_unknown(&self) -> bool {
        self.class_label == UNKNOWN_LABEL
            && matches!(&self.confidence, Confidence::Text(s) if s == UNAVAILABLE)
    }
}

fn unavailable_confidence() -> Confidence {
    Confidence::Text(UNAVAILABLE.to_string())
}

fn unknown_label() -> String {
    UNKNOWN_LABEL.to_string()
}

/// Labels arrive as numbers or strings; both compare by their text.
fn de_label<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => UNKNOWN_LABEL.to_string(),
        other => other.to_string(),
    })
}

/// Anything that is neither a number nor a string becomes unreadable text,
/// which the aggregator later discards.
fn de_confidence<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Confidence, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) => Confidence::Number(f),
            None => Confidence::Text(n.to_string()),
        },
        serde_json::Value::String(s) => Confidence::Text(s),
        _ => Confidence::Text(UNAVAILABLE.to_string()),
    })
}

/// Aggregate decision over a batch of records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    #[serde(rename = "classLabel")]
    pub class_label: String,
    /// Formatted average, e.g. `"88.33%"`, or `"N/A"`.
    pub confidence: String,
    /// Average on the percentage scale, when any confidence was readable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_percent: Option<f64>,
}

impl Verdict {
    pub fn band(&self) -> ConfidenceBand {
        ConfidenceBand::of(&self.confidence)
    }
}

/// Display emphasis for an average confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
    Unknown,
}

impl ConfidenceBand {
    /// Classify a formatted average such as `"88.33%"`.
    pub fn of(formatted: &str) -> Self {
        if formatted == UNAVAILABLE {
            return ConfidenceBand::Unknown;
        }
        match parse_leading_float(formatted) {
            Some(v) if v >= 80.0 => ConfidenceBand::High,
            Some(v) if v >= 50.0 => ConfidenceBand::Medium,
            Some(v) if v.is_finite() => ConfidenceBand::Low,
            _ => ConfidenceBand::Unknown,
        }
    }
}

/// Reduce per-frame records into one verdict: majority label and mean
/// confidence.
pub fn aggregate(records: &[PredictionRecord]) -> Verdict {
    if records.is_empty() {
        return Verdict {
            class_label: UNKNOWN_LABEL.to_string(),
            confidence: UNAVAILABLE.to_string(),
            average_percent: None,
        };
    }

    let average_percent = average_confidence(records);
    Verdict {
        class_label: majority_label(records),
        confidence: average_percent
            .map(|avg| format!("{avg:.2}%"))
            .unwrap_or_else(|| UNAVAILABLE.to_string()),
        average_percent,
    }
}

/// Mean of the readable confidences, scaled to a percentage.
///
/// The scale is decided once for the whole batch: a mean strictly below 1.0
/// is taken as a 0..1 fraction, anything else as already a percentage. A batch
/// that mixes both scales is misread; this is inherited behaviour.
fn average_confidence(records: &[PredictionRecord]) -> Option<f64> {
    let values: Vec<f64> = records.iter().filter_map(|r| r.confidence.value()).collect();
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    Some(if mean < 1.0 { mean * 100.0 } else { mean })
}

/// Most frequent label. On a tie the label seen first in input order wins.
fn majority_label(records: &[PredictionRecord]) -> String {
    // (label, count) in first-seen order
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for record in records {
        match counts.iter_mut().find(|(label, _)| *label == record.class_label) {
            Some((_, count)) => *count += 1,
            None => counts.push((record.class_label.as_str(), 1)),
        }
    }

    let mut winner = UNKNOWN_LABEL;
    let mut best = 0;
    for (label, count) in counts {
        if count > best {
            best = count;
            winner = label;
        }
    }
    winner.to_string()
}

/// Human-readable name for a class label. Numeric labels go through the
/// configured table and fall back to `Class <n>`; other labels pass through.
pub fn display_label(label: &str, names: &BTreeMap<String, String>) -> String {
    let trimmed = label.trim();
    if trimmed.is_empty() || trimmed.parse::<f64>().is_err() {
        return label.to_string();
    }
    names
        .get(label)
        .cloned()
        .unwrap_or_else(|| format!("Class {label}"))
}

/// Parse the longest numeric prefix of `s` after leading whitespace, the way
/// a lenient float parser would (`"92%"` -> 92, `" 0.5abc"` -> 0.5).
pub fn parse_leading_float(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;

    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let mut last_valid = None;
    while end < bytes.len() {
        let b = bytes[end];
        match b {
            b'0'..=b'9' => {
                seen_digit = true;
                end += 1;
                last_valid = Some(end);
            }
            b'.' if !seen_dot && !seen_exp => {
                seen_dot = true;
                end += 1;
            }
            b'e' | b'E' if seen_digit && !seen_exp => {
                seen_exp = true;
                end += 1;
                if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
                    end += 1;
                }
            }
            _ => break,
        }
    }

    if !seen_digit {
        let rest = s.trim_start_matches(['+', '-']);
        if rest.starts_with("Infinity") {
            return Some(if s.starts_with('-') {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            });
        }
        return None;
    }
    let end = last_valid?;
    s[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(confidence: Confidence, label: &str) -> PredictionRecord {
        PredictionRecord::new(confidence, label)
    }

    fn num(v: f64) -> Confidence {
        Confidence::Number(v)
    }

    fn text(s: &str) -> Confidence {
        Confidence::Text(s.to_string())
    }

    #[test]
    fn empty_input_is_unknown() {
        let verdict = aggregate(&[]);
        assert_eq!(verdict.class_label, "Unknown");
        assert_eq!(verdict.confidence, "N/A");
        assert_eq!(verdict.band(), ConfidenceBand::Unknown);
    }

    #[test]
    fn majority_and_fraction_mean() {
        let verdict = aggregate(&[
            rec(num(0.9), "A"),
            rec(num(0.8), "B"),
            rec(num(0.95), "A"),
        ]);
        assert_eq!(verdict.class_label, "A");
        assert_eq!(verdict.confidence, "88.33%");
        assert_eq!(verdict.band(), ConfidenceBand::High);
    }

    #[test]
    fn percentage_text_is_not_rescaled() {
        let verdict = aggregate(&[rec(text("92"), "X")]);
        assert_eq!(verdict.confidence, "92.00%");
    }

    #[test]
    fn exactly_one_is_treated_as_percentage() {
        let verdict = aggregate(&[rec(num(1.0), "X")]);
        assert_eq!(verdict.confidence, "1.00%");
    }

    #[test]
    fn malformed_confidence_is_skipped() {
        let verdict = aggregate(&[
            rec(text("garbage"), "A"),
            rec(num(0.5), "A"),
            rec(text("0.7"), "B"),
        ]);
        assert_eq!(verdict.confidence, "60.00%");
        assert_eq!(verdict.class_label, "A");
    }

    #[test]
    fn no_readable_confidence_gives_na() {
        let verdict = aggregate(&[rec(text("N/A"), "A"), rec(text(""), "A")]);
        assert_eq!(verdict.confidence, "N/A");
        assert_eq!(verdict.class_label, "A");
        assert!(verdict.average_percent.is_none());
    }

    #[test]
    fn tie_keeps_first_seen_label() {
        let verdict = aggregate(&[
            rec(num(0.5), "B"),
            rec(num(0.5), "A"),
            rec(num(0.5), "A"),
            rec(num(0.5), "B"),
        ]);
        assert_eq!(verdict.class_label, "B");
    }

    #[test]
    fn later_label_needs_strictly_more_to_win() {
        let verdict = aggregate(&[
            rec(num(0.5), "1"),
            rec(num(0.5), "0"),
            rec(num(0.5), "0"),
        ]);
        assert_eq!(verdict.class_label, "0");
    }

    #[test]
    fn bands_follow_thresholds() {
        assert_eq!(ConfidenceBand::of("80.00%"), ConfidenceBand::High);
        assert_eq!(ConfidenceBand::of("79.99%"), ConfidenceBand::Medium);
        assert_eq!(ConfidenceBand::of("50.00%"), ConfidenceBand::Medium);
        assert_eq!(ConfidenceBand::of("49.99%"), ConfidenceBand::Low);
        assert_eq!(ConfidenceBand::of("N/A"), ConfidenceBand::Unknown);
        assert_eq!(ConfidenceBand::of("abc"), ConfidenceBand::Unknown);
    }

    #[test]
    fn records_deserialize_from_mixed_json() {
        let records: Vec<PredictionRecord> = serde_json::from_str(
            r#"[{"confidence": 0.9, "classLabel": 1},
                {"confidence": "87", "classLabel": "cat"},
                {"confidence": null, "classLabel": null}]"#,
        )
        .unwrap();
        assert_eq!(records[0].class_label, "1");
        assert_eq!(records[0].confidence.value(), Some(0.9));
        assert_eq!(records[1].confidence.value(), Some(87.0));
        assert_eq!(records[2].class_label, "Unknown");
        assert_eq!(records[2].confidence.value(), None);
    }

    #[test]
    fn unknown_record_is_recognisable() {
        assert!(PredictionRecord::unknown().is_unknown());
        assert!(!rec(num(0.1), "Unknown").is_unknown());
    }

    #[test]
    fn display_label_maps_numeric_labels() {
        let names = BTreeMap::from([("0".to_string(), "Non-recyclable".to_string())]);
        assert_eq!(display_label("0", &names), "Non-recyclable");
        assert_eq!(display_label("7", &names), "Class 7");
        assert_eq!(display_label("plastic", &names), "plastic");
    }

    #[test]
    fn leading_float_parsing() {
        assert_eq!(parse_leading_float("92%"), Some(92.0));
        assert_eq!(parse_leading_float("  -0.5x"), Some(-0.5));
        assert_eq!(parse_leading_float("1e2"), Some(100.0));
        assert_eq!(parse_leading_float("3."), Some(3.0));
        assert_eq!(parse_leading_float(".5"), Some(0.5));
        assert_eq!(parse_leading_float("N/A"), None);
        assert_eq!(parse_leading_float(""), None);
        assert!(Confidence::Text("Infinity".into()).value().is_none());
    }
}
