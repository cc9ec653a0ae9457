//! Shared parsing primitives: tolerant number and timestamp fields, the
//! key=value record reader used for `scontrol` output, and the report type
//! every parser returns.

use crate::tres::is_absent;
use chrono::NaiveDateTime;
use tracing::warn;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parsed records plus the number of lines that were dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseReport<T> {
    pub records: Vec<T>,
    pub skipped: usize,
}

impl<T> Default for ParseReport<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            skipped: 0,
        }
    }
}

impl<T> ParseReport<T> {
    /// Input had content but nothing in it could be read.
    pub fn is_unrecognized(&self) -> bool {
        self.records.is_empty() && self.skipped > 0
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> ParseReport<U> {
        ParseReport {
            records: self.records.into_iter().map(f).collect(),
            skipped: self.skipped,
        }
    }
}

/// One `scontrol` style record. Keys keep their original spelling and order;
/// keys nobody asked for are retained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueRecord {
    pairs: Vec<(String, String)>,
}

impl KeyValueRecord {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// Value or empty string.
    pub fn field(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn push_token(&mut self, token: &str) {
        match token.split_once('=') {
            Some((key, value)) if is_key(key) => {
                self.pairs.push((key.to_string(), value.to_string()));
            }
            // Free text such as `Reason=Not responding [root@...]` continues
            // the previous value.
            _ => {
                if let Some((_, value)) = self.pairs.last_mut() {
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(token);
                }
            }
        }
    }
}

fn is_key(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.split('/').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == ':')
        })
}

/// Reads `Key=Value` records. A non-indented line starts a record, indented
/// lines continue it, a blank line ends it. One-line-per-record output
/// (`scontrol --oneliner`) is the degenerate case.
pub fn parse_key_value_records(raw: &str) -> Vec<KeyValueRecord> {
    let mut records = Vec::new();
    let mut current = KeyValueRecord::default();
    for line in raw.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }
        let continuation = line.starts_with(' ') || line.starts_with('\t');
        if !continuation && !current.is_empty() {
            records.push(std::mem::take(&mut current));
        }
        for token in line.split_whitespace() {
            current.push_token(token);
        }
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

/// Integer field; placeholders read as 0 silently, garbage as 0 with a warning.
pub fn parse_u32(field: &str, raw: &str, context: &str) -> u32 {
    let trimmed = raw.trim();
    if is_absent(trimmed) {
        return 0;
    }
    match trimmed.parse::<u32>() {
        Ok(value) => value,
        Err(_) => {
            warn!("numeric_field_invalid: {context} {field}={trimmed:?}");
            0
        }
    }
}

pub fn parse_f64(field: &str, raw: &str, context: &str) -> f64 {
    let trimmed = raw.trim();
    if is_absent(trimmed) {
        return 0.0;
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => value,
        _ => {
            warn!("numeric_field_invalid: {context} {field}={trimmed:?}");
            0.0
        }
    }
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if is_absent(trimmed) {
        return None;
    }
    match NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("timestamp_invalid: {trimmed:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oneliner_records_keep_unknown_keys() {
        let raw = "NodeName=n01 State=IDLE CPUTot=16 FancyNewKey=x\nNodeName=n02 State=MIXED\n";
        let records = parse_key_value_records(raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("FancyNewKey"), Some("x"));
        assert_eq!(records[1].field("State"), "MIXED");
        assert_eq!(records[1].get("CPUTot"), None);
    }

    #[test]
    fn values_split_on_first_equals_only() {
        let records = parse_key_value_records("NodeName=n01 CfgTRES=cpu=8,mem=1G,gres/gpu=2");
        assert_eq!(records[0].field("CfgTRES"), "cpu=8,mem=1G,gres/gpu=2");
    }

    #[test]
    fn free_text_continues_previous_value() {
        let raw = "NodeName=n03 State=IDLE+DRAIN Reason=Kill task failed [root@2024-05-01T10:00:00] Comment=(null)";
        let records = parse_key_value_records(raw);
        assert_eq!(
            records[0].field("Reason"),
            "Kill task failed [root@2024-05-01T10:00:00]"
        );
        assert_eq!(records[0].field("Comment"), "(null)");
    }

    #[test]
    fn indented_lines_continue_a_record() {
        let raw = "JobId=77 JobName=train\n   UserId=ada(1000) GroupId=ada(1000)\n   StdOut=/home/ada/%j.out\n\nJobId=78 JobName=eval\n";
        let records = parse_key_value_records(raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field("StdOut"), "/home/ada/%j.out");
        assert_eq!(records[1].field("JobId"), "78");
    }

    #[test]
    fn numbers_default_to_zero() {
        assert_eq!(parse_u32("CPUTot", "invalid", "node n01"), 0);
        assert_eq!(parse_u32("CPUTot", "N/A", "node n01"), 0);
        assert_eq!(parse_u32("CPUTot", " 32 ", "node n01"), 32);
        assert_eq!(parse_f64("FairShare", "0.25", "user ada"), 0.25);
        assert_eq!(parse_f64("FairShare", "NaN", "user ada"), 0.0);
    }

    #[test]
    fn timestamps_and_placeholders() {
        assert!(parse_timestamp("2024-05-01T10:00:00").is_some());
        assert!(parse_timestamp("Unknown").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn report_flags_unrecognized_payloads() {
        let report: ParseReport<u32> = ParseReport {
            records: Vec::new(),
            skipped: 3,
        };
        assert!(report.is_unrecognized());
        assert!(!ParseReport::<u32>::default().is_unrecognized());
    }
}
