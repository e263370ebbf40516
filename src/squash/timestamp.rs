use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;

/// Timestamp rendering used when a line has to be re-emitted with its
/// original timestamp prefix (pending multi-line groups, see the squasher).
pub const STANDARD_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.6f";

/// A recognized timestamp layout at the front of a log line.
///
/// Lines are split on `split_char`; the first `split_count` tokens form the
/// date portion, the rest the remainder. `cleaner`, when present, is applied
/// to the remainder after a successful parse.
pub struct DateFormat {
    pub name: &'static str,
    pub format: &'static str,
    pub split_char: char,
    pub split_count: usize,
    cleaner: Option<Regex>,
}

impl DateFormat {
    fn try_parse(&self, line: &str) -> Option<(NaiveDateTime, String)> {
        let tokens: Vec<&str> = line.split(self.split_char).collect();
        let split_count = self.split_count.min(tokens.len());
        let sep = self.split_char.to_string();
        let date_portion = tokens[..split_count].join(&sep);
        let timestamp = self.parse_datetime(&date_portion)?;

        let remainder = tokens[split_count..].join(&sep);
        let remainder = match &self.cleaner {
            Some(cleaner) => cleaner.replace(&remainder, "").into_owned(),
            None => remainder,
        };
        Some((timestamp, remainder))
    }

    fn parse_datetime(&self, text: &str) -> Option<NaiveDateTime> {
        if self.format.contains("%Y") {
            NaiveDateTime::parse_from_str(text, self.format).ok()
        } else {
            // strptime-style default: a format without a year field parses
            // as if the year were 1900.
            let text = format!("1900 {text}");
            let format = format!("%Y {}", self.format);
            NaiveDateTime::parse_from_str(&text, &format).ok()
        }
    }
}

/// Declaration order matters: formats are tried front to back.
pub static DATE_FORMATS: Lazy<Vec<DateFormat>> = Lazy::new(|| {
    vec![
        DateFormat {
            name: "standard",
            format: "%Y/%m/%d %H:%M:%S%.f",
            split_char: ' ',
            split_count: 2,
            cleaner: None,
        },
        DateFormat {
            name: "short",
            format: "%m/%d %H:%M:%S%.f",
            split_char: ' ',
            split_count: 2,
            cleaner: None,
        },
        DateFormat {
            name: "iso8601_1",
            format: "%Y-%m-%dT%H:%M:%S",
            split_char: '-',
            split_count: 3,
            // The source log format appends a sequence number after the
            // timezone offset; both end up at the head of the remainder.
            cleaner: Some(Regex::new(r"^\d+\s+").expect("static cleaner regex")),
        },
    ]
});

/// Split a leading timestamp off of `line`.
///
/// Returns `(Some(timestamp), remainder)` for the first matching format, or
/// `(None, line)` when no format applies. Never errors.
pub fn find_timestamp(line: &str) -> (Option<NaiveDateTime>, String) {
    let trimmed = line.trim();
    for format in DATE_FORMATS.iter() {
        if let Some((timestamp, remainder)) = format.try_parse(trimmed) {
            return (Some(timestamp), remainder);
        }
    }
    (None, line.to_string())
}
