// src/processing/track_records.rs

//! Track-record announcements.
//!
//! Timing systems announce records as free text, e.g.
//! `New Track Record (1:06.111) for FA by Jane Doe in Van Diemen`.

use regex::Regex;

use crate::error::{AppError, Result};
use crate::models::RecordValidation;
use crate::processing::normalize::parse_seconds;

const RECORD_PATTERN: &str =
    r"(?i)New (?:Track|Class) Record\s*\(([0-9:.]+)\)\s*(?:for\s+(\S+)\s+)?by\s+(.+?)\.?$";
const MARQUE_PATTERN: &str = r"(?i)^(.+?)\s+in\s+(.+)$";
const COMPETITOR_PREFIX: &str = r"^\s*\[\s*\d+\s*\]\s*";

/// Phrases that mark an announcement as provisional or negated.
const NOT_A_RECORD: &[&str] = &["to be confirmed", "not a track record", "not a class record"];

/// Fields parsed from a record announcement.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRecord {
    pub class: Option<String>,
    pub lap_time: String,
    pub lap_seconds: Option<f64>,
    pub driver: String,
    pub marque: Option<String>,
}

pub struct TrackRecordParser {
    policy: RecordValidation,
    record: Regex,
    marque: Regex,
    prefix: Regex,
}

impl TrackRecordParser {
    pub fn new(policy: RecordValidation) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| AppError::config(format!("bad record pattern: {e}")))
        };
        Ok(Self {
            policy,
            record: compile(RECORD_PATTERN)?,
            marque: compile(MARQUE_PATTERN)?,
            prefix: compile(COMPETITOR_PREFIX)?,
        })
    }

    /// Parse `text`, or `None` if it is not an accepted record announcement.
    pub fn parse(&self, text: &str) -> Option<TrackRecord> {
        let text = text.trim();
        let lower = text.to_lowercase();
        if NOT_A_RECORD.iter().any(|phrase| lower.contains(phrase)) {
            return None;
        }

        let caps = self.record.captures(text)?;
        let lap_time = caps.get(1)?.as_str().to_string();
        let class = caps.get(2).map(|m| m.as_str().to_string());
        let driver_block = caps.get(3)?.as_str().trim();

        let (driver, marque) = match self.marque.captures(driver_block) {
            Some(m) => (
                m.get(1).map_or("", |d| d.as_str()).trim(),
                m.get(2)
                    .map(|v| v.as_str().trim().trim_end_matches('.').to_string()),
            ),
            None => (driver_block, None),
        };
        let driver = self.prefix.replace(driver, "").trim().to_string();

        let record = TrackRecord {
            class,
            lap_seconds: parse_seconds(&lap_time),
            lap_time,
            driver,
            marque,
        };

        match self.policy {
            RecordValidation::AllowMissingClass => Some(record),
            RecordValidation::Strict => {
                let complete = record.class.is_some()
                    && record.lap_seconds.is_some()
                    && !record.driver.is_empty();
                complete.then_some(record)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(policy: RecordValidation) -> TrackRecordParser {
        TrackRecordParser::new(policy).unwrap()
    }

    #[test]
    fn parses_full_announcement() {
        let record = parser(RecordValidation::Strict)
            .parse("New Track Record (1:06.111) for FA by Jane Doe in Van Diemen.")
            .unwrap();
        assert_eq!(record.class.as_deref(), Some("FA"));
        assert_eq!(record.lap_time, "1:06.111");
        assert!((record.lap_seconds.unwrap() - 66.111).abs() < 1e-9);
        assert_eq!(record.driver, "Jane Doe");
        assert_eq!(record.marque.as_deref(), Some("Van Diemen"));
    }

    #[test]
    fn strips_competitor_number() {
        let record = parser(RecordValidation::AllowMissingClass)
            .parse("New Class Record (58.2) for SM by [25] John Smith")
            .unwrap();
        assert_eq!(record.driver, "John Smith");
        assert_eq!(record.marque, None);
    }

    #[test]
    fn missing_class_depends_on_policy() {
        let text = "New Track Record (1:10.5) by Alex Roe in Mazda";
        let lenient = parser(RecordValidation::AllowMissingClass).parse(text).unwrap();
        assert_eq!(lenient.class, None);
        assert_eq!(lenient.driver, "Alex Roe");
        assert!(parser(RecordValidation::Strict).parse(text).is_none());
    }

    #[test]
    fn provisional_and_unrelated_text_is_rejected() {
        let p = parser(RecordValidation::AllowMissingClass);
        assert!(p.parse("New Track Record (1:06.1) for FA by X - to be confirmed").is_none());
        assert!(p.parse("Red flag, session stopped").is_none());
        assert!(p.parse("").is_none());
    }
}
