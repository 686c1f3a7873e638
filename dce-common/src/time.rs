//! Timestamp utilities and the flexible transfer-date codec
//!
//! Imported payloads come from several producers (mobile exports, spreadsheet
//! conversions on the backend) and carry dates in whatever shape the producer
//! used. Decoding accepts every known shape; encoding always emits one
//! canonical RFC 3339 form.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Dates landing in this year are day-0 artifacts of the 1900 spreadsheet epoch
pub const SPREADSHEET_EPOCH_YEAR: i32 = 1900;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Why a transfer date was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DateParseError {
    #[error("invalid date {0:?}: no supported format matches")]
    Unrecognized(String),

    #[error("invalid date {0:?}: year 1900 is a spreadsheet epoch artifact")]
    SpreadsheetEpoch(String),

    #[error("invalid timestamp {0}: out of range")]
    OutOfRange(f64),
}

/// String date layouts, in decoding priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFormat {
    /// `2024-03-01T08:30:00.250Z`
    IsoFractional,
    /// `2024-03-01T08:30:00Z`
    IsoPlain,
    /// `2024-03-01`
    YearMonthDay,
    /// `01/03/2024`
    DayMonthYear,
    /// `03/01/2024`
    MonthDayYear,
    /// `01/03/2024 08:30:00`
    DayMonthYearTime,
}

impl DateFormat {
    pub const PRIORITY: [DateFormat; 6] = [
        DateFormat::IsoFractional,
        DateFormat::IsoPlain,
        DateFormat::YearMonthDay,
        DateFormat::DayMonthYear,
        DateFormat::MonthDayYear,
        DateFormat::DayMonthYearTime,
    ];

    fn parse(self, input: &str) -> Option<DateTime<Utc>> {
        match self {
            DateFormat::IsoFractional | DateFormat::IsoPlain => {
                let time_part = input.split_once('T').map(|(_, t)| t)?;
                let fractional = time_part.contains('.');
                if fractional != (self == DateFormat::IsoFractional) {
                    return None;
                }
                DateTime::parse_from_rfc3339(input)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }
            DateFormat::YearMonthDay => date_at_midnight(input, "%Y-%m-%d"),
            DateFormat::DayMonthYear => date_at_midnight(input, "%d/%m/%Y"),
            DateFormat::MonthDayYear => date_at_midnight(input, "%m/%d/%Y"),
            DateFormat::DayMonthYearTime => {
                NaiveDateTime::parse_from_str(input, "%d/%m/%Y %H:%M:%S")
                    .ok()
                    .map(|naive| naive.and_utc())
            }
        }
    }
}

fn date_at_midnight(input: &str, layout: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(input, layout)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn reject_epoch_artifact(date: DateTime<Utc>, raw: String) -> Result<DateTime<Utc>, DateParseError> {
    if date.year() == SPREADSHEET_EPOCH_YEAR {
        Err(DateParseError::SpreadsheetEpoch(raw))
    } else {
        Ok(date)
    }
}

/// Parse a date string using the first matching [`DateFormat`]
pub fn parse_date_str(input: &str) -> Result<DateTime<Utc>, DateParseError> {
    let trimmed = input.trim();
    let parsed = DateFormat::PRIORITY
        .iter()
        .find_map(|format| format.parse(trimmed))
        .ok_or_else(|| DateParseError::Unrecognized(input.to_string()))?;
    reject_epoch_artifact(parsed, input.to_string())
}

/// Interpret a number as seconds since the Unix epoch
pub fn parse_timestamp(seconds: f64) -> Result<DateTime<Utc>, DateParseError> {
    if !seconds.is_finite() {
        return Err(DateParseError::OutOfRange(seconds));
    }
    let whole = seconds.floor();
    let nanos = (((seconds - whole) * 1e9).round() as u32).min(999_999_999);
    let parsed = DateTime::from_timestamp(whole as i64, nanos)
        .ok_or(DateParseError::OutOfRange(seconds))?;
    reject_epoch_artifact(parsed, seconds.to_string())
}

/// Canonical encoding used for every date this crate writes
pub fn format_canonical(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A date as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferDate(pub DateTime<Utc>);

impl Serialize for TransferDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_canonical(&self.0))
    }
}

struct TransferDateVisitor;

impl<'de> Visitor<'de> for TransferDateVisitor {
    type Value = TransferDate;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a Unix timestamp or a date string")
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
        parse_timestamp(value as f64).map(TransferDate).map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
        parse_timestamp(value as f64).map(TransferDate).map_err(E::custom)
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
        parse_timestamp(value).map(TransferDate).map_err(E::custom)
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
        parse_date_str(value).map(TransferDate).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for TransferDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TransferDateVisitor)
    }
}

/// `#[serde(with)]` adapter for a required date field
pub mod flexible {
    use super::TransferDate;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        TransferDate(*date).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        TransferDate::deserialize(deserializer).map(|date| date.0)
    }
}

/// `#[serde(with)]` adapter for an optional date field (pair with `default`)
pub mod flexible_opt {
    use super::TransferDate;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        date: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        date.map(TransferDate).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<TransferDate>::deserialize(deserializer).map(|date| date.map(|d| d.0))
    }
}

/// `#[serde(with)]` adapter for title → item → date maps
pub mod flexible_nested {
    use super::TransferDate;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    type Nested = BTreeMap<String, BTreeMap<String, DateTime<Utc>>>;

    pub fn serialize<S: Serializer>(dates: &Nested, serializer: S) -> Result<S::Ok, S::Error> {
        let wire: BTreeMap<&String, BTreeMap<&String, TransferDate>> = dates
            .iter()
            .map(|(title, items)| {
                let items = items
                    .iter()
                    .map(|(item, date)| (item, TransferDate(*date)))
                    .collect();
                (title, items)
            })
            .collect();
        wire.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Nested, D::Error> {
        let wire = Option::<BTreeMap<String, BTreeMap<String, TransferDate>>>::deserialize(deserializer)?
            .unwrap_or_default();
        Ok(wire
            .into_iter()
            .map(|(title, items)| {
                let items = items.into_iter().map(|(item, date)| (item, date.0)).collect();
                (title, items)
            })
            .collect())
    }
}
