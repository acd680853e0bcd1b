//! Auto-configuring access-log line parser.
//!
//! Access logs differ in field order but individual fields have
//! recognizable shapes. [`LogParser::configure_by_example`] probes the first
//! line of a stream with one regular expression per field of interest and
//! records the position at which each matched; every subsequent line is then
//! parsed by position. The timestamp position is found the same way, by
//! attempting a fixed list of formats against each field.

use once_cell::sync::Lazy;
use regex::Regex;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::entry::{ContentType, LogEntry, Replay, UnknownVerb};

static CLIENT_IP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}$")
        .expect("client ip pattern is valid")
});
static VERB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(HEAD|GET|POST|PUT|PATCH|UPGRADE)$").expect("verb pattern is valid")
});
static REQUEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?://[.:a-zA-Z0-9-]*)?/.*").expect("request pattern is valid")
});
static HTTP_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^HTTP/[0-9]\.[0-9]$").expect("http version pattern is valid"));
static RESPONSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[2-5][0-9][0-9]$").expect("response pattern is valid"));

/// Characters trimmed from the edges of every field before matching.
const TRIM: &[char] = &['"', '[', ']'];

/// Errors produced by [`LogParser`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No field of the example line matched the probe for an attribute.
    #[error("can not find position for {field} in line: {line}")]
    NoPosition {
        /// The attribute whose probe failed.
        field: &'static str,
        /// The example line.
        line: String,
    },
    /// No field of the example line parsed under any known timestamp format.
    #[error("can not find position for timestamp in line: {line}")]
    NoTimestamp {
        /// The example line.
        line: String,
    },
    /// A line is shorter than the configured position for a field.
    #[error("line does not have index {position} for field {field}: {line}")]
    MissingField {
        /// The attribute being read.
        field: &'static str,
        /// The configured position.
        position: usize,
        /// The offending line.
        line: String,
    },
    /// The status field did not parse as an integer.
    #[error("invalid response status: {0}")]
    InvalidStatus(#[from] std::num::ParseIntError),
    /// The verb field did not name a known HTTP method.
    #[error(transparent)]
    UnknownVerb(#[from] UnknownVerb),
    /// The timestamp field did not parse under the configured format.
    #[error("error parsing timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

/// Timestamp formats attempted during configuration, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeFormat {
    /// Common log style with a numeric zone, `02/Jan/2006:15:04:05 -0700`.
    CommonLog,
    /// ISO 8601 with a numeric zone or a literal `Z`,
    /// `2006-01-02T15:04:05-0700`.
    Iso8601,
    /// Common log style without a zone, read as UTC.
    CommonLogNaive,
}

impl TimeFormat {
    const ALL: [TimeFormat; 3] = [
        TimeFormat::CommonLog,
        TimeFormat::Iso8601,
        TimeFormat::CommonLogNaive,
    ];

    fn parse(self, value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        match self {
            TimeFormat::CommonLog => DateTime::parse_from_str(value, "%d/%b/%Y:%H:%M:%S %z")
                .map(|instant| instant.with_timezone(&Utc)),
            TimeFormat::Iso8601 => DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%#z")
                .map(|instant| instant.with_timezone(&Utc)),
            TimeFormat::CommonLogNaive => {
                NaiveDateTime::parse_from_str(value, "%d/%b/%Y:%H:%M:%S")
                    .map(|instant| instant.and_utc())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Positions {
    client_ip: usize,
    verb: usize,
    request: usize,
    http_version: usize,
    response: usize,
}

/// A by-example access-log parser.
///
/// Configured once from the first line of a stream; positions and the
/// timestamp format are fixed for every line thereafter.
#[derive(Debug, Clone)]
pub struct LogParser {
    positions: Positions,
    time_position: usize,
    time_format: TimeFormat,
}

impl LogParser {
    /// Configure a parser from one example line.
    ///
    /// # Errors
    ///
    /// Returns an error if any attribute probe fails to find a position or
    /// no field parses under a known timestamp format.
    pub fn configure_by_example(line: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = line.split(' ').map(|f| f.trim_matches(TRIM)).collect();

        let positions = Positions {
            client_ip: position_for(&fields, &CLIENT_IP)
                .ok_or_else(|| no_position("client_ip", line))?,
            verb: position_for(&fields, &VERB).ok_or_else(|| no_position("verb", line))?,
            request: position_for(&fields, &REQUEST).ok_or_else(|| no_position("request", line))?,
            http_version: position_for(&fields, &HTTP_VERSION)
                .ok_or_else(|| no_position("http_version", line))?,
            response: position_for(&fields, &RESPONSE)
                .ok_or_else(|| no_position("response", line))?,
        };

        let (time_position, time_format) =
            position_for_time(&fields).ok_or_else(|| Error::NoTimestamp {
                line: line.to_string(),
            })?;

        Ok(Self {
            positions,
            time_position,
            time_format,
        })
    }

    /// Parse one line into a [`LogEntry`].
    ///
    /// Identity fields the parser has no position for are left empty and
    /// `content_type` is a placeholder until the classification rules run.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is shorter than a configured position
    /// or a field fails to parse as its expected type.
    pub fn parse_entry(&self, line: &str) -> Result<LogEntry, Error> {
        let fields: Vec<&str> = line.split(' ').collect();

        let client_ip = field_at(&fields, self.positions.client_ip, "client_ip", line)?;
        let verb = field_at(&fields, self.positions.verb, "verb", line)?.parse()?;
        let request = field_at(&fields, self.positions.request, "request", line)?;
        let http_version = field_at(&fields, self.positions.http_version, "http_version", line)?;
        let response = field_at(&fields, self.positions.response, "response", line)?.parse()?;
        let timestamp = self
            .time_format
            .parse(field_at(&fields, self.time_position, "timestamp", line)?)?;

        Ok(LogEntry {
            client_ip: client_ip.to_string(),
            ident: String::new(),
            auth: String::new(),
            host: String::new(),
            loadbalancer: String::new(),
            verb,
            request: request.to_string(),
            path: String::new(),
            http_version: http_version.to_string(),
            response,
            bytes: String::new(),
            referrer: String::new(),
            agent: String::new(),
            content_type: ContentType::Page,
            timestamp,
            replay: Replay::default(),
        })
    }
}

fn no_position(field: &'static str, line: &str) -> Error {
    Error::NoPosition {
        field,
        line: line.to_string(),
    }
}

fn field_at<'a>(
    fields: &[&'a str],
    position: usize,
    field: &'static str,
    line: &str,
) -> Result<&'a str, Error> {
    fields
        .get(position)
        .map(|value| value.trim_matches(TRIM))
        .ok_or_else(|| Error::MissingField {
            field,
            position,
            line: line.to_string(),
        })
}

fn position_for(fields: &[&str], pattern: &Regex) -> Option<usize> {
    fields.iter().position(|field| pattern.is_match(field))
}

fn position_for_time(fields: &[&str]) -> Option<(usize, TimeFormat)> {
    for (position, field) in fields.iter().enumerate() {
        for format in TimeFormat::ALL {
            if format.parse(field).is_ok() {
                return Some((position, format));
            }
        }
    }
    None
}
