//! One parsed access-log record plus its replay annotations.
//!
//! A [`LogEntry`] is created by the [`crate::parser`], classified by
//! [`crate::config::Rules`] and then carried through the processor chain.
//! The [`Replay`] block is filled in by the user simulation after the entry
//! has been re-issued against the target.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The HTTP method recorded in the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    /// A HEAD request.
    Head,
    /// A GET request. Only GET traffic is replayed.
    Get,
    /// A POST request.
    Post,
    /// A PUT request.
    Put,
    /// A PATCH request.
    Patch,
    /// A protocol upgrade request.
    Upgrade,
}

/// Error produced when a log field does not name a known verb.
#[derive(thiserror::Error, Debug)]
#[error("unknown verb: {0}")]
pub struct UnknownVerb(String);

impl FromStr for Verb {
    type Err = UnknownVerb;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "HEAD" => Ok(Verb::Head),
            "GET" => Ok(Verb::Get),
            "POST" => Ok(Verb::Post),
            "PUT" => Ok(Verb::Put),
            "PATCH" => Ok(Verb::Patch),
            "UPGRADE" => Ok(Verb::Upgrade),
            other => Err(UnknownVerb(other.to_string())),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::Head => "HEAD",
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Upgrade => "UPGRADE",
        };
        write!(f, "{name}")
    }
}

/// The traffic class assigned to an entry by the classification rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Entries that must not leave any processor's inbound stage.
    Ignore,
    /// Static assets: images, stylesheets, scripts and the like.
    Asset,
    /// Asynchronous API calls.
    Ajax,
    /// Search requests.
    Search,
    /// Everything else, assumed to be a page view.
    Page,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContentType::Ignore => "ignore",
            ContentType::Asset => "asset",
            ContentType::Ajax => "ajax",
            ContentType::Search => "search",
            ContentType::Page => "page",
        };
        write!(f, "{name}")
    }
}

/// Replay annotations, written by the user simulation once the entry has
/// been re-issued against the target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replay {
    /// Correlation id attached to the replayed request, format
    /// `rep-` followed by ten random alphanumerics.
    pub correlation_id: String,
    /// Wall-clock duration of the replayed call in milliseconds.
    pub duration_ms: u64,
    /// Whether the replayed call failed or returned an unexpected status.
    pub error: bool,
    /// Numeric status on success, a diagnostic message otherwise.
    pub error_message: String,
    /// Skew between the original instant and the replay instant, in
    /// milliseconds.
    pub offset_ms: i64,
}

/// One parsed access-log record.
///
/// Identity fields the parser has no position for are left empty. After the
/// user simulation has handled the entry, `timestamp` reflects the replay
/// instant rather than the original one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Originating client address; the routing key for user simulations.
    pub client_ip: String,
    /// RFC 1413 identity, rarely populated.
    pub ident: String,
    /// Authenticated user name, when present.
    pub auth: String,
    /// Host that served the original request.
    pub host: String,
    /// Load balancer that fronted the original request.
    pub loadbalancer: String,
    /// The HTTP method.
    pub verb: Verb,
    /// Path plus query string; any `scheme://host` prefix is stripped
    /// during field derivation.
    pub request: String,
    /// `request` up to the first `?`.
    pub path: String,
    /// Protocol version token, e.g. `HTTP/1.1`.
    pub http_version: String,
    /// The original response status.
    pub response: u16,
    /// Response size as recorded in the log.
    pub bytes: String,
    /// Referrer header value.
    pub referrer: String,
    /// User agent string.
    pub agent: String,
    /// Traffic class assigned by the classification rules.
    pub content_type: ContentType,
    /// Original log instant, replaced by the replay instant once the entry
    /// has been re-issued.
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Replay outcome annotations.
    pub replay: Replay,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_round_trips_through_str() {
        for name in ["HEAD", "GET", "POST", "PUT", "PATCH", "UPGRADE"] {
            let verb: Verb = name.parse().expect("verb should parse");
            assert_eq!(name, verb.to_string());
        }
        assert!("TRACE".parse::<Verb>().is_err());
    }

    #[test]
    fn entry_serializes_with_at_timestamp() {
        let entry = crate::testing::entry("10.0.0.1", Verb::Get, "/foo", 200);
        let value = serde_json::to_value(&entry).expect("entry should serialize");
        assert!(value.get("@timestamp").is_some());
        assert_eq!(value["verb"], "GET");
        assert_eq!(value["content_type"], "page");
        assert_eq!(value["replay"]["error"], false);
    }
}
