//! Immutable configuration threaded through the pipeline at construction.
//!
//! The classification [`Rules`] compile once from the command line and are
//! shared by reference; nothing in the pipeline mutates configuration after
//! start-up.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::entry::{ContentType, LogEntry};

/// Default pattern for requests to ignore.
pub const DEFAULT_IGNORE: &str = "healthcheck";
/// Default pattern for static asset requests.
pub const DEFAULT_ASSET: &str = r"\.jpg|\.jpeg|\.png|\.ico|\.css|\.js|\.svg|\.gif|\.pdf";
/// Default pattern for asynchronous API requests.
pub const DEFAULT_AJAX: &str = r"jsonp_callback|\.json";
/// Default pattern for search requests.
pub const DEFAULT_SEARCH: &str = r"\?q=|\&q=";

static SCHEME_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://[^/]*").expect("scheme host pattern is valid"));

/// Errors produced by [`Rules`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A classification pattern failed to compile.
    #[error("invalid classification pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Compiled request-classification rules.
///
/// Matching happens against the entry's `request` field, first match in
/// ignore, asset, search, ajax order; a non-200 original response is always
/// ignored.
#[derive(Debug)]
pub struct Rules {
    ignore: Regex,
    asset: Regex,
    ajax: Regex,
    search: Regex,
}

impl Rules {
    /// Compile a rule set from the given patterns.
    ///
    /// # Errors
    ///
    /// Returns an error if any pattern fails to compile.
    pub fn new(ignore: &str, asset: &str, ajax: &str, search: &str) -> Result<Self, Error> {
        Ok(Self {
            ignore: Regex::new(ignore)?,
            asset: Regex::new(asset)?,
            ajax: Regex::new(ajax)?,
            search: Regex::new(search)?,
        })
    }

    /// Derive the calculated fields of a freshly parsed entry: strip any
    /// `scheme://host` prefix from the request, compute the query-less path
    /// and assign the content type.
    pub fn apply(&self, entry: &mut LogEntry) {
        if let Some(found) = SCHEME_HOST.find(&entry.request) {
            let host_end = found.end();
            entry.request.replace_range(..host_end, "");
        }
        entry.path = match entry.request.split_once('?') {
            Some((path, _)) => path.to_string(),
            None => entry.request.clone(),
        };
        entry.content_type = self.classify(entry);
    }

    fn classify(&self, entry: &LogEntry) -> ContentType {
        if self.ignore.is_match(&entry.request) || entry.response != 200 {
            ContentType::Ignore
        } else if self.asset.is_match(&entry.request) {
            ContentType::Asset
        } else if self.search.is_match(&entry.request) {
            ContentType::Search
        } else if self.ajax.is_match(&entry.request) {
            ContentType::Ajax
        } else {
            ContentType::Page
        }
    }
}

impl Default for Rules {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORE, DEFAULT_ASSET, DEFAULT_AJAX, DEFAULT_SEARCH)
            .expect("default patterns are valid")
    }
}

/// Basic-auth credentials for the replay target.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    /// User name.
    pub username: String,
    /// Password, possibly empty.
    pub password: String,
}

/// Where and how replayed traffic is issued.
#[derive(Debug, Clone)]
pub struct ReplayTarget {
    /// Base URL every replayed request is issued against.
    pub base_url: String,
    /// Optional basic-auth credentials.
    pub auth: Option<BasicAuth>,
}
