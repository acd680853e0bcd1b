//! Frequency histogram over replayed traffic.

use std::io;
use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::entry::{ContentType, LogEntry};

/// In-memory `(content type, verb, path)` frequency histogram.
#[derive(Debug, Default)]
pub struct Count {
    counts: Mutex<FxHashMap<String, u64>>,
}

impl Count {
    /// Create an empty histogram.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one entry. Ignored entries are dropped.
    pub fn process(&self, entry: LogEntry) {
        if entry.content_type == ContentType::Ignore {
            return;
        }
        let key = format!("{} {} {}", entry.content_type, entry.verb, entry.path);
        let mut counts = self.counts.lock().expect("count lock poisoned");
        *counts.entry(key).or_insert(0) += 1;
    }

    /// Write one `<count> <content_type> <verb> <path>` line per bucket,
    /// in unspecified order.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn print_results<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        let counts = self.counts.lock().expect("count lock poisoned");
        for (key, count) in counts.iter() {
            writeln!(writer, "{count} {key}")?;
        }
        Ok(())
    }
}
