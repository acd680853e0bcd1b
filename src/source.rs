//! Log sources and the pacing driver.
//!
//! Raw lines are read off the blocking file (or stdin) reader on a
//! dedicated thread and fed through a bounded channel to the async driver,
//! which parses, classifies and paces each entry before dispatching it into
//! the processor chain. Pacing keeps the replay no faster than the original
//! log: the first entry fixes the offset between the log's clock and ours
//! and every later entry waits until that offset has elapsed for it too.
//!
//! ## Metrics
//!
//! `lines_read`: Total lines taken from the input
//! `lines_ignored`: Lines classified ignore and dropped
//! `parse_errors`: Lines that failed to parse
//!

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use flate2::read::MultiGzDecoder;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::Rules;
use crate::entry::ContentType;
use crate::parser::LogParser;
use crate::processor::Compound;

/// Sleep granularity of the pacing loop.
pub(crate) const PACING_TICK: Duration = Duration::from_millis(100);
const LINE_BUFFER: usize = 256;
const PROGRESS_INTERVAL: u64 = 10_000;

/// Errors produced by the log source.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An input file could not be opened.
    #[error("can not open {}: {source}", .path.display())]
    Open {
        /// The offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Reading the input stream failed.
    #[error("failed reading input: {0}")]
    Io(#[from] std::io::Error),
    /// The parser could not be configured from the first line.
    #[error(transparent)]
    Parse(#[from] crate::parser::Error),
    /// A processor rejected an entry.
    #[error(transparent)]
    Processor(#[from] crate::processor::Error),
}

/// Counters reported once the input is exhausted.
#[derive(Debug, Default, Clone, Copy)]
pub struct Totals {
    /// Entries dispatched into the processor chain.
    pub processed: u64,
    /// Entries classified ignore and dropped.
    pub ignored: u64,
    /// Lines that failed to parse.
    pub errors: u64,
}

impl Totals {
    fn sum(self) -> u64 {
        self.processed + self.ignored + self.errors
    }
}

/// Knobs for the read loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceOptions {
    /// Stop once this many lines have been counted, across all inputs.
    pub limit: Option<u64>,
    /// Log per-line parse errors.
    pub show_errors: bool,
    /// Log every dispatched entry.
    pub verbose: bool,
}

/// Replay the given log files, or stdin when the list is empty, into the
/// processor chain.
///
/// # Errors
///
/// Returns an error on structural failures: an unopenable file, a stream
/// read error, a first line the parser can not configure from, or a
/// processor rejecting an entry. Per-line parse errors are counted, not
/// returned.
pub async fn replay_files(
    paths: &[PathBuf],
    processor: &Compound,
    rules: &Rules,
    options: SourceOptions,
) -> Result<Totals, Error> {
    let mut driver = Driver {
        processor,
        rules,
        options,
        parser: None,
        offset: None,
        totals: Totals::default(),
    };

    if paths.is_empty() {
        info!("reading from stdin");
        driver.pump(Box::new(std::io::stdin())).await?;
    } else {
        for path in paths {
            info!(path = %path.display(), "reading");
            driver.pump(open(path)?).await?;
            if driver.limit_reached() {
                break;
            }
        }
    }

    Ok(driver.totals)
}

fn open(path: &Path) -> Result<Box<dyn Read + Send>, Error> {
    let file = File::open(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    if path.extension().is_some_and(|extension| extension == "gz") {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

struct Driver<'a> {
    processor: &'a Compound,
    rules: &'a Rules,
    options: SourceOptions,
    parser: Option<LogParser>,
    offset: Option<chrono::Duration>,
    totals: Totals,
}

impl Driver<'_> {
    async fn pump(&mut self, input: Box<dyn Read + Send>) -> Result<(), Error> {
        // Pacing restarts per input; the parser configuration carries over.
        self.offset = None;

        let (line_tx, mut line_rx) = mpsc::channel::<std::io::Result<String>>(LINE_BUFFER);
        let reader = tokio::task::spawn_blocking(move || {
            let mut lines = BufReader::new(input);
            let mut line = String::new();
            loop {
                line.clear();
                match lines.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = line.trim_end_matches(['\r', '\n']).to_string();
                        if line_tx.blocking_send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = line_tx.blocking_send(Err(err));
                        break;
                    }
                }
            }
        });

        while let Some(next) = line_rx.recv().await {
            if self.limit_reached() {
                break;
            }
            let line = next?;
            self.feed(line).await?;
        }

        drop(line_rx);
        let _ = reader.await;
        Ok(())
    }

    async fn feed(&mut self, line: String) -> Result<(), Error> {
        counter!("lines_read").increment(1);

        if self.parser.is_none() {
            self.parser = Some(LogParser::configure_by_example(&line)?);
        }
        let parser = self
            .parser
            .as_ref()
            .expect("parser was configured from the first line");

        let mut entry = match parser.parse_entry(&line) {
            Ok(entry) => entry,
            Err(err) => {
                counter!("parse_errors").increment(1);
                self.totals.errors += 1;
                if self.options.show_errors {
                    warn!("{err}");
                }
                return Ok(());
            }
        };
        self.rules.apply(&mut entry);

        // Don't be faster than the log.
        let offset = *self
            .offset
            .get_or_insert_with(|| Utc::now() - entry.timestamp);
        while Utc::now() - entry.timestamp < offset {
            time::sleep(PACING_TICK).await;
        }

        if entry.content_type == ContentType::Ignore {
            counter!("lines_ignored").increment(1);
            self.totals.ignored += 1;
            return Ok(());
        }

        if self.options.verbose {
            debug!(line = %line, entry = ?entry, "dispatching entry");
        }
        self.processor.process(entry).await?;
        self.totals.processed += 1;

        let total = self.totals.sum();
        if total % PROGRESS_INTERVAL == 0 {
            info!("{total} entries");
        }
        Ok(())
    }

    fn limit_reached(&self) -> bool {
        self.options
            .limit
            .is_some_and(|limit| self.totals.sum() >= limit)
    }
}
