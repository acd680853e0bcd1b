//! Entry sinks and the compound fan-out that feeds them.
//!
//! Every sink in the pipeline is a variant of [`Processor`]. Please see the
//! variant documentation for details. A [`Compound`] dispatches each entry
//! to an ordered list of processors and aggregates their graceful drain
//! under one deadline.

use std::io;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::entry::LogEntry;

pub mod count;
pub mod indexer;
pub mod logstash;
pub mod replay;
pub mod simulation;

/// Poll interval for queue-drain busy waits.
pub(crate) const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Number of entries currently buffered in a stage's inbound queue.
pub(crate) fn queued(sender: &mpsc::Sender<LogEntry>) -> usize {
    sender.max_capacity() - sender.capacity()
}

/// Wait until a stage's inbound queue has been emptied by its workers.
pub(crate) async fn drain(sender: &mpsc::Sender<LogEntry>) {
    while queued(sender) > 0 {
        time::sleep(DRAIN_POLL).await;
    }
}

/// Errors produced by [`Processor`] and [`Compound`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A stage's inbound queue closed while the pipeline was still feeding
    /// it.
    #[error("pipeline stage is no longer accepting entries")]
    Closed,
    /// One or more members did not drain before the finish deadline.
    #[error("not all jobs terminated")]
    Unfinished,
    /// See [`crate::processor::logstash::Error`] for details.
    #[error(transparent)]
    Logstash(#[from] logstash::Error),
}

/// An entry sink.
///
/// All sinks accept entries by value; submission transfers ownership.
/// Members with terminal state can render it through
/// [`Processor::print_results`] and members with internal queues drain
/// through [`Processor::finish`].
#[derive(Debug)]
pub enum Processor {
    /// See [`crate::processor::count::Count`] for details.
    Count(count::Count),
    /// See [`crate::processor::replay::Replay`] for details.
    Replay(replay::Replay),
    /// See [`crate::processor::logstash::Logstash`] for details.
    Logstash(logstash::Logstash),
}

impl Processor {
    /// Submit one entry to this sink.
    ///
    /// Suspends while the sink's inbound queue is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink can no longer accept entries.
    pub async fn process(&self, entry: LogEntry) -> Result<(), Error> {
        match self {
            Processor::Count(inner) => {
                inner.process(entry);
                Ok(())
            }
            Processor::Replay(inner) => inner.process(entry).await,
            Processor::Logstash(inner) => Ok(inner.process(entry).await?),
        }
    }

    /// Render this sink's terminal state, if it has any.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn print_results<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Processor::Count(inner) => inner.print_results(writer),
            Processor::Replay(_) | Processor::Logstash(_) => Ok(()),
        }
    }

    /// Begin a graceful drain, returning the completion signal for sinks
    /// that have one.
    pub fn finish(self) -> Option<JoinHandle<()>> {
        match self {
            Processor::Count(_) | Processor::Logstash(_) => None,
            Processor::Replay(inner) => Some(inner.finish()),
        }
    }
}

/// Serial fan-out over an ordered list of processors.
#[derive(Debug)]
pub struct Compound {
    members: Vec<Processor>,
}

impl Compound {
    /// Create a compound over the given members; dispatch follows list
    /// order.
    #[must_use]
    pub fn new(members: Vec<Processor>) -> Self {
        Self { members }
    }

    /// Dispatch one entry to every member in list order.
    ///
    /// The entry is cloned for every member but the last, keeping each
    /// stage the sole owner of its copy. The first failure short-circuits.
    ///
    /// # Errors
    ///
    /// Returns the first member failure.
    pub async fn process(&self, entry: LogEntry) -> Result<(), Error> {
        if let Some((last, rest)) = self.members.split_last() {
            for member in rest {
                member.process(entry.clone()).await?;
            }
            last.process(entry).await?;
        }
        Ok(())
    }

    /// Render the terminal state of every member that has one, in list
    /// order.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn print_results<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        for member in &self.members {
            member.print_results(writer)?;
        }
        Ok(())
    }

    /// Initiate a drain on every member simultaneously and await each
    /// completion signal against one shared deadline.
    ///
    /// Members that complete in time are unaffected by a sibling missing
    /// the deadline; stragglers are not cancelled, merely reported.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unfinished`] if any member fails to drain before
    /// the deadline.
    pub async fn finish(self, timeout: Duration) -> Result<(), Error> {
        let deadline = time::Instant::now() + timeout;
        let handles: Vec<JoinHandle<()>> = self
            .members
            .into_iter()
            .filter_map(Processor::finish)
            .collect();

        for handle in handles {
            match time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return Err(Error::Unfinished),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hyper::StatusCode;

    use super::count::Count;
    use super::indexer::Indexer;
    use super::replay::Replay;
    use super::*;
    use crate::config::ReplayTarget;
    use crate::entry::Verb;
    use crate::testing::StubServer;

    #[tokio::test]
    async fn compound_dispatches_to_every_member() {
        let compound = Compound::new(vec![
            Processor::Count(Count::new()),
            Processor::Count(Count::new()),
        ]);

        let entry = crate::testing::entry("10.0.0.1", Verb::Get, "/foo", 200);
        compound
            .process(entry)
            .await
            .expect("dispatch should succeed");

        let mut rendered = Vec::new();
        compound
            .print_results(&mut rendered)
            .expect("rendering should succeed");
        let rendered = String::from_utf8(rendered).expect("results should be utf-8");
        assert_eq!(2, rendered.lines().count());
        assert!(rendered.lines().all(|line| line == "1 page GET /foo"));
    }

    #[tokio::test]
    async fn finish_succeeds_without_drainable_members() {
        let compound = Compound::new(vec![Processor::Count(Count::new())]);
        compound
            .finish(Duration::from_millis(100))
            .await
            .expect("nothing to drain");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finish_reports_stragglers() {
        let target =
            StubServer::spawn_with_delay(StatusCode::OK, Duration::from_secs(1)).await;
        let es = StubServer::spawn(StatusCode::OK).await;
        let indexer = Indexer::with_workers(&es.url(), 1);
        let replay = Replay::new(
            &ReplayTarget {
                base_url: target.url(),
                auth: None,
            },
            indexer.handle(),
            7,
        );

        let compound = Compound::new(vec![Processor::Replay(replay)]);
        compound
            .process(crate::testing::entry("10.0.0.1", Verb::Get, "/slow", 200))
            .await
            .expect("dispatch should succeed");
        // Give the worker time to pick the entry up before draining.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = compound
            .finish(Duration::from_millis(100))
            .await
            .expect_err("a worker mid-call should miss the deadline");
        assert_eq!("not all jobs terminated", err.to_string());

        indexer
            .finish()
            .await
            .expect("indexer finish task should complete");
    }
}
