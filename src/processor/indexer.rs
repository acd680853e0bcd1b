//! The bulk-index shipping sink.
//!
//! Entries are buffered into NDJSON batches of at most 1000 documents and
//! POSTed to `{base}/_bulk`, with a 100 ms deadline bounding how long a
//! batch may sit unflushed. Failed batches are discarded, never retried.
//!
//! ## Metrics
//!
//! `bulk_requests`: Total bulk uploads attempted
//! `bulk_failure`: Bulk uploads that failed or returned a non-success status
//! `documents_indexed`: Documents shipped in successful uploads
//!

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use http::header::CONTENT_TYPE;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::{Method, Request};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use metrics::counter;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error};

use crate::entry::{ContentType, LogEntry};
use crate::shutdown::{self, Broadcaster, Watcher};

const QUEUE_DEPTH: usize = 100;
const WORKERS: usize = 4;
/// Upper bound on documents per bulk upload.
pub(crate) const MAX_BATCH_DOCUMENTS: usize = 1_000;
/// Deadline bounding how long a non-empty batch may sit unflushed.
pub(crate) const BATCH_DEADLINE: Duration = Duration::from_millis(100);

type BulkClient = Client<HttpConnector, BoxBody<bytes::Bytes, hyper::Error>>;

/// Errors produced by [`Indexer`] handles.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// The indexer has shut down and no longer accepts entries.
    #[error("indexer is no longer accepting entries")]
    Closed,
}

/// Cheap handle submitting entries into the indexer's inbound queue.
#[derive(Debug, Clone)]
pub struct IndexerHandle {
    sender: mpsc::Sender<LogEntry>,
}

impl IndexerHandle {
    /// Enqueue one entry for indexing. Ignored entries are dropped without
    /// enqueueing; a full queue suspends the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the indexer has shut down.
    pub async fn process(&self, entry: LogEntry) -> Result<(), Error> {
        if entry.content_type == ContentType::Ignore {
            return Ok(());
        }
        self.sender.send(entry).await.map_err(|_| Error::Closed)
    }
}

/// The batching bulk-index sink.
///
/// Four workers share the inbound queue; each owns an independent batch
/// buffer, so batch composition preserves arrival order per worker while no
/// global order holds across workers.
#[derive(Debug)]
pub struct Indexer {
    sender: mpsc::Sender<LogEntry>,
    broadcaster: Broadcaster,
}

impl Indexer {
    /// Create an indexer posting to the given base URL.
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self::with_workers(base_url, WORKERS)
    }

    pub(crate) fn with_workers(base_url: &str, workers: usize) -> Self {
        let base_url = normalize_base(base_url);
        let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
        let receiver = Arc::new(Mutex::new(receiver));
        let (watcher, broadcaster) = shutdown::signal();
        let client: BulkClient = Client::builder(TokioExecutor::new()).build_http();

        for _ in 0..workers {
            let worker = Worker {
                receiver: Arc::clone(&receiver),
                shutdown: watcher.register(),
                client: client.clone(),
                base_url: base_url.clone(),
            };
            tokio::spawn(worker.spin());
        }
        drop(watcher);

        Self {
            sender,
            broadcaster,
        }
    }

    /// A cloneable submission handle.
    #[must_use]
    pub fn handle(&self) -> IndexerHandle {
        IndexerHandle {
            sender: self.sender.clone(),
        }
    }

    /// Begin a graceful drain: wait for the inbound queue to empty,
    /// broadcast shutdown and complete once every worker has exited, final
    /// flushes included.
    pub fn finish(self) -> JoinHandle<()> {
        let Self {
            sender,
            broadcaster,
        } = self;
        tokio::spawn(async move {
            super::drain(&sender).await;
            // The queue stays open until the workers are gone; the
            // broadcast, not channel closure, is what stops them.
            broadcaster.signal_and_wait().await;
            drop(sender);
        })
    }
}

struct Worker {
    receiver: Arc<Mutex<mpsc::Receiver<LogEntry>>>,
    shutdown: Watcher,
    client: BulkClient,
    base_url: String,
}

impl Worker {
    async fn spin(self) {
        let Worker {
            receiver,
            mut shutdown,
            client,
            base_url,
        } = self;

        let mut stop = false;
        while !stop {
            let deadline = time::Instant::now() + BATCH_DEADLINE;
            let mut body = String::new();
            let mut documents = 0;

            while documents < MAX_BATCH_DOCUMENTS {
                tokio::select! {
                    received = async { receiver.lock().await.recv().await } => {
                        match received {
                            Some(entry) => {
                                if entry.content_type == ContentType::Ignore {
                                    continue;
                                }
                                if append_document(&mut body, &entry) {
                                    documents += 1;
                                }
                            }
                            None => {
                                stop = true;
                                break;
                            }
                        }
                    }
                    () = time::sleep_until(deadline) => break,
                    () = shutdown.recv() => {
                        stop = true;
                        break;
                    }
                }
            }

            if documents > 0 {
                flush(&client, &base_url, body, documents).await;
            }
        }
    }
}

/// Append the control line and document body for one entry, two
/// newline-terminated lines.
fn append_document(body: &mut String, entry: &LogEntry) -> bool {
    let document = match serde_json::to_string(entry) {
        Ok(document) => document,
        Err(err) => {
            error!("failed to serialize entry: {err}");
            return false;
        }
    };
    let date = entry.timestamp.format("%Y-%m-%d");
    let _ = writeln!(
        body,
        r#"{{"index":{{"_index":"logstash-{date}","_type":"log"}}}}"#
    );
    body.push_str(&document);
    body.push('\n');
    true
}

async fn flush(client: &BulkClient, base_url: &str, body: String, documents: usize) {
    counter!("bulk_requests").increment(1);

    let request = match Request::builder()
        .method(Method::POST)
        .uri(format!("{base_url}/_bulk"))
        .header(CONTENT_TYPE, "application/json")
        .body(crate::full(body))
    {
        Ok(request) => request,
        Err(err) => {
            counter!("bulk_failure").increment(1);
            error!("failed to build bulk request: {err}");
            return;
        }
    };

    match client.request(request).await {
        Ok(response) => {
            let status = response.status();
            let _ = response.into_body().collect().await;
            if status.is_success() {
                counter!("documents_indexed").increment(documents as u64);
                debug!("bulk upload with {documents} documents");
            } else {
                counter!("bulk_failure").increment(1);
                error!("bulk upload returned {status}, discarding {documents} documents");
            }
        }
        Err(err) => {
            counter!("bulk_failure").increment(1);
            error!("bulk upload failed: {err}, discarding {documents} documents");
        }
    }
}

fn normalize_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}
