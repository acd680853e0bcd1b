//! Per-client replay sessions.
//!
//! Each originating client address from the log is modelled as one
//! [`Simulation`]: a small bounded queue drained by six workers that share a
//! single HTTP client and re-issue the client's GET traffic against the
//! replay target. Redirects are never followed, so the original 3xx status
//! arrives as the plain response status and can be compared against the log.
//!
//! ## Metrics
//!
//! `requests_sent`: Total replay requests issued
//! `request_ok`: Replays whose status matched the original
//! `request_failure`: Replays with a transport failure or status mismatch
//! `replay_records_dropped`: Annotated entries dropped because the indexer
//! had already shut down
//!

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::Utc;
use http::HeaderValue;
use http::header::AUTHORIZATION;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use metrics::counter;
use rand::{SeedableRng, rngs::StdRng, Rng};
use tokio::sync::{Mutex, mpsc};
use tokio::time;
use tracing::warn;

use crate::config::ReplayTarget;
use crate::entry::{ContentType, LogEntry, Verb};
use crate::processor::indexer::IndexerHandle;
use crate::shutdown::{self, Broadcaster, Watcher};

const QUEUE_DEPTH: usize = 10;
const WORKERS: usize = 6;
const CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// A simulation with no traffic for this long and an empty queue is
/// eligible for eviction.
pub(crate) const IDLE_AFTER: Duration = Duration::from_secs(30);

const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CORRELATION_LENGTH: usize = 10;

type ReplayClient = Client<HttpConnector, BoxBody<bytes::Bytes, hyper::Error>>;

/// Errors produced by [`Simulation`] handles.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// The simulation has shut down and no longer accepts entries.
    #[error("simulation is no longer accepting entries")]
    Closed,
}

/// Connection settings shared by every simulation of one replay run.
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    base_url: String,
    auth: Option<HeaderValue>,
}

impl SimulationSettings {
    /// Build settings from the replay target, pre-encoding the basic-auth
    /// header when credentials are configured.
    #[must_use]
    pub fn new(target: &ReplayTarget) -> Self {
        let auth = target.auth.as_ref().map(|credentials| {
            let token = base64::engine::general_purpose::STANDARD.encode(format!(
                "{username}:{password}",
                username = credentials.username,
                password = credentials.password
            ));
            HeaderValue::from_str(&format!("Basic {token}"))
                .expect("base64 basic auth header is ascii")
        });
        Self {
            base_url: target.base_url.clone(),
            auth,
        }
    }
}

/// Cheap handle submitting entries into a simulation's inbound queue.
#[derive(Debug, Clone)]
pub struct SimulationHandle {
    sender: mpsc::Sender<LogEntry>,
    last_action: Arc<StdMutex<Instant>>,
}

impl SimulationHandle {
    /// Enqueue one entry for replay. Non-GET verbs are accepted and
    /// dropped without enqueueing; a full queue suspends the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the simulation has shut down.
    pub async fn process(&self, entry: LogEntry) -> Result<(), Error> {
        if entry.verb != Verb::Get {
            return Ok(());
        }
        self.sender.send(entry).await.map_err(|_| Error::Closed)
    }

    /// Whether this simulation still counts as live: entries queued or
    /// traffic within the idle window.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let queued = crate::processor::queued(&self.sender);
        queued > 0
            || self
                .last_action
                .lock()
                .expect("last action lock poisoned")
                .elapsed()
                < IDLE_AFTER
    }
}

/// One per-client replay session.
#[derive(Debug)]
pub struct Simulation {
    handle: SimulationHandle,
    broadcaster: Broadcaster,
}

impl Simulation {
    /// Create a session and start its worker pool. Worker RNGs derive from
    /// the given seed.
    #[must_use]
    pub fn new(settings: &SimulationSettings, downstream: IndexerHandle, seed: u64) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
        let receiver = Arc::new(Mutex::new(receiver));
        let last_action = Arc::new(StdMutex::new(Instant::now()));
        let (watcher, broadcaster) = shutdown::signal();
        let client: ReplayClient = Client::builder(TokioExecutor::new()).build_http();

        for index in 0..WORKERS {
            let worker = Worker {
                receiver: Arc::clone(&receiver),
                shutdown: watcher.register(),
                caller: Caller {
                    client: client.clone(),
                    base_url: settings.base_url.clone(),
                    auth: settings.auth.clone(),
                    downstream: downstream.clone(),
                    last_action: Arc::clone(&last_action),
                    rng: StdRng::seed_from_u64(seed.wrapping_add(index as u64)),
                },
            };
            tokio::spawn(worker.spin());
        }
        drop(watcher);

        Self {
            handle: SimulationHandle {
                sender,
                last_action,
            },
            broadcaster,
        }
    }

    /// A cloneable submission handle.
    #[must_use]
    pub fn handle(&self) -> SimulationHandle {
        self.handle.clone()
    }

    /// See [`SimulationHandle::is_active`].
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    #[cfg(test)]
    pub(crate) fn set_last_action(&self, instant: Instant) {
        *self
            .handle
            .last_action
            .lock()
            .expect("last action lock poisoned") = instant;
    }

    /// Drain the inbound queue, broadcast shutdown and wait for all six
    /// workers to exit.
    ///
    /// The queue stays open until the workers are gone; the broadcast, not
    /// channel closure, is what stops them.
    pub async fn finish(self) {
        crate::processor::drain(&self.handle.sender).await;
        self.broadcaster.signal_and_wait().await;
    }
}

struct Worker {
    receiver: Arc<Mutex<mpsc::Receiver<LogEntry>>>,
    shutdown: Watcher,
    caller: Caller,
}

impl Worker {
    async fn spin(self) {
        let Worker {
            receiver,
            mut shutdown,
            mut caller,
        } = self;

        loop {
            tokio::select! {
                received = async { receiver.lock().await.recv().await } => {
                    match received {
                        Some(entry) => {
                            if entry.content_type == ContentType::Ignore {
                                continue;
                            }
                            caller.replay(entry).await;
                        }
                        None => break,
                    }
                }
                () = shutdown.recv() => break,
            }
        }
    }
}

struct Caller {
    client: ReplayClient,
    base_url: String,
    auth: Option<HeaderValue>,
    downstream: IndexerHandle,
    last_action: Arc<StdMutex<Instant>>,
    rng: StdRng,
}

impl Caller {
    /// Re-issue one entry against the target and ship the annotated record
    /// downstream.
    async fn replay(&mut self, mut entry: LogEntry) {
        self.touch();

        entry.replay.correlation_id = self.correlation_id();
        let now = Utc::now();
        entry.replay.offset_ms = (now - entry.timestamp).num_milliseconds();
        entry.timestamp = now;

        counter!("requests_sent").increment(1);
        let started = Instant::now();
        match self.call(&entry).await {
            Ok(status) => {
                entry.replay.duration_ms = elapsed_millis(started);
                entry.replay.error_message = status.as_u16().to_string();
                if status.as_u16() == entry.response {
                    counter!("request_ok").increment(1);
                } else {
                    entry.replay.error = true;
                    entry.replay.error_message = format!(
                        "Wrong status returned: {actual} (expected: {expected})",
                        actual = status.as_u16(),
                        expected = entry.response
                    );
                    counter!("request_failure").increment(1);
                }
            }
            Err(message) => {
                entry.replay.duration_ms = elapsed_millis(started);
                entry.replay.error = true;
                entry.replay.error_message = message;
                counter!("request_failure").increment(1);
            }
        }
        self.touch();

        if self.downstream.process(entry).await.is_err() {
            counter!("replay_records_dropped").increment(1);
            warn!("indexer has shut down, dropping replay record");
        }
    }

    async fn call(&self, entry: &LogEntry) -> Result<StatusCode, String> {
        let uri = format!("{base}{request}", base = self.base_url, request = entry.request);

        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(uri.as_str())
            .header("X-Correlation-Id", entry.replay.correlation_id.as_str());
        if let Some(auth) = &self.auth {
            builder = builder.header(AUTHORIZATION, auth.clone());
        }
        let request = builder
            .body(crate::full(Vec::new()))
            .map_err(|err| format!("failed to build request for {uri}: {err}"))?;

        match time::timeout(CALL_TIMEOUT, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                let _ = response.into_body().collect().await;
                Ok(status)
            }
            Ok(Err(err)) => Err(format!("request to {uri} failed: {err}")),
            Err(_) => Err(format!(
                "request to {uri} timed out after {timeout}s",
                timeout = CALL_TIMEOUT.as_secs()
            )),
        }
    }

    fn correlation_id(&mut self) -> String {
        let mut id = String::with_capacity(4 + CORRELATION_LENGTH);
        id.push_str("rep-");
        for _ in 0..CORRELATION_LENGTH {
            let index = self.rng.random_range(0..ALPHANUMERIC.len());
            id.push(ALPHANUMERIC[index] as char);
        }
        id
    }

    fn touch(&self) {
        *self
            .last_action
            .lock()
            .expect("last action lock poisoned") = Instant::now();
    }
}

fn elapsed_millis(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::BasicAuth;
    use crate::processor::indexer::Indexer;
    use crate::testing::StubServer;

    fn settings(base_url: String) -> SimulationSettings {
        SimulationSettings::new(&ReplayTarget {
            base_url,
            auth: None,
        })
    }

    fn indexed_documents(es: &StubServer) -> Vec<serde_json::Value> {
        es.requests()
            .iter()
            .flat_map(|request| {
                request
                    .body
                    .lines()
                    .skip(1)
                    .step_by(2)
                    .map(|line| serde_json::from_str(line).expect("document should be json"))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_mismatches_are_recorded_and_indexed() {
        let target = StubServer::spawn(StatusCode::INTERNAL_SERVER_ERROR).await;
        let es = StubServer::spawn(StatusCode::OK).await;
        let indexer = Indexer::with_workers(&es.url(), 1);

        let simulation = Simulation::new(&settings(target.url()), indexer.handle(), 7);
        simulation
            .handle()
            .process(crate::testing::entry("10.0.0.1", Verb::Get, "/foo", 200))
            .await
            .expect("simulation should accept the entry");
        simulation.finish().await;
        indexer
            .finish()
            .await
            .expect("indexer finish task should complete");

        let documents = indexed_documents(&es);
        assert_eq!(1, documents.len());
        let replay = &documents[0]["replay"];
        assert_eq!(true, replay["error"]);
        assert_eq!(
            "Wrong status returned: 500 (expected: 200)",
            replay["error_message"]
        );
        assert!(replay["duration_ms"].as_u64().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn matching_redirects_are_not_errors() {
        let target = StubServer::spawn(StatusCode::MOVED_PERMANENTLY).await;
        let es = StubServer::spawn(StatusCode::OK).await;
        let indexer = Indexer::with_workers(&es.url(), 1);

        let simulation = Simulation::new(&settings(target.url()), indexer.handle(), 7);
        // A 3xx original would be classified ignore upstream; force it
        // through to observe the redirect comparison.
        let mut entry = crate::testing::entry("10.0.0.1", Verb::Get, "/moved", 301);
        entry.content_type = ContentType::Page;
        simulation
            .handle()
            .process(entry)
            .await
            .expect("simulation should accept the entry");
        simulation.finish().await;
        indexer
            .finish()
            .await
            .expect("indexer finish task should complete");

        let documents = indexed_documents(&es);
        assert_eq!(1, documents.len());
        assert_eq!(false, documents[0]["replay"]["error"]);
        assert_eq!("301", documents[0]["replay"]["error_message"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn correlation_ids_are_fresh_per_call() {
        let target = StubServer::spawn(StatusCode::OK).await;
        let es = StubServer::spawn(StatusCode::OK).await;
        let indexer = Indexer::with_workers(&es.url(), 1);

        let simulation = Simulation::new(&settings(target.url()), indexer.handle(), 7);
        let handle = simulation.handle();
        for _ in 0..30 {
            handle
                .process(crate::testing::entry("10.0.0.1", Verb::Get, "/foo", 200))
                .await
                .expect("simulation should accept entries");
        }
        simulation.finish().await;

        let requests = target.requests();
        assert_eq!(30, requests.len());
        let ids: HashSet<String> = requests
            .iter()
            .map(|request| {
                request.headers["x-correlation-id"]
                    .to_str()
                    .expect("correlation id should be ascii")
                    .to_string()
            })
            .collect();
        assert_eq!(30, ids.len());
        for id in &ids {
            assert!(id.starts_with("rep-"));
            assert_eq!(14, id.len());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_get_verbs_are_filtered_out() {
        let target = StubServer::spawn(StatusCode::OK).await;
        let es = StubServer::spawn(StatusCode::OK).await;
        let indexer = Indexer::with_workers(&es.url(), 1);

        let simulation = Simulation::new(&settings(target.url()), indexer.handle(), 7);
        let handle = simulation.handle();
        handle
            .process(crate::testing::entry("10.0.0.1", Verb::Post, "/foo", 200))
            .await
            .expect("non-GET entries are accepted and dropped");
        assert_eq!(0, crate::processor::queued(&handle.sender));
        simulation.finish().await;
        indexer
            .finish()
            .await
            .expect("indexer finish task should complete");

        assert!(target.requests().is_empty());
        assert!(es.requests().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ignored_entries_are_dropped_by_workers() {
        let target = StubServer::spawn(StatusCode::OK).await;
        let es = StubServer::spawn(StatusCode::OK).await;
        let indexer = Indexer::with_workers(&es.url(), 1);

        let simulation = Simulation::new(&settings(target.url()), indexer.handle(), 7);
        simulation
            .handle()
            .process(crate::testing::entry(
                "10.0.0.1",
                Verb::Get,
                "/healthcheck",
                200,
            ))
            .await
            .expect("ignored entries are accepted and dropped");
        simulation.finish().await;
        indexer
            .finish()
            .await
            .expect("indexer finish task should complete");

        assert!(target.requests().is_empty());
        assert!(es.requests().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn basic_auth_is_attached_when_configured() {
        let target = StubServer::spawn(StatusCode::OK).await;
        let es = StubServer::spawn(StatusCode::OK).await;
        let indexer = Indexer::with_workers(&es.url(), 1);

        let settings = SimulationSettings::new(&ReplayTarget {
            base_url: target.url(),
            auth: Some(BasicAuth {
                username: "user".to_string(),
                password: "pass".to_string(),
            }),
        });
        let simulation = Simulation::new(&settings, indexer.handle(), 7);
        simulation
            .handle()
            .process(crate::testing::entry("10.0.0.1", Verb::Get, "/foo", 200))
            .await
            .expect("simulation should accept the entry");
        simulation.finish().await;

        let requests = target.requests();
        assert_eq!(1, requests.len());
        assert_eq!(
            "Basic dXNlcjpwYXNz",
            requests[0].headers["authorization"]
                .to_str()
                .expect("authorization header should be ascii")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finish_completes_while_handles_remain_live() {
        let target = StubServer::spawn(StatusCode::OK).await;
        let es = StubServer::spawn(StatusCode::OK).await;
        let indexer = Indexer::with_workers(&es.url(), 1);

        let simulation = Simulation::new(&settings(target.url()), indexer.handle(), 7);
        let handle = simulation.handle();
        handle
            .process(crate::testing::entry("10.0.0.1", Verb::Get, "/foo", 200))
            .await
            .expect("simulation should accept the entry");

        // The live handle keeps the queue open, so the workers can only
        // exit through the shutdown broadcast.
        tokio::time::timeout(Duration::from_secs(5), simulation.finish())
            .await
            .expect("finish should not depend on the queue closing");
        drop(handle);

        assert_eq!(1, target.requests().len());
        indexer
            .finish()
            .await
            .expect("indexer finish task should complete");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_simulations_report_inactive() {
        let target = StubServer::spawn(StatusCode::OK).await;
        let es = StubServer::spawn(StatusCode::OK).await;
        let indexer = Indexer::with_workers(&es.url(), 1);

        let simulation = Simulation::new(&settings(target.url()), indexer.handle(), 7);
        assert!(simulation.is_active());

        let backdated = Instant::now()
            .checked_sub(IDLE_AFTER + Duration::from_secs(1))
            .expect("clock supports backdating");
        *simulation
            .handle
            .last_action
            .lock()
            .expect("last action lock poisoned") = backdated;
        assert!(!simulation.is_active());

        simulation.finish().await;
    }
}
