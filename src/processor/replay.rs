//! Router demultiplexing entries onto per-client replay sessions.
//!
//! A single router worker dequeues entries and hands each to the
//! [`Simulation`] keyed by its client address, creating sessions lazily on
//! first sight. Garbage collection of idle sessions piggybacks on creation:
//! whenever a new session is inserted the resident set is swept and
//! inactive sessions are drained and removed.
//!
//! ## Metrics
//!
//! `simulations_started`: Sessions created
//! `simulations_evicted`: Idle sessions drained and removed
//!

use std::sync::{Arc, Mutex as StdMutex};

use metrics::counter;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReplayTarget;
use crate::entry::{ContentType, LogEntry};
use crate::processor::indexer::IndexerHandle;
use crate::processor::simulation::{Simulation, SimulationSettings};
use crate::shutdown::{self, Broadcaster, Watcher};

const QUEUE_DEPTH: usize = 100;

type SimulationMap = Arc<StdMutex<FxHashMap<String, Simulation>>>;

/// The replay sink: routes entries to per-client sessions and manages
/// their lifecycle.
#[derive(Debug)]
pub struct Replay {
    sender: mpsc::Sender<LogEntry>,
    broadcaster: Broadcaster,
    simulations: SimulationMap,
}

impl Replay {
    /// Create a replay sink issuing against the given target. Annotated
    /// entries are shipped through `downstream`; per-session RNG seeds
    /// derive from `seed`.
    #[must_use]
    pub fn new(target: &ReplayTarget, downstream: IndexerHandle, seed: u64) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
        let simulations: SimulationMap = Arc::default();
        let (watcher, broadcaster) = shutdown::signal();

        let router = Router {
            receiver,
            shutdown: watcher,
            core: RouterCore {
                simulations: Arc::clone(&simulations),
                settings: SimulationSettings::new(target),
                downstream,
                rng: StdRng::seed_from_u64(seed),
            },
        };
        tokio::spawn(router.spin());

        Self {
            sender,
            broadcaster,
            simulations,
        }
    }

    /// Enqueue one entry for routing. Suspends while the router's inbound
    /// queue is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the router has shut down.
    pub async fn process(&self, entry: LogEntry) -> Result<(), super::Error> {
        self.sender
            .send(entry)
            .await
            .map_err(|_| super::Error::Closed)
    }

    /// Number of sessions currently resident.
    #[must_use]
    pub fn resident_simulations(&self) -> usize {
        self.simulations
            .lock()
            .expect("simulations lock poisoned")
            .len()
    }

    /// Begin a graceful drain: wait for the inbound queue to empty, stop
    /// the router, then drain every resident session sequentially.
    pub fn finish(self) -> JoinHandle<()> {
        let Self {
            sender,
            broadcaster,
            simulations,
        } = self;
        tokio::spawn(async move {
            super::drain(&sender).await;
            // The queue stays open until the router is gone; the
            // broadcast, not channel closure, is what stops it.
            broadcaster.signal_and_wait().await;
            drop(sender);

            let drained: Vec<(String, Simulation)> = {
                let mut simulations = simulations.lock().expect("simulations lock poisoned");
                simulations.drain().collect()
            };
            for (client_ip, simulation) in drained {
                debug!(client_ip = %client_ip, "closing user simulation");
                simulation.finish().await;
            }
        })
    }
}

struct Router {
    receiver: mpsc::Receiver<LogEntry>,
    shutdown: Watcher,
    core: RouterCore,
}

impl Router {
    async fn spin(self) {
        let Router {
            mut receiver,
            mut shutdown,
            mut core,
        } = self;

        loop {
            tokio::select! {
                received = receiver.recv() => {
                    match received {
                        Some(entry) => core.route(entry).await,
                        None => break,
                    }
                }
                () = shutdown.recv() => break,
            }
        }
    }
}

struct RouterCore {
    simulations: SimulationMap,
    settings: SimulationSettings,
    downstream: IndexerHandle,
    rng: StdRng,
}

impl RouterCore {
    async fn route(&mut self, entry: LogEntry) {
        if entry.content_type == ContentType::Ignore {
            return;
        }

        let mut evicted: Vec<(String, Simulation)> = Vec::new();
        let handle = {
            let mut simulations = self.simulations.lock().expect("simulations lock poisoned");
            if let Some(simulation) = simulations.get(&entry.client_ip) {
                simulation.handle()
            } else {
                info!(client_ip = %entry.client_ip, "started user simulation");
                counter!("simulations_started").increment(1);
                let simulation =
                    Simulation::new(&self.settings, self.downstream.clone(), self.rng.random());
                let handle = simulation.handle();
                simulations.insert(entry.client_ip.clone(), simulation);

                // Idle sweep piggybacks on creation. Sessions are unlinked
                // under the lock; their drain runs after release so routing
                // is not stalled behind a busy-waiting finish.
                let inactive: Vec<String> = simulations
                    .iter()
                    .filter(|(_, simulation)| !simulation.is_active())
                    .map(|(client_ip, _)| client_ip.clone())
                    .collect();
                for client_ip in inactive {
                    if let Some(simulation) = simulations.remove(&client_ip) {
                        evicted.push((client_ip, simulation));
                    }
                }
                handle
            }
        };

        for (client_ip, simulation) in evicted {
            info!(client_ip = %client_ip, "closed user simulation");
            counter!("simulations_evicted").increment(1);
            simulation.finish().await;
        }

        if handle.process(entry).await.is_err() {
            warn!("user simulation closed before the entry could be enqueued");
        }
    }
}
