//! Coordinated drain signalling for worker pools.
//!
//! Every pool in the pipeline shuts down the same way: the owner stops
//! feeding the inbound queue, broadcasts the signal and then waits for each
//! worker to wind down. The mechanism here has two halves, a [`Broadcaster`]
//! and a [`Watcher`]. Workers hold a `Watcher` and select on
//! [`Watcher::recv`] alongside their work sources; the pool owner holds the
//! `Broadcaster` and calls [`Broadcaster::signal_and_wait`] to both transmit
//! the signal and block until every watcher has been dropped.
//!
//! A watcher counts against the broadcaster until it is dropped, not merely
//! until it has seen the signal. A worker that flushes buffered work after
//! observing shutdown therefore still holds the broadcaster open until the
//! flush is done.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{
    Notify,
    broadcast::{self, error::RecvError},
};
use tracing::debug;

/// Construct a connected [`Watcher`] and [`Broadcaster`] pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = broadcast::channel(1);
    let peers = Arc::new(AtomicU32::new(1));
    let notify = Arc::new(Notify::new());

    let watcher = Watcher {
        peers: Arc::clone(&peers),
        receiver,
        received: false,
        notify: Arc::clone(&notify),
    };

    let broadcaster = Broadcaster {
        peers,
        sender,
        notify,
    };

    (watcher, broadcaster)
}

/// Transmits the drain signal to every connected [`Watcher`].
#[derive(Debug)]
pub struct Broadcaster {
    peers: Arc<AtomicU32>,
    sender: broadcast::Sender<()>,
    notify: Arc<Notify>,
}

impl Broadcaster {
    /// Send the signal without waiting for watchers to wind down.
    pub fn signal(self) {
        drop(self.sender);
    }

    /// Send the signal and block until every watcher has been dropped.
    ///
    /// Notification registration happens before the peer count is checked:
    /// a watcher dropping between check and await would otherwise be a lost
    /// wakeup.
    pub async fn signal_and_wait(self) {
        let Self {
            peers,
            sender,
            notify,
        } = self;
        drop(sender);

        loop {
            let notified = notify.notified();

            let remaining = peers.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            debug!("waiting for {remaining} workers");

            notified.await;
        }
    }
}

/// Observes the drain signal inside a worker.
#[derive(Debug)]
pub struct Watcher {
    peers: Arc<AtomicU32>,
    receiver: broadcast::Receiver<()>,
    received: bool,
    notify: Arc<Notify>,
}

impl Watcher {
    /// Receive the drain signal, blocking until it has been sent.
    ///
    /// Safe to call repeatedly: once the signal has been observed this
    /// returns immediately, yielding once so a completed watcher inside a
    /// `select!` cannot drown out its sibling arms.
    pub async fn recv(&mut self) {
        if self.received {
            tokio::task::yield_now().await;
            return;
        }

        match self.receiver.recv().await {
            Ok(()) | Err(RecvError::Closed) => {
                self.received = true;
            }
            Err(RecvError::Lagged(_)) => {
                unreachable!("single-shot signal channel can not lag");
            }
        }
    }

    /// Register a further watcher against the same broadcaster.
    #[must_use]
    pub fn register(&self) -> Self {
        self.peers.fetch_add(1, Ordering::SeqCst);

        Self {
            peers: Arc::clone(&self.peers),
            receiver: self.receiver.resubscribe(),
            received: self.received,
            notify: Arc::clone(&self.notify),
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        // fetch_sub would wrap at the zero boundary; count down with a CAS
        // loop instead.
        let mut old = self.peers.load(Ordering::Relaxed);
        while old > 0 {
            match self
                .peers
                .compare_exchange_weak(old, old - 1, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.notify.notify_waiters();
                    break;
                }
                Err(current) => old = current,
            }
        }
    }
}
