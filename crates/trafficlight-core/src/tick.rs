//! Tick broadcast between the conductor's timer and its workers.
//!
//! One [`watch`] channel carries the latest [`Beat`]. Publishing a tick is
//! a single send that wakes every subscribed worker at once. Each tick
//! carries its generation number, so a worker that was slow to wake can
//! tell exactly how many ticks it still owes and consume them one by one.
//!
//! [`Beat::Stop`] is terminal: once published, later ticks are refused.

use tokio::sync::watch;

/// The value broadcast to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Beat {
    /// Nothing broadcast yet.
    Idle,
    /// Tick with the given generation (1-based, increasing).
    Tick(u64),
    /// Stop requested; no further ticks follow.
    Stop,
}

/// Sending half of the tick broadcast.
#[derive(Debug)]
pub(crate) struct TickBus {
    tx: watch::Sender<Beat>,
}

impl TickBus {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(Beat::Idle);
        Self { tx }
    }

    /// A receiver that has already seen the current value.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Beat> {
        self.tx.subscribe()
    }

    /// Publish tick `generation` to every subscriber.
    ///
    /// Returns `false` (and publishes nothing) once stop was requested.
    pub(crate) fn broadcast(&self, generation: u64) -> bool {
        self.tx.send_if_modified(|beat| {
            if *beat == Beat::Stop {
                false
            } else {
                *beat = Beat::Tick(generation);
                true
            }
        })
    }

    /// Publish the stop signal, waking every subscriber.
    pub(crate) fn stop(&self) {
        self.tx.send_replace(Beat::Stop);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.tx.borrow() == Beat::Stop
    }
}

/// Resolve once `beats` carries [`Beat::Stop`] or its sender is gone.
pub(crate) async fn stop_signalled(beats: &mut watch::Receiver<Beat>) {
    loop {
        if *beats.borrow_and_update() == Beat::Stop {
            return;
        }
        if beats.changed().await.is_err() {
            return;
        }
    }
}
