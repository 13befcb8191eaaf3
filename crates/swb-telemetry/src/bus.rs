// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broadcast fan-out bus, generic over the event payload.
//!
//! [`Bus`] is a small reusable primitive: publish clones the event to every
//! live subscriber and keeps delivery accounting (published / delivered /
//! lost). The broker instantiates it over [`BrokerEvent`] as [`EventBus`];
//! tests are free to instantiate it over anything cloneable.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::BrokerEvent;

/// Default channel capacity per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Counters shared between a bus and all of its subscriptions.
#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    lost: AtomicU64,
}

impl Counters {
    fn lose(&self, n: u64) {
        self.lost.fetch_add(n, Ordering::Relaxed);
    }
}

/// A broadcast bus for fanning cloneable events out to many subscribers.
pub struct Bus<E> {
    tx: broadcast::Sender<E>,
    counters: Arc<Counters>,
}

/// The broker's event plane: a [`Bus`] carrying [`BrokerEvent`]s.
pub type EventBus = Bus<BrokerEvent>;

/// Subscription handle for the broker event plane.
pub type EventSubscription = BusSubscription<BrokerEvent>;

impl<E: Clone> Bus<E> {
    /// Create a bus with the default per-subscriber capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a bus with the given per-subscriber capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Attach a new subscription that sees events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> BusSubscription<E> {
        BusSubscription {
            rx: self.tx.subscribe(),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Publish an event, returning how many subscribers it reached.
    ///
    /// An event published with nobody listening is counted as lost rather
    /// than treated as an error.
    pub fn publish(&self, event: E) -> usize {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        match self.tx.send(event) {
            Ok(reached) => {
                self.counters
                    .delivered
                    .fetch_add(reached as u64, Ordering::Relaxed);
                reached
            }
            Err(_) => {
                self.counters.lose(1);
                0
            }
        }
    }

    /// Subscribers currently attached.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Snapshot of the delivery accounting.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            lost: self.counters.lost.load(Ordering::Relaxed),
            subscribers: self.tx.receiver_count(),
        }
    }
}

impl<E: Clone> Default for Bus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for Bus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<E> std::fmt::Debug for Bus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("subscribers", &self.tx.receiver_count())
            .finish_non_exhaustive()
    }
}

/// A handle receiving events from a [`Bus`].
///
/// Slow subscribers that overflow their channel skip the overwritten events;
/// every skipped event is counted in [`BusStats::lost`].
pub struct BusSubscription<E> {
    rx: broadcast::Receiver<E>,
    counters: Arc<Counters>,
}

impl<E: Clone> BusSubscription<E> {
    /// Receive the next event, waiting asynchronously.
    ///
    /// Returns `None` once the bus and all its clones are gone.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.counters.lose(skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive without blocking; `None` when nothing is queued or the bus
    /// is gone.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.counters.lose(skipped);
                }
                Err(_) => return None,
            }
        }
    }
}

/// Delivery accounting for a [`Bus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    /// Events handed to `publish`.
    pub published: u64,
    /// Per-subscriber deliveries (one event to three subscribers counts 3).
    pub delivered: u64,
    /// Events nobody received: published with no subscribers, or skipped by
    /// a lagging subscriber.
    pub lost: u64,
    /// Subscribers attached right now.
    pub subscribers: usize,
}
