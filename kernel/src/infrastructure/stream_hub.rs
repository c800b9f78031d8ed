// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-run live event fan-out.
//!
//! Each run gets a bounded broadcast channel: the pipeline is the single
//! producer, every subscriber holds its own cursor into the ring. A
//! subscriber that falls behind the channel capacity observes `Lagged` and
//! is disconnected by the streamer; the pipeline never blocks on slow
//! consumers.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::event::Event;
use crate::domain::run::RunId;

const DEFAULT_CAPACITY: usize = 1024;

pub struct StreamHub {
    channels: RwLock<HashMap<RunId, broadcast::Sender<Event>>>,
    capacity: usize,
}

impl StreamHub {
    pub fn new(capacity: usize) -> Self {
        Self { channels: RwLock::new(HashMap::new()), capacity }
    }

    fn sender(&self, run_id: &RunId) -> broadcast::Sender<Event> {
        if let Some(tx) = self.channels.read().expect("hub lock poisoned").get(run_id) {
            return tx.clone();
        }
        let mut channels = self.channels.write().expect("hub lock poisoned");
        channels
            .entry(run_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Enqueue a durable event for live subscribers. Send errors mean no
    /// subscriber is attached, which is fine: replay serves late joiners.
    pub fn publish(&self, run_id: &RunId, event: Event) {
        let tx = self.sender(run_id);
        if tx.send(event).is_err() {
            debug!(run_id = %run_id, "no live subscribers, event served from replay only");
        }
    }

    pub fn subscribe(&self, run_id: &RunId) -> broadcast::Receiver<Event> {
        self.sender(run_id).subscribe()
    }

    pub fn subscriber_count(&self, run_id: &RunId) -> usize {
        self.channels
            .read()
            .expect("hub lock poisoned")
            .get(run_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop the channel for a finished run once subscribers detach.
    pub fn retire(&self, run_id: &RunId) {
        let mut channels = self.channels.write().expect("hub lock poisoned");
        if let Some(tx) = channels.get(run_id) {
            if tx.receiver_count() == 0 {
                channels.remove(run_id);
            }
        }
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
