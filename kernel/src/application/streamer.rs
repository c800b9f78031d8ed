// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Subscription layer: replay, then tail.
//!
//! A subscriber names a cursor (`since_seq`); the streamer first replays
//! every persisted event past it, then forwards live events from the
//! run's buffer, deduplicated against the cursor so the hand-off between
//! replay and tail never duplicates or drops a sequence number. Periodic
//! heartbeats keep the transport alive. A subscriber that lags past the
//! buffer watermark is dropped rather than ever blocking the pipeline.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::event::Event;
use crate::domain::run::RunId;
use crate::domain::store::{Store, StoreError};
use crate::infrastructure::stream_hub::StreamHub;

/// One frame delivered to a subscriber.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// A durable run event; `event.frame()` is the wire JSON and carries
    /// the `_seq` reconnect cursor.
    Event(Event),
    /// Keep-alive; never persisted, never sequenced.
    Heartbeat,
}

pub struct Streamer {
    store: Arc<dyn Store>,
    hub: Arc<StreamHub>,
    heartbeat_interval: Duration,
}

impl Streamer {
    pub fn new(store: Arc<dyn Store>, hub: Arc<StreamHub>, heartbeat_interval: Duration) -> Self {
        Self { store, hub, heartbeat_interval }
    }

    /// Attach to a run. Replays persisted events with `seq > since_seq`,
    /// then tails live events until the run reaches a terminal state.
    pub async fn subscribe(
        &self,
        run_id: &RunId,
        since_seq: u64,
    ) -> Result<Subscription, StoreError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;

        // attach to the live buffer before reading the backlog so nothing
        // published in between is lost; duplicates are filtered by cursor
        let live = self.hub.subscribe(run_id);
        let backlog: VecDeque<Event> =
            self.store.get_events(run_id, since_seq).await?.into();

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let done = run.state.is_terminal()
            && backlog
                .back()
                .map(|e| e.payload.state().map(|s| s.is_terminal()).unwrap_or(false))
                .unwrap_or(true);

        Ok(Subscription {
            store: Arc::clone(&self.store),
            run_id: run_id.clone(),
            cursor: since_seq,
            backlog,
            live,
            heartbeat,
            done,
        })
    }
}

/// A single subscriber's view of one run's stream.
pub struct Subscription {
    store: Arc<dyn Store>,
    run_id: RunId,
    cursor: u64,
    backlog: VecDeque<Event>,
    live: broadcast::Receiver<Event>,
    heartbeat: tokio::time::Interval,
    done: bool,
}

impl Subscription {
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    fn deliver(&mut self, event: Event) -> StreamFrame {
        self.cursor = event.seq;
        if event.payload.state().map(|s| s.is_terminal()).unwrap_or(false) {
            self.done = true;
        }
        StreamFrame::Event(event)
    }

    /// Next frame, or `None` when the stream has ended (run terminal and
    /// drained, or this subscriber lagged beyond the buffer watermark).
    pub async fn next(&mut self) -> Option<StreamFrame> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.seq <= self.cursor {
                    continue;
                }
                return Some(self.deliver(event));
            }
            if self.done {
                return None;
            }

            tokio::select! {
                received = self.live.recv() => match received {
                    Ok(event) => {
                        if event.seq <= self.cursor {
                            continue;
                        }
                        if event.seq > self.cursor + 1 {
                            // the buffer skipped ahead of us; fill the gap
                            // from durable storage before delivering
                            match self.store.get_events(&self.run_id, self.cursor).await {
                                Ok(events) => {
                                    self.backlog = events.into();
                                    continue;
                                }
                                Err(err) => {
                                    warn!(run_id = %self.run_id, error = %err, "backfill failed, dropping subscriber");
                                    return None;
                                }
                            }
                        }
                        return Some(self.deliver(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(run_id = %self.run_id, skipped, "subscriber lagged past watermark, dropping");
                        return None;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // producer is gone; serve whatever landed durably
                        match self.store.get_events(&self.run_id, self.cursor).await {
                            Ok(events) if !events.is_empty() => {
                                self.backlog = events.into();
                                continue;
                            }
                            _ => return None,
                        }
                    }
                },
                _ = self.heartbeat.tick() => {
                    return Some(StreamFrame::Heartbeat);
                }
            }
        }
    }
}
