// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Persist-before-send event emission.
//!
//! Every event a run produces goes through [`Emitter`]: the store appends
//! (and signs) it first, then the live buffer sees it. No subscriber can
//! ever observe an event that is not durable.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::domain::event::{ArtifactType, Event, EventPayload};
use crate::domain::run::{RunId, RunState, TaskId};
use crate::domain::store::{Store, StoreError};
use crate::infrastructure::stream_hub::StreamHub;

pub struct Emitter {
    store: Arc<dyn Store>,
    hub: Arc<StreamHub>,
    task_id: TaskId,
    run_id: RunId,
}

impl Emitter {
    pub fn new(store: Arc<dyn Store>, hub: Arc<StreamHub>, task_id: TaskId, run_id: RunId) -> Self {
        Self { store, hub, task_id, run_id }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    async fn emit(&self, payload: EventPayload) -> Result<Event, StoreError> {
        let event = self.store.append_event(&self.run_id, payload).await?;
        self.hub.publish(&self.run_id, event.clone());
        Ok(event)
    }

    /// Transition the run and announce it in one status event.
    pub async fn status(
        &self,
        state: RunState,
        message: impl Into<String>,
    ) -> Result<Event, StoreError> {
        self.status_with_meta(state, message, Value::Object(Default::default())).await
    }

    pub async fn status_with_meta(
        &self,
        state: RunState,
        message: impl Into<String>,
        meta: Value,
    ) -> Result<Event, StoreError> {
        let message = message.into();
        self.store.set_run_state(&self.run_id, state).await?;
        info!(run_id = %self.run_id, state = %state, message = %message, "run state");
        self.emit(EventPayload::status_with_meta(&self.task_id, &self.run_id, state, message, meta))
            .await
    }

    pub async fn artifact(
        &self,
        artifact_type: ArtifactType,
        artifact: Value,
    ) -> Result<Event, StoreError> {
        self.emit(EventPayload::artifact(&self.task_id, &self.run_id, artifact_type, artifact))
            .await
    }
}
