// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Server-wide lifecycle events, broadcast to any number of subscribers
//! (the HTTP façade's `/events` stream, logging, metrics).
//!
//! Grounded on the teacher's `host::availability::AvailabilityManager`,
//! which notifies subscribers of host state changes via
//! `tokio::sync::broadcast::channel`.

use tokio::sync::broadcast;

use crate::instance::InstanceState;
use crate::model::ModelId;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    InstanceLoading { model: ModelId },
    InstanceReady { model: ModelId },
    InstanceStateChanged { model: ModelId, state: String },
    TaskStarted { model: ModelId, task_id: uuid::Uuid },
    TaskCompleted { model: ModelId, task_id: uuid::Uuid },
    TaskFailed { model: ModelId, task_id: uuid::Uuid, message: String },
    ModelPreparationStarted { model: ModelId },
    ModelPreparationFinished { model: ModelId },
    ModelPreparationFailed { model: ModelId, message: String },
}

impl ServerEvent {
    pub fn instance_state_changed(model: ModelId, state: &InstanceState) -> Self {
        let label = match state {
            InstanceState::Loading => "loading",
            InstanceState::Idle => "idle",
            InstanceState::Busy => "busy",
            InstanceState::Preparing => "preparing",
            InstanceState::Disposing => "disposing",
            InstanceState::Error(_) => "error",
        };
        ServerEvent::InstanceStateChanged {
            model,
            state: label.to_string(),
        }
    }
}

/// Shared broadcaster. Held by `Server` and cloned into every subsystem
/// that needs to emit events (Store, Pool, Task Executor).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ServerEvent) {
        // No subscribers is the common case at startup; dropping the event
        // is correct, not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
