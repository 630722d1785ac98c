// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! A single loaded model instance (§4.C "Instance Pool" data model).
//!
//! Grounded on the teacher's `inference::engine::Model`/`ModelStatus`: one
//! struct tracking load state, last-use time, and a handle to the
//! underlying engine resources, generalized to hold an opaque
//! `Box<dyn EngineHandle>` instead of a concrete `RealLlamaModel`.

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::engine::EngineHandle;
use crate::model::ModelId;

/// Where an instance currently sits in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Loading,
    Idle,
    Busy,
    Preparing,
    Disposing,
    Error(String),
}

/// A SHA-1 digest over an instance's resident conversation prefix, used by
/// the scheduler for context-affinity matching. `None` means the instance
/// has no meaningful prefix yet (freshly loaded, or just reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fingerprint(pub Option<[u8; 20]>);

impl Fingerprint {
    pub fn empty() -> Self {
        Fingerprint(None)
    }
}

/// One live instance of a model, owning engine-specific resources behind
/// `EngineHandle`.
pub struct Instance {
    pub uid: Uuid,
    pub model_id: ModelId,
    pub state: InstanceState,
    pub handle: Option<Arc<dyn EngineHandle>>,
    pub fingerprint: Fingerprint,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub use_count: u64,
    pub gpu: bool,
}

impl Instance {
    pub fn new_loading(model_id: ModelId, gpu: bool) -> Self {
        let now = Instant::now();
        Self {
            uid: Uuid::new_v4(),
            model_id,
            state: InstanceState::Loading,
            handle: None,
            fingerprint: Fingerprint::empty(),
            created_at: now,
            last_used_at: now,
            use_count: 0,
            gpu,
        }
    }

    pub fn mark_idle(&mut self) {
        self.state = InstanceState::Idle;
        self.last_used_at = Instant::now();
    }

    pub fn mark_busy(&mut self) {
        self.state = InstanceState::Busy;
        self.use_count += 1;
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, InstanceState::Idle)
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instance_starts_loading() {
        let inst = Instance::new_loading(ModelId::new("m1").unwrap(), false);
        assert_eq!(inst.state, InstanceState::Loading);
        assert_eq!(inst.use_count, 0);
    }

    #[test]
    fn mark_busy_increments_use_count() {
        let mut inst = Instance::new_loading(ModelId::new("m1").unwrap(), false);
        inst.mark_idle();
        assert!(inst.is_idle());
        inst.mark_busy();
        assert_eq!(inst.use_count, 1);
        assert!(!inst.is_idle());
    }
}
