// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! The Instance Pool (§4.C): owns every loaded `Instance`, enforces global
//! and per-model concurrency limits, and evicts idle instances past their
//! TTL.
//!
//! Grounded on the teacher's `api::pool::ConnectionPool`: the same
//! idle/active split and background maintenance loop, generalized from a
//! single flat connection list into one `PoolState` per model id (each
//! model has its own min/max instance bounds and TTL), and from a spin-wait
//! `acquire()` loop into a waiter queue of one-shot wakeups so callers don't
//! busy-poll while a model is loading. Waiters carry the fingerprint they
//! want so a release can jump an affinity match ahead of strict FIFO order
//! (`PoolState::pick_waiter`, `scheduler::WaiterQueue`).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{
    ChatCompletionRequest, ChatMessage, Chunk, Engine, EngineRegistry, FinishReason, RunContext,
    TaskResult, ToolHandlers, Usage,
};
use crate::error::CoreError;
use crate::instance::{Fingerprint, Instance};
use crate::model::ModelId;
use crate::scheduler::{self, Selection};
use crate::store::Store;

struct Waiter {
    id: Uuid,
    want: Fingerprint,
    wake: oneshot::Sender<()>,
}

struct PoolState {
    instances: Vec<Instance>,
    waiters: VecDeque<Waiter>,
    loading: usize,
    waiter_fairness: scheduler::WaiterQueue,
}

impl PoolState {
    fn new() -> Self {
        Self {
            instances: Vec::new(),
            waiters: VecDeque::new(),
            loading: 0,
            waiter_fairness: scheduler::WaiterQueue::new(),
        }
    }

    /// Picks which waiter to wake for a release, per the §4.D fairness
    /// invariant: a waiter whose fingerprint matches the just-released
    /// instance may jump ahead of earlier-queued waiters, but no waiter may
    /// be skipped this way more than once consecutively. Falls back to
    /// strict FIFO when no waiter wants `new_fingerprint`.
    fn pick_waiter(&mut self, new_fingerprint: &Fingerprint) -> Option<Waiter> {
        if *new_fingerprint != Fingerprint::empty() {
            if let Some(pos) = self.waiters.iter().position(|w| w.want == *new_fingerprint) {
                if pos == 0 {
                    self.waiter_fairness.clear(self.waiters[0].id);
                    return self.waiters.pop_front();
                }
                let front_id = self.waiters[0].id;
                if self.waiter_fairness.may_skip(front_id) {
                    let matched_id = self.waiters[pos].id;
                    self.waiter_fairness.clear(matched_id);
                    return self.waiters.remove(pos);
                }
                // The front waiter was already skipped once in a row; serve
                // it now instead of jumping ahead again.
            }
        }
        let front = self.waiters.pop_front()?;
        self.waiter_fairness.clear(front.id);
        Some(front)
    }
}

/// A handle on a busy instance; releasing it (explicitly or via `Drop`)
/// returns the instance to `Idle` and wakes one waiter for its model.
///
/// Holds the global-concurrency permit (and, for GPU-backed models, the GPU
/// permit) for as long as the instance is busy -- not just while it was
/// being loaded -- so warm-instance reuse is gated by the same §3
/// invariants 2/3 as a fresh load.
pub struct InstanceLease {
    pool: Weak<Pool>,
    model_id: ModelId,
    uid: Uuid,
    released: bool,
    _global_permit: OwnedSemaphorePermit,
    _gpu_permit: Option<OwnedSemaphorePermit>,
}

impl InstanceLease {
    pub fn uid(&self) -> Uuid {
        self.uid
    }

    pub async fn release(mut self, new_fingerprint: Fingerprint) {
        self.released = true;
        if let Some(pool) = self.pool.upgrade() {
            pool.release_instance(&self.model_id, self.uid, new_fingerprint).await;
        }
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if !self.released {
            if let Some(pool) = self.pool.upgrade() {
                let model_id = self.model_id.clone();
                let uid = self.uid;
                // Dropped without an explicit release (e.g. a cancelled or
                // panicking caller): still return the instance to Idle so
                // the model doesn't leak capacity.
                tokio::spawn(async move {
                    pool.release_instance(&model_id, uid, Fingerprint::empty()).await;
                });
            }
        }
    }
}

pub struct Pool {
    self_weak: Weak<Pool>,
    store: Arc<Store>,
    engines: Arc<EngineRegistry>,
    models: RwLock<HashMap<ModelId, Arc<Mutex<PoolState>>>>,
    global: Arc<Semaphore>,
    gpu: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Pool {
    pub fn new(store: Arc<Store>, engines: Arc<EngineRegistry>, max_concurrency: usize) -> Arc<Self> {
        let pool = Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            store,
            engines,
            models: RwLock::new(HashMap::new()),
            global: Arc::new(Semaphore::new(max_concurrency.max(1))),
            gpu: Arc::new(Semaphore::new(1)),
            shutdown: CancellationToken::new(),
        });
        let janitor_pool = pool.clone();
        tokio::spawn(async move {
            janitor_pool.janitor_loop().await;
        });
        pool
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops accepting new waiters (via `shutdown_token`), waits (bounded)
    /// for in-flight tasks to notice cancellation and return their
    /// instances to Idle, then disposes every remaining `Instance` across
    /// every model through its engine's `dispose`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let model_ids: Vec<ModelId> = self.models.read().await.keys().cloned().collect();
            let mut any_busy = false;
            for model_id in &model_ids {
                let state_lock = self.state_for(model_id).await;
                let state = state_lock.lock().await;
                if state.loading > 0 || state.instances.iter().any(|i| !i.is_idle()) {
                    any_busy = true;
                    break;
                }
            }
            if !any_busy || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let model_ids: Vec<ModelId> = self.models.read().await.keys().cloned().collect();
        for model_id in model_ids {
            let Ok(spec) = self.store.spec(&model_id) else { continue };
            let Some(engine) = self.engines.get(&spec.engine) else { continue };
            let state_lock = self.state_for(&model_id).await;
            let drained: Vec<Instance> = {
                let mut state = state_lock.lock().await;
                std::mem::take(&mut state.instances)
            };
            for instance in drained {
                if let Some(handle) = instance.handle {
                    engine.dispose(handle).await;
                }
            }
        }
    }

    async fn state_for(&self, model_id: &ModelId) -> Arc<Mutex<PoolState>> {
        if let Some(state) = self.models.read().await.get(model_id) {
            return state.clone();
        }
        let mut guard = self.models.write().await;
        guard
            .entry(model_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(PoolState::new())))
            .clone()
    }

    /// Acquires a busy instance for `model_id`, loading a new one if
    /// capacity allows and no idle instance matches, or waiting for one to
    /// free up otherwise. `want`/`want_prefixes` drive context-affinity
    /// selection (§4.D); pass `Fingerprint::empty()` and an empty slice for
    /// tasks with no conversational state (embeddings, etc.).
    pub async fn acquire(
        &self,
        model_id: &ModelId,
        want: &Fingerprint,
        want_prefixes: &[Fingerprint],
        cancel: &CancellationToken,
    ) -> Result<InstanceLease, CoreError> {
        let spec = self.store.spec(model_id)?.clone();
        let state_lock = self.state_for(model_id).await;

        // The global and (for GPU models) binary GPU permit are acquired up
        // front and held for the lease's whole busy lifetime, covering warm
        // reuse as well as a fresh load -- per §3 invariants 2/3 a running
        // generation counts against concurrency exactly like a load does.
        let global_permit = tokio::select! {
            permit = self.global.clone().acquire_owned() => permit.map_err(|_| CoreError::Shutdown)?,
            _ = cancel.cancelled() => return Err(CoreError::Internal("request cancelled while waiting for capacity".to_string())),
            _ = self.shutdown.cancelled() => return Err(CoreError::Shutdown),
        };

        let wants_gpu = spec.device.gpu.wants_gpu();
        let gpu_permit = if wants_gpu {
            Some(tokio::select! {
                permit = self.gpu.clone().acquire_owned() => permit.map_err(|_| CoreError::Shutdown)?,
                _ = cancel.cancelled() => return Err(CoreError::Internal("request cancelled while waiting for capacity".to_string())),
                _ = self.shutdown.cancelled() => return Err(CoreError::Shutdown),
            })
        } else {
            None
        };
        let mut global_permit = Some(global_permit);
        let mut gpu_permit = gpu_permit;

        loop {
            {
                let mut state = state_lock.lock().await;
                match scheduler::select(&state.instances, want, want_prefixes) {
                    Selection::ExactMatch(inst) | Selection::PrefixMatch(inst) | Selection::AnyIdle(inst) => {
                        let uid = inst.uid;
                        if let Some(i) = state.instances.iter_mut().find(|i| i.uid == uid) {
                            i.mark_busy();
                        }
                        return Ok(InstanceLease {
                            pool: self.self_weak.clone(),
                            model_id: model_id.clone(),
                            uid,
                            released: false,
                            _global_permit: global_permit.take().expect("permit held"),
                            _gpu_permit: gpu_permit.take(),
                        });
                    }
                    Selection::None => {
                        let total = state.instances.len() + state.loading;
                        if total < spec.max_instances {
                            state.loading += 1;
                            drop(state);
                            match self.load_instance(model_id, &spec, cancel).await {
                                Ok(instance) => {
                                    let mut state = state_lock.lock().await;
                                    state.loading -= 1;
                                    let uid = instance.uid;
                                    state.instances.push(instance);
                                    if let Some(i) = state.instances.iter_mut().find(|i| i.uid == uid) {
                                        i.mark_busy();
                                    }
                                    return Ok(InstanceLease {
                                        pool: self.self_weak.clone(),
                                        model_id: model_id.clone(),
                                        uid,
                                        released: false,
                                        _global_permit: global_permit.take().expect("permit held"),
                                        _gpu_permit: gpu_permit.take(),
                                    });
                                }
                                Err(e) => {
                                    let mut state = state_lock.lock().await;
                                    state.loading -= 1;
                                    return Err(e);
                                }
                            }
                        }
                    }
                }
            }

            // No capacity right now: wait to be woken by a release, a new
            // load slot, or cancellation/shutdown. The global/GPU permits
            // are already held, so this only waits on per-model instance
            // slots (max_instances), not on the semaphores again.
            let (tx, rx) = oneshot::channel();
            {
                let mut state = state_lock.lock().await;
                state.waiters.push_back(Waiter {
                    id: Uuid::new_v4(),
                    want: *want,
                    wake: tx,
                });
            }
            tokio::select! {
                _ = rx => {}
                _ = cancel.cancelled() => return Err(CoreError::Internal("request cancelled while waiting for capacity".to_string())),
                _ = self.shutdown.cancelled() => return Err(CoreError::Shutdown),
            }
        }
    }

    async fn load_instance(
        &self,
        model_id: &ModelId,
        spec: &crate::model::ModelSpec,
        cancel: &CancellationToken,
    ) -> Result<Instance, CoreError> {
        let wants_gpu = spec.device.gpu.wants_gpu();
        self.store.prepare(model_id).await?;

        let engine = self
            .engines
            .get(&spec.engine)
            .ok_or_else(|| CoreError::Load {
                model: model_id.clone(),
                message: format!("no engine registered for '{}'", spec.engine),
            })?;

        let handle = engine.load(spec, cancel.clone()).await?;
        let mut instance = Instance::new_loading(model_id.clone(), wants_gpu);
        instance.handle = Some(Arc::from(handle));
        instance.mark_idle();
        Ok(instance)
    }

    async fn release_instance(&self, model_id: &ModelId, uid: Uuid, new_fingerprint: Fingerprint) {
        let state_lock = self.state_for(model_id).await;
        let mut state = state_lock.lock().await;
        if let Some(instance) = state.instances.iter_mut().find(|i| i.uid == uid) {
            instance.fingerprint = new_fingerprint;
            instance.mark_idle();
        }
        if let Some(waiter) = state.pick_waiter(&new_fingerprint) {
            let _ = waiter.wake.send(());
        }
    }

    pub fn engine_for(&self, engine_id: &str) -> Option<Arc<dyn Engine>> {
        self.engines.get(engine_id)
    }

    pub async fn instance_handle(
        &self,
        model_id: &ModelId,
        uid: Uuid,
    ) -> Option<Arc<dyn crate::engine::EngineHandle>> {
        let state_lock = self.state_for(model_id).await;
        let state = state_lock.lock().await;
        state.instances.iter().find(|i| i.uid == uid).and_then(|i| i.handle.clone())
    }

    /// Runs a chat completion against `req.model`, acquiring and releasing
    /// an instance around the call. Used both by the HTTP façade's direct
    /// path and by `CompositeEngine::run_with_pool`.
    ///
    /// When the engine reports `finishReason = functionCall` and every
    /// requested tool has a registered handler in `tool_handlers`, this
    /// drives the inline tool-calling loop from §4.E itself: it invokes
    /// each handler, appends the assistant's call and the tool results to
    /// the conversation, and re-runs generation against the *same*
    /// instance (no release/re-acquire) until the model stops calling
    /// tools or `MAX_TOOL_ROUNDS` is reached. If any requested tool has no
    /// handler, the loop stops and the `functionCall` result is returned
    /// to the caller unchanged, per §4.E option (b).
    pub async fn run_chat_completion(
        &self,
        req: ChatCompletionRequest,
        cancel: CancellationToken,
        on_chunk: Option<mpsc::Sender<Chunk>>,
        tool_handlers: Arc<ToolHandlers>,
    ) -> Result<TaskResult, CoreError> {
        const MAX_TOOL_ROUNDS: usize = 8;

        let canonical = scheduler::canonicalize(&req.messages);
        let want = scheduler::fingerprint(&canonical);
        let prefixes = scheduler::prefix_fingerprints(&canonical);

        let lease = self.acquire(&req.model, &want, &prefixes, &cancel).await?;
        let spec = self.store.spec(&req.model)?.clone();
        let engine = self
            .engines
            .get(&spec.engine)
            .ok_or_else(|| CoreError::Load {
                model: req.model.clone(),
                message: format!("no engine registered for '{}'", spec.engine),
            })?;

        let mut ctx = RunContext::new(cancel).with_tool_handlers(tool_handlers.clone());
        if let Some(sink) = on_chunk {
            ctx = ctx.with_chunk_sink(sink);
        }

        let model_id = req.model.clone();
        let mut turn_req = req;
        let mut accumulated = Usage::default();
        let mut tool_rounds = 0usize;
        let outcome = loop {
            let handle = match self.instance_handle(&model_id, lease.uid).await {
                Some(h) => h,
                None => break Err(CoreError::Internal("instance handle missing".to_string())),
            };

            let result = if spec.engine == "composite" {
                let composite = match engine
                    .as_any()
                    .downcast_ref::<crate::engine::composite::CompositeEngine>()
                {
                    Some(c) => c,
                    None => break Err(CoreError::Internal("composite engine type mismatch".to_string())),
                };
                composite.run_with_pool(handle.as_ref(), &turn_req, &ctx, self).await
            } else {
                engine.run_chat_completion(handle.as_ref(), &turn_req, &ctx).await
            };

            let mut result = match result {
                Ok(r) => r,
                Err(e) => break Err(e),
            };
            accumulated.prompt_tokens += result.usage.prompt_tokens;
            accumulated.completion_tokens += result.usage.completion_tokens;
            accumulated.total_tokens += result.usage.total_tokens;

            let should_invoke = result.finish_reason == Some(FinishReason::FunctionCall)
                && !result.tool_calls.is_empty()
                && !tool_handlers.is_empty()
                && result.tool_calls.iter().all(|tc| tool_handlers.contains_key(&tc.name))
                && tool_rounds < MAX_TOOL_ROUNDS;

            if !should_invoke {
                result.usage = accumulated;
                break Ok(result);
            }

            if let Some(assistant_msg) = result.message.clone() {
                turn_req.messages.push(assistant_msg);
            }
            for call in &result.tool_calls {
                let handler = tool_handlers.get(&call.name).expect("checked above");
                let output = handler
                    .call(call.parameters.clone())
                    .await
                    .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }));
                turn_req.messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: output.to_string(),
                    tool_calls: Vec::new(),
                    call_id: Some(call.id.clone()),
                });
            }
            tool_rounds += 1;
        };

        // On success the engine's KV cache now holds the submitted turns
        // plus the freshly generated assistant reply (§4.E: "the fingerprint
        // of (request + newly appended assistant message)"), not just the
        // fingerprint of what was submitted -- otherwise the next turn's
        // prefix-match (which drops only its own trailing user message)
        // would never line up with what's actually resident.
        let new_fingerprint = match &outcome {
            Ok(result) => {
                let mut full = turn_req.messages.clone();
                if let Some(assistant_msg) = &result.message {
                    full.push(assistant_msg.clone());
                }
                scheduler::fingerprint(&scheduler::canonicalize(&full))
            }
            Err(_) => Fingerprint::empty(),
        };
        lease.release(new_fingerprint).await;
        outcome
    }

    /// Number of instances (any state) currently held for `model_id`. Used
    /// by tests to assert on pool sizing without reaching into `PoolState`.
    pub async fn instance_count(&self, model_id: &ModelId) -> usize {
        self.state_for(model_id).await.lock().await.instances.len()
    }

    /// `(uid, fingerprint)` for every instance currently held for `model_id`.
    /// Exposed for introspection/tests; the HTTP façade has no endpoint that
    /// surfaces raw fingerprints today but this is the natural seam for one.
    pub async fn instance_fingerprints(&self, model_id: &ModelId) -> Vec<(Uuid, Fingerprint)> {
        self.state_for(model_id)
            .await
            .lock()
            .await
            .instances
            .iter()
            .map(|i| (i.uid, i.fingerprint))
            .collect()
    }

    async fn janitor_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.cancelled() => return,
            }
            let model_ids: Vec<ModelId> = self.models.read().await.keys().cloned().collect();
            for model_id in model_ids {
                let Ok(spec) = self.store.spec(&model_id) else { continue };
                let ttl = spec.ttl;
                let min_instances = spec.min_instances;
                let state_lock = self.state_for(&model_id).await;
                let evicted: Vec<Instance> = {
                    let mut state = state_lock.lock().await;
                    let evictable: Vec<Uuid> = state
                        .instances
                        .iter()
                        .filter(|i| i.is_idle() && i.idle_for() > ttl)
                        .map(|i| i.uid)
                        .collect();
                    let keep_at_least = min_instances;
                    let current = state.instances.len();
                    let mut to_remove = evictable.len().min(current.saturating_sub(keep_at_least));
                    let mut kept = Vec::with_capacity(state.instances.len());
                    let mut evicted = Vec::new();
                    for inst in state.instances.drain(..) {
                        if to_remove > 0 && evictable.contains(&inst.uid) {
                            to_remove -= 1;
                            evicted.push(inst);
                        } else {
                            kept.push(inst);
                        }
                    }
                    state.instances = kept;
                    evicted
                };
                if evicted.is_empty() {
                    continue;
                }
                if let Some(engine) = self.engines.get(&spec.engine) {
                    for instance in evicted {
                        if let Some(handle) = instance.handle {
                            engine.dispose(handle).await;
                        }
                    }
                }
            }
        }
    }
}
