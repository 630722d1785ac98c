// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! The top-level `Server` façade (§4.F): wires the Model Store, Instance
//! Pool, Task Executor and event bus together and exposes one method per
//! task kind.
//!
//! Grounded on the teacher's `ApiServer`/`AppState` (api/http_server.rs):
//! a struct holding `Arc`s to each subsystem, constructed once at startup
//! and shared behind `axum::extract::State`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    ChatCompletionRequest, Chunk, CompletionRequest, Engine, EmbeddingRequest, EngineRegistry,
    ImageToTextRequest, RunContext, SpeechToTextRequest, TaskResult, ToolHandlers,
};
use crate::error::CoreError;
use crate::events::{EventBus, ServerEvent};
use crate::model::ModelSpec;
use crate::pool::Pool;
use crate::store::Store;
use crate::task::TaskExecutor;

pub struct Server {
    pub store: Arc<Store>,
    pub pool: Arc<Pool>,
    pub executor: TaskExecutor,
    pub events: EventBus,
}

impl Server {
    pub async fn new(
        specs: Vec<ModelSpec>,
        models_path: PathBuf,
        download_concurrency: usize,
        max_concurrency: usize,
        engines: EngineRegistry,
    ) -> Result<Arc<Self>, CoreError> {
        let store = Arc::new(Store::new(specs, models_path, download_concurrency)?);
        let pool = Pool::new(store.clone(), Arc::new(engines), max_concurrency);
        let events = EventBus::default();
        let executor = TaskExecutor::new(pool.clone(), events.clone());

        let server = Arc::new(Self { store, pool, executor, events });
        server.prepare_eager_models().await;
        Ok(server)
    }

    /// Kicks off preparation (and, for `minInstances > 0` models, loading)
    /// for every model whose effective preparation mode isn't `on-demand`.
    /// `blocking` models are awaited before this returns; `async` models
    /// are kicked off in the background.
    async fn prepare_eager_models(self: &Arc<Self>) {
        for model_id in self.store.eager_models() {
            let Ok(spec) = self.store.spec(&model_id).map(Clone::clone) else { continue };
            let server = self.clone();
            let model_id_for_task = model_id.clone();
            let task = async move {
                server.events.publish(ServerEvent::ModelPreparationStarted { model: model_id_for_task.clone() });
                match server.store.prepare(&model_id_for_task).await {
                    Ok(_) => {
                        server.events.publish(ServerEvent::ModelPreparationFinished { model: model_id_for_task.clone() });
                        if spec.min_instances > 0 {
                            for _ in 0..spec.min_instances {
                                let cancel = CancellationToken::new();
                                let _ = server
                                    .pool
                                    .acquire(&model_id_for_task, &crate::instance::Fingerprint::empty(), &[], &cancel)
                                    .await;
                            }
                        }
                    }
                    Err(e) => {
                        server.events.publish(ServerEvent::ModelPreparationFailed {
                            model: model_id_for_task.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            };
            match spec.effective_preparation_mode() {
                crate::model::PreparationMode::Blocking => task.await,
                crate::model::PreparationMode::Async => {
                    tokio::spawn(task);
                }
                crate::model::PreparationMode::OnDemand => {}
            }
        }
    }

    pub async fn process_chat_completion(
        &self,
        req: ChatCompletionRequest,
        timeout: Option<Duration>,
        cancel: CancellationToken,
        tool_handlers: Arc<ToolHandlers>,
    ) -> Result<TaskResult, CoreError> {
        self.executor.run(req, timeout, cancel, tool_handlers).await
    }

    pub async fn process_chat_completion_streaming(
        &self,
        req: ChatCompletionRequest,
        timeout: Option<Duration>,
        cancel: CancellationToken,
        on_chunk: mpsc::Sender<Chunk>,
        tool_handlers: Arc<ToolHandlers>,
    ) -> Result<TaskResult, CoreError> {
        self.executor.run_streaming(req, timeout, cancel, on_chunk, tool_handlers).await
    }

    pub async fn process_completion(
        &self,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<TaskResult, CoreError> {
        let spec = self.store.spec(&req.model)?.clone();
        let want = crate::scheduler::fingerprint_text(&req.prompt);
        let lease = self.pool.acquire(&req.model, &want, &[], &cancel).await?;
        let engine = self
            .pool
            .engine_for(&spec.engine)
            .ok_or_else(|| CoreError::Load { model: req.model.clone(), message: "engine not registered".to_string() })?;
        let handle = self.instance_handle(&req.model, &lease).await?;
        let ctx = RunContext::new(cancel);
        let result = engine.run_text_completion(handle.as_ref(), &req, &ctx).await;
        let new_fingerprint = if result.is_ok() { want } else { crate::instance::Fingerprint::empty() };
        lease.release(new_fingerprint).await;
        result
    }

    pub async fn process_embedding(&self, req: EmbeddingRequest, cancel: CancellationToken) -> Result<TaskResult, CoreError> {
        let spec = self.store.spec(&req.model)?.clone();
        let lease = self
            .pool
            .acquire(&req.model, &crate::instance::Fingerprint::empty(), &[], &cancel)
            .await?;
        let engine = self
            .pool
            .engine_for(&spec.engine)
            .ok_or_else(|| CoreError::Load { model: req.model.clone(), message: "engine not registered".to_string() })?;
        let handle = self.instance_handle(&req.model, &lease).await?;
        let ctx = RunContext::new(cancel);
        let result = engine.run_embedding(handle.as_ref(), &req, &ctx).await;
        lease.release(crate::instance::Fingerprint::empty()).await;
        result
    }

    pub async fn process_image_to_text(&self, req: ImageToTextRequest, cancel: CancellationToken) -> Result<TaskResult, CoreError> {
        let spec = self.store.spec(&req.model)?.clone();
        let lease = self
            .pool
            .acquire(&req.model, &crate::instance::Fingerprint::empty(), &[], &cancel)
            .await?;
        let engine = self
            .pool
            .engine_for(&spec.engine)
            .ok_or_else(|| CoreError::Load { model: req.model.clone(), message: "engine not registered".to_string() })?;
        let handle = self.instance_handle(&req.model, &lease).await?;
        let ctx = RunContext::new(cancel);
        let result = engine.run_image_to_text(handle.as_ref(), &req, &ctx).await;
        lease.release(crate::instance::Fingerprint::empty()).await;
        result
    }

    pub async fn process_speech_to_text(&self, req: SpeechToTextRequest, cancel: CancellationToken) -> Result<TaskResult, CoreError> {
        let spec = self.store.spec(&req.model)?.clone();
        let lease = self
            .pool
            .acquire(&req.model, &crate::instance::Fingerprint::empty(), &[], &cancel)
            .await?;
        let engine = self
            .pool
            .engine_for(&spec.engine)
            .ok_or_else(|| CoreError::Load { model: req.model.clone(), message: "engine not registered".to_string() })?;
        let handle = self.instance_handle(&req.model, &lease).await?;
        let ctx = RunContext::new(cancel);
        let result = engine.run_speech_to_text(handle.as_ref(), &req, &ctx).await;
        lease.release(crate::instance::Fingerprint::empty()).await;
        result
    }

    async fn instance_handle(
        &self,
        model_id: &crate::model::ModelId,
        lease: &crate::pool::InstanceLease,
    ) -> Result<Arc<dyn crate::engine::EngineHandle>, CoreError> {
        self.pool
            .instance_handle(model_id, lease.uid())
            .await
            .ok_or_else(|| CoreError::Internal("instance handle missing".to_string()))
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    pub fn model_specs(&self) -> Vec<&ModelSpec> {
        self.store.specs().collect()
    }
}
