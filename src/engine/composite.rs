// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! The built-in "composite" engine: a model whose completions are produced
//! by invoking one or more *other* models through the Pool, rather than by
//! any inference library directly.
//!
//! The teacher has no direct analogue for this — its engines always wrap a
//! concrete backend. The cycle this creates (Pool needs an Engine per
//! model; this Engine needs the Pool) is broken the same way the teacher
//! avoids owning cycles elsewhere (`ApiServer` holding `Arc<RwLock<Option<Arc<...>>>>`
//! subsystems rather than a subsystem holding itself back): `CompositeEngine`
//! stores no `Pool` reference at all. The caller (the Task Executor) passes
//! a `&Pool` into each call instead.

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{ChatCompletionRequest, Engine, EngineHandle, RunContext, TaskResult};
use crate::error::CoreError;
use crate::model::{ModelId, ModelSpec, TaskKind};
use crate::pool::Pool;

const SUPPORTED: &[TaskKind] = &[TaskKind::TextCompletion];

/// `ModelSpec.completion_defaults` is read as this shape for composite
/// models: the ids of the members to fan a chat request out to, and how
/// their replies are combined.
#[derive(Debug, Clone, Deserialize)]
pub struct CompositeConfig {
    pub members: Vec<ModelId>,
    #[serde(default)]
    pub strategy: CompositeStrategy,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CompositeStrategy {
    /// Use the first member's response only.
    #[default]
    FirstWins,
}

pub struct CompositeHandle {
    pub config: CompositeConfig,
}

impl EngineHandle for CompositeHandle {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct CompositeEngine;

impl CompositeEngine {
    /// Runs a chat completion through the composite's member models,
    /// borrowing the Pool only for the duration of this call.
    pub async fn run_with_pool(
        &self,
        handle: &dyn EngineHandle,
        req: &ChatCompletionRequest,
        ctx: &RunContext,
        pool: &Pool,
    ) -> Result<TaskResult, CoreError> {
        let handle = handle
            .as_any()
            .downcast_ref::<CompositeHandle>()
            .ok_or_else(|| CoreError::Internal("wrong engine handle type".to_string()))?;

        let member = handle
            .config
            .members
            .first()
            .ok_or_else(|| CoreError::Internal("composite model has no members".to_string()))?;

        let mut member_req = req.clone();
        member_req.model = member.clone();
        pool.run_chat_completion(
            member_req,
            ctx.cancel.clone(),
            ctx.on_chunk.clone(),
            ctx.tool_handlers.clone(),
        )
        .await
    }
}

#[async_trait]
impl Engine for CompositeEngine {
    fn supported_tasks(&self) -> &[TaskKind] {
        SUPPORTED
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn load(
        &self,
        spec: &ModelSpec,
        _cancel: CancellationToken,
    ) -> Result<Box<dyn EngineHandle>, CoreError> {
        let raw = serde_json::to_value(&spec.completion_defaults)
            .map_err(|e| CoreError::Load {
                model: spec.id.clone(),
                message: format!("invalid composite config: {e}"),
            })?;
        let config: CompositeConfig = serde_json::from_value(raw).map_err(|e| CoreError::Load {
            model: spec.id.clone(),
            message: format!("composite model requires a 'members' list: {e}"),
        })?;
        if config.members.is_empty() {
            return Err(CoreError::Load {
                model: spec.id.clone(),
                message: "composite model requires at least one member".to_string(),
            });
        }
        Ok(Box::new(CompositeHandle { config }))
    }

    async fn dispose(&self, _handle: std::sync::Arc<dyn EngineHandle>) {}

    async fn run_chat_completion(
        &self,
        _handle: &dyn EngineHandle,
        _req: &ChatCompletionRequest,
        _ctx: &RunContext,
    ) -> Result<TaskResult, CoreError> {
        // Composite models always go through `run_with_pool`; the Task
        // Executor special-cases the "composite" engine id rather than
        // calling the trait method directly, since only it holds the Pool.
        Err(CoreError::Internal(
            "composite engine must be invoked via run_with_pool".to_string(),
        ))
    }
}
