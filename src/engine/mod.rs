// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! The Engine capability (§4.A): a polymorphic adapter over an underlying
//! inference library. Generalizes the teacher's `inference::engine::LlmEngine`
//! (a single concrete GGUF backend) into a trait so the Pool can hold any
//! number of engine kinds behind one handle type.

pub mod composite;
pub mod echo;
pub mod llama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::model::{ModelSpec, TaskKind};

/// One chat message. `tool_calls`/`call_id` are populated for assistant
/// messages emitting a tool call, and tool-result messages replying to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Canonical finish reason. `stopGenerationTrigger`/`customStopTrigger` from
/// older wire formats are accepted as deserialization aliases but never
/// produced internally (§9 Open Questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinishReason {
    EogToken,
    MaxTokens,
    #[serde(alias = "stopGenerationTrigger", alias = "customStopTrigger")]
    StopTrigger,
    FunctionCall,
    Cancel,
    Timeout,
    Abort,
}

/// One incremental piece of generated output.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub tokens: u32,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: crate::model::ModelId,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub min_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub seed: Option<u64>,
    #[serde(default)]
    pub stop: Vec<String>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub token_bias: HashMap<String, f32>,
    pub grammar: Option<String>,
    #[serde(default)]
    pub tools: HashMap<String, ToolDefinition>,
    pub system_prompt: Option<String>,
    pub template_format: Option<String>,
    /// Internal only: used by the scheduler's prefix-match path.
    #[serde(skip)]
    pub drop_last_message: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: crate::model::ModelId,
    pub prompt: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub seed: Option<u64>,
    #[serde(default)]
    pub stop: Vec<String>,
    pub grammar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingInput {
    #[serde(untagged)]
    pub value: EmbeddingInputValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInputValue {
    Single(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: crate::model::ModelId,
    pub input: EmbeddingInputValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageToTextRequest {
    pub model: crate::model::ModelId,
    pub url: Option<String>,
    pub file: Option<std::path::PathBuf>,
    pub bytes: Option<Vec<u8>>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechToTextRequest {
    pub model: crate::model::ModelId,
    pub audio: Vec<u8>,
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub message: Option<ChatMessage>,
    pub text: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Usage,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// A registered handler for one named tool a chat-completion request may
/// declare in `tools`. Invoked by the Pool's tool-calling loop (§4.E)
/// between generation rounds, outside the Engine trait itself: the engine
/// only ever reports that a call was requested, never executes one.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, parameters: serde_json::Value) -> Result<serde_json::Value, CoreError>;
}

/// Handlers a caller registers up front, keyed by tool name, so the Pool
/// can resolve a `ToolCall` back to executable code. Supplied out-of-band
/// from the request itself (the HTTP façade has no way to ship executable
/// code over the wire; it always runs with an empty map and lets the model
/// return `toolCalls` for the caller to orchestrate instead).
pub type ToolHandlers = HashMap<String, std::sync::Arc<dyn ToolHandler>>;

/// Execution context threaded through every engine call: cancellation, an
/// optional per-chunk sink for streaming callers, and the tool handlers (if
/// any) available for this request.
pub struct RunContext {
    pub cancel: CancellationToken,
    pub on_chunk: Option<mpsc::Sender<Chunk>>,
    pub tool_handlers: std::sync::Arc<ToolHandlers>,
}

impl RunContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            on_chunk: None,
            tool_handlers: std::sync::Arc::new(ToolHandlers::new()),
        }
    }

    pub fn with_chunk_sink(mut self, sink: mpsc::Sender<Chunk>) -> Self {
        self.on_chunk = Some(sink);
        self
    }

    pub fn with_tool_handlers(mut self, handlers: std::sync::Arc<ToolHandlers>) -> Self {
        self.tool_handlers = handlers;
        self
    }

    pub async fn emit(&self, chunk: Chunk) {
        if let Some(tx) = &self.on_chunk {
            let _ = tx.send(chunk).await;
        }
    }
}

/// Opaque state owned by an Engine implementation for one loaded instance.
pub trait EngineHandle: Send + Sync + std::any::Any {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Adapter over an underlying inference library (§4.A). Engines declare
/// which tasks they support; unsupported calls fail with
/// `CoreError::UnsupportedTask`.
#[async_trait]
pub trait Engine: Send + Sync {
    fn supported_tasks(&self) -> &[TaskKind];

    /// Lets callers that need a concrete engine type (the Pool, dispatching
    /// to `CompositeEngine::run_with_pool`) downcast from the trait object.
    fn as_any(&self) -> &dyn std::any::Any;

    async fn load(
        &self,
        spec: &ModelSpec,
        cancel: CancellationToken,
    ) -> Result<Box<dyn EngineHandle>, CoreError>;

    async fn dispose(&self, handle: std::sync::Arc<dyn EngineHandle>);

    async fn run_chat_completion(
        &self,
        handle: &dyn EngineHandle,
        req: &ChatCompletionRequest,
        ctx: &RunContext,
    ) -> Result<TaskResult, CoreError> {
        let _ = (handle, req, ctx);
        Err(CoreError::UnsupportedTask(TaskKind::TextCompletion))
    }

    async fn run_text_completion(
        &self,
        handle: &dyn EngineHandle,
        req: &CompletionRequest,
        ctx: &RunContext,
    ) -> Result<TaskResult, CoreError> {
        let _ = (handle, req, ctx);
        Err(CoreError::UnsupportedTask(TaskKind::TextCompletion))
    }

    async fn run_embedding(
        &self,
        handle: &dyn EngineHandle,
        req: &EmbeddingRequest,
        ctx: &RunContext,
    ) -> Result<TaskResult, CoreError> {
        let _ = (handle, req, ctx);
        Err(CoreError::UnsupportedTask(TaskKind::Embedding))
    }

    async fn run_image_to_text(
        &self,
        handle: &dyn EngineHandle,
        req: &ImageToTextRequest,
        ctx: &RunContext,
    ) -> Result<TaskResult, CoreError> {
        let _ = (handle, req, ctx);
        Err(CoreError::UnsupportedTask(TaskKind::ImageToText))
    }

    async fn run_speech_to_text(
        &self,
        handle: &dyn EngineHandle,
        req: &SpeechToTextRequest,
        ctx: &RunContext,
    ) -> Result<TaskResult, CoreError> {
        let _ = (handle, req, ctx);
        Err(CoreError::UnsupportedTask(TaskKind::SpeechToText))
    }
}

/// Lookup table of engine adapters keyed by the `engine` id used in
/// `ModelSpec`. Mirrors the teacher's per-id registries
/// (`ModelValidator::model_map`) but for engine implementations rather than
/// on-chain model records.
#[derive(Default)]
pub struct EngineRegistry {
    engines: HashMap<String, std::sync::Arc<dyn Engine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, engine: std::sync::Arc<dyn Engine>) {
        self.engines.insert(id.into(), engine);
    }

    pub fn get(&self, id: &str) -> Option<std::sync::Arc<dyn Engine>> {
        self.engines.get(id).cloned()
    }
}
