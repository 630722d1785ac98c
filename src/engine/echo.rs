// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! A deterministic fake `Engine` used by integration tests and the demo
//! config, standing in for `llama-cpp-2` the way the teacher's
//! `MockMarketplace` (in `job_claim.rs`) stands in for on-chain calls:
//! predictable output, no external dependency, configurable latency.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    ChatCompletionRequest, ChatMessage, Chunk, CompletionRequest, Engine, EngineHandle,
    EmbeddingRequest, EmbeddingInputValue, FinishReason, RunContext, TaskResult, ToolCall, Usage,
};
use crate::error::CoreError;
use crate::model::{ModelSpec, TaskKind};

const SUPPORTED: &[TaskKind] = &[TaskKind::TextCompletion, TaskKind::Embedding];

/// Echoes the last user message back, word-chunked, with an optional
/// artificial per-token delay so tests can exercise cancellation and
/// streaming without timing races against real inference.
pub struct EchoEngine {
    pub chunk_delay: Duration,
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self {
            chunk_delay: Duration::ZERO,
        }
    }
}

pub struct EchoHandle;

impl EngineHandle for EchoHandle {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[async_trait]
impl Engine for EchoEngine {
    fn supported_tasks(&self) -> &[TaskKind] {
        SUPPORTED
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn load(
        &self,
        _spec: &ModelSpec,
        _cancel: CancellationToken,
    ) -> Result<Box<dyn EngineHandle>, CoreError> {
        Ok(Box::new(EchoHandle))
    }

    async fn dispose(&self, _handle: std::sync::Arc<dyn EngineHandle>) {}

    async fn run_chat_completion(
        &self,
        _handle: &dyn EngineHandle,
        req: &ChatCompletionRequest,
        ctx: &RunContext,
    ) -> Result<TaskResult, CoreError> {
        if let Some(result) = self.maybe_emit_tool_call(req) {
            return Ok(result);
        }

        let input = req
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let (text, finish_reason) = self.stream_words(&input, req.max_tokens, &req.stop, ctx).await?;
        let prompt_tokens = req.messages.iter().map(|m| word_count(&m.content)).sum();
        let completion_tokens = word_count(&text);
        Ok(TaskResult {
            message: Some(ChatMessage {
                role: "assistant".to_string(),
                content: text,
                tool_calls: Vec::new(),
                call_id: None,
            }),
            text: None,
            embedding: None,
            finish_reason: Some(finish_reason),
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            tool_calls: Vec::new(),
        })
    }

    async fn run_text_completion(
        &self,
        _handle: &dyn EngineHandle,
        req: &CompletionRequest,
        ctx: &RunContext,
    ) -> Result<TaskResult, CoreError> {
        let (text, finish_reason) = self
            .stream_words(&req.prompt, req.max_tokens, &req.stop, ctx)
            .await?;
        let prompt_tokens = word_count(&req.prompt);
        let completion_tokens = word_count(&text);
        Ok(TaskResult {
            message: None,
            text: Some(text),
            embedding: None,
            finish_reason: Some(finish_reason),
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            tool_calls: Vec::new(),
        })
    }

    async fn run_embedding(
        &self,
        _handle: &dyn EngineHandle,
        req: &EmbeddingRequest,
        _ctx: &RunContext,
    ) -> Result<TaskResult, CoreError> {
        let text = match &req.input {
            EmbeddingInputValue::Single(s) => s.clone(),
            EmbeddingInputValue::Many(v) => v.join(" "),
        };
        // A cheap, deterministic 8-dim "embedding" derived from byte sum so
        // tests can assert on stable output without a real model.
        let mut vector = vec![0f32; 8];
        for (i, b) in text.bytes().enumerate() {
            vector[i % 8] += b as f32 / 255.0;
        }
        let tokens = word_count(&text);
        Ok(TaskResult {
            message: None,
            text: None,
            embedding: Some(vector),
            finish_reason: None,
            usage: Usage {
                prompt_tokens: tokens,
                completion_tokens: 0,
                total_tokens: tokens,
            },
            tool_calls: Vec::new(),
        })
    }
}

impl EchoEngine {
    /// Deterministic tool-calling fixture: when a request declares `tools`
    /// and its triggering user message contains the marker below, requests
    /// the first declared tool twice in parallel, in a single round, before
    /// finalizing — standing in for a model that decides to call a tool
    /// mid-conversation ("Roll the dice twice").
    const TOOL_CALL_TRIGGER: &'static str = "ROLL_DICE_TWICE";

    fn maybe_emit_tool_call(&self, req: &ChatCompletionRequest) -> Option<TaskResult> {
        if req.tools.is_empty() {
            return None;
        }
        let triggered = req
            .messages
            .iter()
            .any(|m| m.role == "user" && m.content.contains(Self::TOOL_CALL_TRIGGER));
        if !triggered {
            return None;
        }
        let tool_name = req.tools.keys().next()?.clone();
        let tool_replies: Vec<&str> = req
            .messages
            .iter()
            .filter(|m| m.role == "tool")
            .map(|m| m.content.as_str())
            .collect();

        if !tool_replies.is_empty() {
            return Some(TaskResult {
                message: Some(ChatMessage {
                    role: "assistant".to_string(),
                    content: format!("rolled: {}", tool_replies.join(", ")),
                    tool_calls: Vec::new(),
                    call_id: None,
                }),
                text: None,
                embedding: None,
                finish_reason: Some(FinishReason::StopTrigger),
                usage: Usage::default(),
                tool_calls: Vec::new(),
            });
        }

        let calls = vec![
            ToolCall {
                id: "call-0".to_string(),
                name: tool_name.clone(),
                parameters: serde_json::json!({ "min": 1, "max": 6 }),
            },
            ToolCall {
                id: "call-1".to_string(),
                name: tool_name,
                parameters: serde_json::json!({ "min": 1, "max": 6 }),
            },
        ];
        Some(TaskResult {
            message: Some(ChatMessage {
                role: "assistant".to_string(),
                content: String::new(),
                tool_calls: calls.clone(),
                call_id: None,
            }),
            text: None,
            embedding: None,
            finish_reason: Some(FinishReason::FunctionCall),
            usage: Usage::default(),
            tool_calls: calls,
        })
    }

    async fn stream_words(
        &self,
        input: &str,
        max_tokens: Option<u32>,
        stop: &[String],
        ctx: &RunContext,
    ) -> Result<(String, FinishReason), CoreError> {
        let limit = max_tokens.unwrap_or(256) as usize;
        let mut output = String::new();
        let mut reason = FinishReason::EogToken;

        for (i, word) in input.split_whitespace().enumerate() {
            if ctx.cancel.is_cancelled() {
                reason = FinishReason::Cancel;
                break;
            }
            if i >= limit {
                reason = FinishReason::MaxTokens;
                break;
            }
            let prev_len = output.len();
            if !output.is_empty() {
                output.push(' ');
            }
            output.push_str(word);

            if stop.iter().any(|s| output.ends_with(s.as_str())) {
                output.truncate(prev_len);
                reason = FinishReason::StopTrigger;
                break;
            }

            if self.chunk_delay > Duration::ZERO {
                tokio::select! {
                    _ = tokio::time::sleep(self.chunk_delay) => {}
                    _ = ctx.cancel.cancelled() => {
                        reason = FinishReason::Cancel;
                        break;
                    }
                }
            }

            ctx.emit(Chunk {
                tokens: 1,
                text: format!("{word} "),
            })
            .await;
        }
        Ok((output, reason))
    }
}

fn word_count(s: &str) -> u32 {
    s.split_whitespace().count() as u32
}
