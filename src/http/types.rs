// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! OpenAI-compatible wire types for the HTTP façade (§6).
//!
//! These are deliberately separate from `engine::ChatCompletionRequest`
//! etc.: the wire format follows OpenAI's naming (`snake_case`, `n`,
//! `logit_bias`) while the internal types follow this crate's own
//! conventions, mirroring how the teacher keeps `api::errors::ErrorResponse`
//! separate from the internal `ApiError` it's built from.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::{self, ChatMessage, FinishReason, TaskResult};
use crate::model::ModelId;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionWireRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub seed: Option<u64>,
    #[serde(default)]
    pub stop: StopField,
    #[serde(default)]
    pub stream: bool,
    pub grammar: Option<String>,
    #[serde(default)]
    pub logit_bias: HashMap<String, f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
pub enum StopField {
    #[default]
    #[serde(skip)]
    None,
    One(String),
    Many(Vec<String>),
}

impl StopField {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopField::None => Vec::new(),
            StopField::One(s) => vec![s],
            StopField::Many(v) => v,
        }
    }
}

impl ChatCompletionWireRequest {
    pub fn into_internal(self) -> Result<engine::ChatCompletionRequest, crate::error::CoreError> {
        Ok(engine::ChatCompletionRequest {
            model: ModelId::new(self.model)?,
            messages: self.messages,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: None,
            min_p: None,
            max_tokens: self.max_tokens,
            seed: self.seed,
            stop: self.stop.into_vec(),
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            token_bias: self.logit_bias,
            grammar: self.grammar,
            tools: HashMap::new(),
            system_prompt: None,
            template_format: None,
            drop_last_message: false,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionWireResponse {
    pub id: String,
    pub object: &'static str,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
    pub usage: WireUsage,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WireUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl ChatCompletionWireResponse {
    pub fn from_result(id: String, model: String, result: TaskResult) -> Self {
        let message = result.message.unwrap_or(ChatMessage {
            role: "assistant".to_string(),
            content: String::new(),
            tool_calls: Vec::new(),
            call_id: None,
        });
        Self {
            id,
            object: "chat.completion",
            model,
            choices: vec![ChatCompletionChoice {
                index: 0,
                message,
                finish_reason: result.finish_reason.map(finish_reason_wire),
            }],
            usage: WireUsage {
                prompt_tokens: result.usage.prompt_tokens,
                completion_tokens: result.usage.completion_tokens,
                total_tokens: result.usage.total_tokens,
            },
        }
    }
}

/// Maps the internal `FinishReason` to the OpenAI-compatible wire string
/// (spec §6 field-mapping table). OpenAI's wire format has no concept of a
/// cancelled or timed-out generation, so both collapse to `stop` like any
/// other early-terminated-but-successful completion.
pub fn finish_reason_wire(reason: FinishReason) -> String {
    match reason {
        FinishReason::EogToken => "stop",
        FinishReason::MaxTokens => "length",
        FinishReason::StopTrigger => "stop",
        FinishReason::FunctionCall => "tool_calls",
        FinishReason::Cancel => "stop",
        FinishReason::Timeout => "stop",
        FinishReason::Abort => "stop",
    }
    .to_string()
}

#[derive(Debug, Serialize)]
pub struct ModelListEntry {
    pub id: String,
    pub object: &'static str,
    pub task: crate::model::TaskKind,
}

#[derive(Debug, Serialize)]
pub struct ModelListResponse {
    pub object: &'static str,
    pub data: Vec<ModelListEntry>,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingWireRequest {
    pub model: String,
    pub input: engine::EmbeddingInputValue,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingWireResponse {
    pub object: &'static str,
    pub data: Vec<EmbeddingWireEntry>,
    pub model: String,
    pub usage: WireUsage,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingWireEntry {
    pub index: u32,
    pub embedding: Vec<f32>,
    pub object: &'static str,
}
