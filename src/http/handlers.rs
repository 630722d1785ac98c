// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Route handlers for the OpenAI-compatible façade.
//!
//! Grounded on the teacher's `api::errors::ApiError::to_response` (error →
//! HTTP status + JSON body mapping) and `api::server`'s handler functions
//! (axum `State`/`Json` extractors, `Result<impl IntoResponse, ApiError>`
//! return type).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{http::StatusCode, Json};
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::engine::{CompletionRequest, EmbeddingRequest, ToolHandlers};
use crate::error::CoreError;
use crate::server::Server;

use super::sse::{chunk_event, done_event};
use super::types::{
    ChatCompletionChoice, ChatCompletionWireRequest, ChatCompletionWireResponse, EmbeddingWireEntry,
    EmbeddingWireRequest, EmbeddingWireResponse, ModelListEntry, ModelListResponse, WireUsage,
};

pub type AppState = Arc<Server>;

#[derive(Debug, Serialize)]
pub struct ErrorWireResponse {
    pub error: ErrorWireBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorWireBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: &'static str,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorWireResponse {
            error: ErrorWireBody {
                message: self.to_string(),
                error_type: self.error_type(),
            },
        };
        (status, Json(body)).into_response()
    }
}

pub async fn list_models(State(server): State<AppState>) -> Json<ModelListResponse> {
    let data = server
        .model_specs()
        .into_iter()
        .map(|s| ModelListEntry {
            id: s.id.to_string(),
            object: "model",
            task: s.task,
        })
        .collect();
    Json(ModelListResponse { object: "list", data })
}

pub async fn chat_completions(
    State(server): State<AppState>,
    Json(req): Json<ChatCompletionWireRequest>,
) -> Result<Response, CoreError> {
    let model = req.model.clone();
    let stream = req.stream;
    let internal = req.into_internal()?;
    let cancel = CancellationToken::new();

    // The wire boundary can only carry tool *declarations* (`internal.tools`),
    // never executable handlers, so a non-tool-calling request always runs
    // with an empty map and surfaces `toolCalls` to the caller for external
    // orchestration (§4.E option (b)).
    let no_handlers = Arc::new(ToolHandlers::new());

    if !stream {
        let result = server
            .process_chat_completion(internal, Some(Duration::from_secs(300)), cancel, no_handlers)
            .await?;
        let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
        return Ok(Json(ChatCompletionWireResponse::from_result(id, model, result)).into_response());
    }

    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let (tx, rx) = tokio::sync::mpsc::channel(32);
    let server_for_task = server.clone();
    let cancel_for_task = cancel.clone();
    let id_for_events = id.clone();
    let model_for_events = model.clone();

    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<Result<axum::response::sse::Event, Infallible>>(32);
    tokio::spawn(async move {
        let mut chunk_rx = rx;
        let forward = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let event = chunk_event(&id_for_events, &model_for_events, &chunk);
                if event_tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
            let _ = event_tx.send(Ok(done_event())).await;
        });
        let result = server_for_task
            .process_chat_completion_streaming(internal, Some(Duration::from_secs(300)), cancel_for_task, tx, no_handlers)
            .await;
        let _ = forward.await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "streaming chat completion failed");
        }
    });

    let stream: ReceiverStream<Result<axum::response::sse::Event, Infallible>> = ReceiverStream::new(event_rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

pub async fn completions(
    State(server): State<AppState>,
    Json(req): Json<CompletionWireRequest>,
) -> Result<Json<ChatCompletionWireResponse>, CoreError> {
    let internal = CompletionRequest {
        model: crate::model::ModelId::new(req.model.clone())?,
        prompt: req.prompt,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        max_tokens: req.max_tokens,
        seed: None,
        stop: req.stop.unwrap_or_default(),
        grammar: None,
    };
    let cancel = CancellationToken::new();
    let result = server.process_completion(internal, cancel).await?;
    let id = format!("cmpl-{}", uuid::Uuid::new_v4());
    let message = crate::engine::ChatMessage {
        role: "assistant".to_string(),
        content: result.text.clone().unwrap_or_default(),
        tool_calls: Vec::new(),
        call_id: None,
    };
    Ok(Json(ChatCompletionWireResponse {
        id,
        object: "text_completion",
        model: req.model,
        choices: vec![ChatCompletionChoice {
            index: 0,
            message,
            finish_reason: result.finish_reason.map(super::types::finish_reason_wire),
        }],
        usage: WireUsage {
            prompt_tokens: result.usage.prompt_tokens,
            completion_tokens: result.usage.completion_tokens,
            total_tokens: result.usage.total_tokens,
        },
    }))
}

#[derive(Debug, serde::Deserialize)]
pub struct CompletionWireRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
}

pub async fn embeddings(
    State(server): State<AppState>,
    Json(req): Json<EmbeddingWireRequest>,
) -> Result<Json<EmbeddingWireResponse>, CoreError> {
    let model = req.model.clone();
    let internal = EmbeddingRequest {
        model: crate::model::ModelId::new(req.model)?,
        input: req.input,
    };
    let cancel = CancellationToken::new();
    let result = server.process_embedding(internal, cancel).await?;
    let embedding = result.embedding.unwrap_or_default();
    Ok(Json(EmbeddingWireResponse {
        object: "list",
        data: vec![EmbeddingWireEntry { index: 0, embedding, object: "embedding" }],
        model,
        usage: WireUsage {
            prompt_tokens: result.usage.prompt_tokens,
            completion_tokens: result.usage.completion_tokens,
            total_tokens: result.usage.total_tokens,
        },
    }))
}

pub async fn healthz() -> &'static str {
    "ok"
}
