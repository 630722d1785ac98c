// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Server-sent-events framing for streaming chat completions.
//!
//! Grounded on the teacher's `api::streaming::format_sse`: a terminal
//! `data: [DONE]\n\n` sentinel once generation finishes, JSON chunks
//! otherwise, adapted to `axum::response::sse::Event` instead of a raw
//! string the teacher writes directly to the socket.

use axum::response::sse::Event;
use serde::Serialize;

use crate::engine::Chunk;

#[derive(Debug, Serialize)]
pub struct ChatCompletionChunkWire {
    pub id: String,
    pub object: &'static str,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

pub fn chunk_event(id: &str, model: &str, chunk: &Chunk) -> Event {
    let wire = ChatCompletionChunkWire {
        id: id.to_string(),
        object: "chat.completion.chunk",
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta { content: Some(chunk.text.clone()) },
            finish_reason: None,
        }],
    };
    Event::default().data(serde_json::to_string(&wire).unwrap_or_default())
}

pub fn done_event() -> Event {
    Event::default().data("[DONE]")
}
