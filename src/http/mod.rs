// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! The HTTP façade (§6): an OpenAI-compatible `axum` router over the
//! `Server` core.
//!
//! Grounded on the teacher's `api::server` Router assembly (CORS + tracing
//! layers, `AppState` shared via `axum::extract::State`).

pub mod handlers;
pub mod sse;
pub mod types;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::server::Server;

pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/openai/v1/models", get(handlers::list_models))
        .route("/openai/v1/chat/completions", post(handlers::chat_completions))
        .route("/openai/v1/completions", post(handlers::completions))
        .route("/openai/v1/embeddings", post(handlers::embeddings))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(server)
}
