// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! The Task Executor (§4.E): drives one request through acquire → run →
//! release, merging caller cancellation with a request timeout and the
//! server's shutdown signal, and forwarding streamed chunks as they arrive.
//!
//! Grounded on the teacher's `inference::engine::InferenceHandle` (wraps a
//! `tokio::task::JoinHandle`, exposes `cancel()` via `task.abort()`) and
//! `api::websocket::session`'s use of `tokio_util::sync::CancellationToken`
//! for per-request cancellation, generalized into an executor that owns the
//! cancellation-merging and timeout logic instead of leaving it to callers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{ChatCompletionRequest, Chunk, FinishReason, TaskResult, ToolHandlers};
use crate::error::CoreError;
use crate::events::{EventBus, ServerEvent};
use crate::pool::Pool;

/// Where a task currently sits. Transient states (`Queued`, `Running`) are
/// observed only while a task is in flight; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    TimedOut,
    Failed,
}

pub struct TaskHandle {
    pub id: Uuid,
    join: tokio::task::JoinHandle<Result<TaskResult, CoreError>>,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Requests cancellation; the in-flight engine call observes this on
    /// its next cancellation-aware await point (chunk emission, decode
    /// loop iteration) rather than being forcibly aborted, so partial
    /// output already streamed to the caller isn't silently discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<TaskResult, CoreError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(CoreError::Internal(format!("task panicked: {e}"))),
        }
    }
}

/// Executes individual chat-completion tasks against the Pool, applying a
/// timeout and publishing lifecycle events.
pub struct TaskExecutor {
    pool: Arc<Pool>,
    events: EventBus,
}

impl TaskExecutor {
    pub fn new(pool: Arc<Pool>, events: EventBus) -> Self {
        Self { pool, events }
    }

    /// Runs a chat completion to completion (non-streaming). `timeout` of
    /// `None` means no deadline beyond `caller_cancel`/server shutdown.
    pub async fn run(
        &self,
        req: ChatCompletionRequest,
        timeout: Option<Duration>,
        caller_cancel: CancellationToken,
        tool_handlers: Arc<ToolHandlers>,
    ) -> Result<TaskResult, CoreError> {
        let handle = self.spawn(req, timeout, caller_cancel, None, tool_handlers);
        handle.join().await
    }

    /// Runs a chat completion, forwarding generated chunks on `on_chunk` as
    /// they're produced, and returning the final result once generation
    /// ends (by stop condition, cancellation, or timeout).
    pub async fn run_streaming(
        &self,
        req: ChatCompletionRequest,
        timeout: Option<Duration>,
        caller_cancel: CancellationToken,
        on_chunk: mpsc::Sender<Chunk>,
        tool_handlers: Arc<ToolHandlers>,
    ) -> Result<TaskResult, CoreError> {
        let handle = self.spawn(req, timeout, caller_cancel, Some(on_chunk), tool_handlers);
        handle.join().await
    }

    /// Same as `run_streaming` but returns a live `TaskHandle` immediately,
    /// letting the caller cancel mid-flight (used by the HTTP façade's SSE
    /// endpoint, which must react to the client disconnecting).
    pub fn spawn(
        &self,
        req: ChatCompletionRequest,
        timeout: Option<Duration>,
        caller_cancel: CancellationToken,
        on_chunk: Option<mpsc::Sender<Chunk>>,
        tool_handlers: Arc<ToolHandlers>,
    ) -> TaskHandle {
        let id = Uuid::new_v4();
        let shutdown = self.pool.shutdown_token();
        let merged = CancellationToken::new();

        // Merge caller cancellation, the server shutdown signal, and (if
        // set) a timeout into one token the engine call observes.
        {
            let merged = merged.clone();
            let caller_cancel = caller_cancel.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = caller_cancel.cancelled() => merged.cancel(),
                    _ = shutdown.cancelled() => merged.cancel(),
                    _ = merged.cancelled() => {}
                }
            });
        }
        // Distinct from `merged`/`caller_cancel`/`shutdown` so the join task
        // below can tell a timeout apart from caller-initiated cancellation
        // once the engine call returns `FinishReason::Cancel` either way.
        let timeout_cancel = CancellationToken::new();
        if let Some(d) = timeout {
            let merged = merged.clone();
            let timeout_cancel = timeout_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(d) => {
                        timeout_cancel.cancel();
                        merged.cancel();
                    }
                    _ = merged.cancelled() => {}
                }
            });
        }

        let pool = self.pool.clone();
        let events = self.events.clone();
        let model = req.model.clone();
        let task_cancel = merged.clone();

        events.publish(ServerEvent::TaskStarted { model: model.clone(), task_id: id });

        let join = tokio::spawn(async move {
            let mut result = pool.run_chat_completion(req, task_cancel.clone(), on_chunk, tool_handlers).await;
            if let Ok(r) = &mut result {
                if timeout_cancel.is_cancelled() && r.finish_reason == Some(FinishReason::Cancel) {
                    r.finish_reason = Some(FinishReason::Timeout);
                }
            }
            match &result {
                Ok(r) => {
                    if r.finish_reason == Some(FinishReason::Timeout) {
                        events.publish(ServerEvent::TaskFailed {
                            model: model.clone(),
                            task_id: id,
                            message: "timed out".to_string(),
                        });
                    } else {
                        events.publish(ServerEvent::TaskCompleted { model: model.clone(), task_id: id });
                    }
                }
                Err(e) => {
                    events.publish(ServerEvent::TaskFailed {
                        model: model.clone(),
                        task_id: id,
                        message: e.to_string(),
                    });
                }
            }
            result
        });

        TaskHandle { id, join, cancel: merged }
    }
}

/// Resolves the grammar text for a request: a named grammar from the
/// model's declared set, the built-in `"json"` grammar (always available
/// regardless of what the model declares), or none.
pub fn resolve_grammar(requested: Option<&str>, declared: &std::collections::HashMap<String, String>) -> Option<String> {
    match requested {
        Some("json") => Some(declared.get("json").cloned().unwrap_or_else(default_json_grammar)),
        Some(name) => declared.get(name).cloned(),
        None => None,
    }
}

fn default_json_grammar() -> String {
    // A minimal GBNF grammar constraining output to well-formed JSON values;
    // models may declare a stricter one under the same name to override it.
    r#"root ::= object | array | string | number | "true" | "false" | "null""#.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_grammar_falls_back_to_builtin_json() {
        let declared = std::collections::HashMap::new();
        let g = resolve_grammar(Some("json"), &declared);
        assert!(g.is_some());
    }

    #[test]
    fn resolve_grammar_prefers_declared_override() {
        let mut declared = std::collections::HashMap::new();
        declared.insert("json".to_string(), "root ::= object".to_string());
        let g = resolve_grammar(Some("json"), &declared);
        assert_eq!(g.as_deref(), Some("root ::= object"));
    }

    #[test]
    fn resolve_grammar_unknown_name_is_none() {
        let declared = std::collections::HashMap::new();
        assert!(resolve_grammar(Some("custom"), &declared).is_none());
    }
}
