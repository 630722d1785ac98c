// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Tool-calling orchestration: the Pool must invoke a registered handler for
//! each `FunctionCall` result, feed the reply back as a tool message, and
//! keep generating until the engine stops requesting tools.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use inference_mux::engine::echo::EchoEngine;
use inference_mux::engine::{
    ChatCompletionRequest, ChatMessage, EngineRegistry, ToolDefinition, ToolHandler, ToolHandlers,
};
use inference_mux::error::CoreError;
use inference_mux::model::{DeviceSpec, ModelId, ModelSource, ModelSpec, PreparationMode, TaskKind};
use inference_mux::Server;
use tokio_util::sync::CancellationToken;

struct CountingDiceRoller {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolHandler for CountingDiceRoller {
    async fn call(&self, _parameters: serde_json::Value) -> Result<serde_json::Value, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!(4))
    }
}

fn echo_spec(id: &str, dir: &std::path::Path) -> ModelSpec {
    ModelSpec {
        id: ModelId::new(id).unwrap(),
        task: TaskKind::TextCompletion,
        engine: "echo".to_string(),
        source: ModelSource {
            file: Some(dir.join(format!("{id}.weights"))),
            ..Default::default()
        },
        context_size: Some(2048),
        min_instances: 0,
        max_instances: 2,
        ttl: Duration::from_secs(60),
        device: DeviceSpec::default(),
        completion_defaults: HashMap::new(),
        preload: None,
        tools: HashMap::new(),
        grammars: HashMap::new(),
        preparation: PreparationMode::OnDemand,
    }
}

fn dice_request(model: &str) -> ChatCompletionRequest {
    let mut tools = HashMap::new();
    tools.insert(
        "getRandomNumber".to_string(),
        ToolDefinition {
            description: "returns a random integer between min and max".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "min": { "type": "integer" }, "max": { "type": "integer" } },
            }),
        },
    );
    ChatCompletionRequest {
        model: ModelId::new(model).unwrap(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: "ROLL_DICE_TWICE please".to_string(),
            tool_calls: Vec::new(),
            call_id: None,
        }],
        temperature: None,
        top_p: None,
        top_k: None,
        min_p: None,
        max_tokens: None,
        seed: None,
        stop: Vec::new(),
        frequency_penalty: None,
        presence_penalty: None,
        token_bias: HashMap::new(),
        grammar: None,
        tools,
        system_prompt: None,
        template_format: None,
        drop_last_message: false,
    }
}

#[tokio::test]
async fn registered_handler_is_invoked_exactly_twice_then_generation_continues() {
    let dir = tempfile::tempdir().unwrap();
    let spec = echo_spec("dice-1", dir.path());
    tokio::fs::write(spec.source.file.as_ref().unwrap(), b"weights").await.unwrap();

    let mut engines = EngineRegistry::new();
    engines.register("echo", Arc::new(EchoEngine::default()));
    let server = Server::new(vec![spec], dir.path().to_path_buf(), 1, 4, engines).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut handlers: ToolHandlers = HashMap::new();
    handlers.insert(
        "getRandomNumber".to_string(),
        Arc::new(CountingDiceRoller { calls: calls.clone() }),
    );

    let req = dice_request("dice-1");
    let result = server
        .process_chat_completion(req, Some(Duration::from_secs(5)), CancellationToken::new(), Arc::new(handlers))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(result.message.unwrap().content.starts_with("rolled:"));
    assert!(result.tool_calls.is_empty());
}

#[tokio::test]
async fn missing_handler_returns_function_call_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let spec = echo_spec("dice-2", dir.path());
    tokio::fs::write(spec.source.file.as_ref().unwrap(), b"weights").await.unwrap();

    let mut engines = EngineRegistry::new();
    engines.register("echo", Arc::new(EchoEngine::default()));
    let server = Server::new(vec![spec], dir.path().to_path_buf(), 1, 4, engines).await.unwrap();

    let req = dice_request("dice-2");
    let result = server
        .process_chat_completion(req, Some(Duration::from_secs(5)), CancellationToken::new(), Arc::new(ToolHandlers::new()))
        .await
        .unwrap();

    assert_eq!(
        result.finish_reason,
        Some(inference_mux::engine::FinishReason::FunctionCall)
    );
    assert_eq!(result.tool_calls.len(), 2);
    assert!(result.tool_calls.iter().all(|c| c.name == "getRandomNumber"));
}
