// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! End-to-end `Server` tests: chat completion, streaming, embeddings, and
//! cancellation, exercised through the full Store → Pool → TaskExecutor
//! stack with `EchoEngine` standing in for `llama-cpp-2`.

use std::collections::HashMap;
use std::time::Duration;

use inference_mux::engine::{ChatCompletionRequest, ChatMessage, EmbeddingInputValue, EmbeddingRequest, EngineRegistry, ToolHandlers};
use inference_mux::engine::echo::EchoEngine;
use inference_mux::model::{DeviceSpec, ModelId, ModelSource, ModelSpec, PreparationMode, TaskKind};
use inference_mux::Server;
use tokio_util::sync::CancellationToken;

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

async fn build_server(dir: &std::path::Path) -> std::sync::Arc<Server> {
    let spec = echo_spec("echo-1", dir);
    tokio::fs::write(spec.source.file.as_ref().unwrap(), b"weights").await.unwrap();
    let mut engines = EngineRegistry::new();
    engines.register("echo", std::sync::Arc::new(EchoEngine::default()));
    Server::new(vec![spec], dir.to_path_buf(), 1, 4, engines).await.unwrap()
}

fn user_message(content: &str) -> ChatMessage {
    ChatMessage {
        role: "user".to_string(),
        content: content.to_string(),
        tool_calls: Vec::new(),
        call_id: None,
    }
}

fn chat_request(model: &str, content: &str) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: ModelId::new(model).unwrap(),
        messages: vec![user_message(content)],
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
        tools: HashMap::new(),
        system_prompt: None,
        template_format: None,
        drop_last_message: false,
    }
}

#[tokio::test]
async fn chat_completion_echoes_last_message() {
    let dir = tempfile::tempdir().unwrap();
    let server = build_server(dir.path()).await;

    let req = chat_request("echo-1", "hello world");
    let result = server
        .process_chat_completion(req, Some(Duration::from_secs(5)), CancellationToken::new(), std::sync::Arc::new(ToolHandlers::new()))
        .await
        .unwrap();

    assert_eq!(result.message.unwrap().content, "hello world");
}

#[tokio::test]
async fn streaming_chat_completion_forwards_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let server = build_server(dir.path()).await;

    let req = chat_request("echo-1", "one two three");
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let result = server
        .process_chat_completion_streaming(req, Some(Duration::from_secs(5)), CancellationToken::new(), tx, std::sync::Arc::new(ToolHandlers::new()))
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk.text);
    }
    assert_eq!(chunks.len(), 3);
    assert_eq!(result.message.unwrap().content, "one two three");
}

#[tokio::test]
async fn cancelling_mid_stream_yields_cancel_finish_reason() {
    let dir = tempfile::tempdir().unwrap();
    let spec = echo_spec("echo-slow", dir.path());
    tokio::fs::write(spec.source.file.as_ref().unwrap(), b"weights").await.unwrap();

    let mut engines = EngineRegistry::new();
    engines.register(
        "echo",
        std::sync::Arc::new(inference_mux::engine::echo::EchoEngine { chunk_delay: Duration::from_millis(50) }),
    );
    let server = Server::new(vec![spec], dir.path().to_path_buf(), 1, 4, engines).await.unwrap();

    let req = chat_request("echo-slow", "one two three four five");
    let cancel = CancellationToken::new();
    let cancel_for_task = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(75)).await;
        cancel_for_task.cancel();
    });

    let result = server
        .process_chat_completion(req, None, cancel, std::sync::Arc::new(ToolHandlers::new()))
        .await
        .unwrap();
    assert_eq!(result.finish_reason, Some(inference_mux::engine::FinishReason::Cancel));
}

#[tokio::test]
async fn embedding_request_returns_fixed_dimension_vector() {
    let dir = tempfile::tempdir().unwrap();
    let server = build_server(dir.path()).await;

    let req = EmbeddingRequest {
        model: ModelId::new("echo-1").unwrap(),
        input: EmbeddingInputValue::Single("hello".to_string()),
    };
    let result = server.process_embedding(req, CancellationToken::new()).await.unwrap();
    assert_eq!(result.embedding.unwrap().len(), 8);
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let server = build_server(dir.path()).await;

    let req = chat_request("does-not-exist", "hi");
    let err = server
        .process_chat_completion(req, Some(Duration::from_secs(5)), CancellationToken::new(), std::sync::Arc::new(ToolHandlers::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, inference_mux::CoreError::UnknownModel(_)));
}
