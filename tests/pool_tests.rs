// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Instance pool integration tests: acquire/release, capacity bounds, and
//! context-affinity reuse, driven through `EchoEngine` rather than a real
//! GGUF model.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use inference_mux::engine::echo::EchoEngine;
use inference_mux::engine::{ChatCompletionRequest, ChatMessage, EngineRegistry, ToolHandlers};
use inference_mux::instance::Fingerprint;
use inference_mux::model::{DeviceSpec, ModelId, ModelSource, ModelSpec, PreparationMode, TaskKind};
use inference_mux::scheduler;
use inference_mux::{Pool, Store};
use tokio_util::sync::CancellationToken;

fn user(content: &str) -> ChatMessage {
    ChatMessage {
        role: "user".to_string(),
        content: content.to_string(),
        tool_calls: Vec::new(),
        call_id: None,
    }
}

fn chat_req(model: &ModelId, messages: Vec<ChatMessage>) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.clone(),
        messages,
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

fn echo_spec_with_file(id: &str, max_instances: usize, dir: &std::path::Path) -> ModelSpec {
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
        max_instances,
        ttl: Duration::from_secs(60),
        device: DeviceSpec::default(),
        completion_defaults: HashMap::new(),
        preload: None,
        tools: HashMap::new(),
        grammars: HashMap::new(),
        preparation: PreparationMode::OnDemand,
    }
}

async fn build_pool(specs: Vec<ModelSpec>, dir: &std::path::Path, max_concurrency: usize) -> Arc<Pool> {
    for spec in &specs {
        if let Some(file) = &spec.source.file {
            tokio::fs::write(file, b"weights").await.unwrap();
        }
    }
    let store = Arc::new(Store::new(specs, PathBuf::from(dir), 1).unwrap());
    let mut engines = EngineRegistry::new();
    engines.register("echo", Arc::new(EchoEngine::default()));
    Pool::new(store, Arc::new(engines), max_concurrency)
}

#[tokio::test]
async fn acquire_and_release_returns_instance_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let spec = echo_spec_with_file("m1", 1, dir.path());
    let pool = build_pool(vec![spec.clone()], dir.path(), 4).await;

    let cancel = CancellationToken::new();
    let lease = pool.acquire(&spec.id, &Fingerprint::empty(), &[], &cancel).await.unwrap();
    assert_eq!(pool.instance_count(&spec.id).await, 1);
    lease.release(Fingerprint::empty()).await;
    assert_eq!(pool.instance_count(&spec.id).await, 1);
}

#[tokio::test]
async fn max_instances_bounds_concurrent_loads() {
    let dir = tempfile::tempdir().unwrap();
    let spec = echo_spec_with_file("m2", 2, dir.path());
    let pool = build_pool(vec![spec.clone()], dir.path(), 8).await;

    let cancel = CancellationToken::new();
    let lease1 = pool.acquire(&spec.id, &Fingerprint::empty(), &[], &cancel).await.unwrap();
    let lease2 = pool.acquire(&spec.id, &Fingerprint::empty(), &[], &cancel).await.unwrap();
    assert_eq!(pool.instance_count(&spec.id).await, 2);

    // A third acquire has no idle instance and no remaining capacity; it
    // must wait until one of the two leases above is released.
    let pool_for_waiter = pool.clone();
    let id_for_waiter = spec.id.clone();
    let waiter = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        pool_for_waiter.acquire(&id_for_waiter, &Fingerprint::empty(), &[], &cancel).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    lease1.release(Fingerprint::empty()).await;
    let lease3 = waiter.await.unwrap().unwrap();
    assert_eq!(pool.instance_count(&spec.id).await, 2);

    lease2.release(Fingerprint::empty()).await;
    lease3.release(Fingerprint::empty()).await;
}

#[tokio::test]
async fn matching_fingerprint_reuses_same_instance() {
    let dir = tempfile::tempdir().unwrap();
    let spec = echo_spec_with_file("m3", 2, dir.path());
    let pool = build_pool(vec![spec.clone()], dir.path(), 8).await;

    let messages = vec![ChatMessage {
        role: "user".to_string(),
        content: "hello".to_string(),
        tool_calls: Vec::new(),
        call_id: None,
    }];
    let canonical = scheduler::canonicalize(&messages);
    let fp = scheduler::fingerprint(&canonical);

    let cancel = CancellationToken::new();
    let lease1 = pool.acquire(&spec.id, &fp, &[], &cancel).await.unwrap();
    let uid1 = lease1.uid();
    lease1.release(fp).await;

    let lease2 = pool.acquire(&spec.id, &fp, &[], &cancel).await.unwrap();
    assert_eq!(lease2.uid(), uid1);
    assert_eq!(pool.instance_count(&spec.id).await, 1);
    lease2.release(fp).await;
}

#[tokio::test]
async fn affinity_match_jumps_ahead_of_earlier_waiter() {
    let dir = tempfile::tempdir().unwrap();
    let spec = echo_spec_with_file("m4", 1, dir.path());
    let pool = build_pool(vec![spec.clone()], dir.path(), 8).await;

    let messages_a = vec![ChatMessage {
        role: "user".to_string(),
        content: "a".to_string(),
        tool_calls: Vec::new(),
        call_id: None,
    }];
    let messages_b = vec![ChatMessage {
        role: "user".to_string(),
        content: "b".to_string(),
        tool_calls: Vec::new(),
        call_id: None,
    }];
    let fp_a = scheduler::fingerprint(&scheduler::canonicalize(&messages_a));
    let fp_b = scheduler::fingerprint(&scheduler::canonicalize(&messages_b));

    let cancel = CancellationToken::new();
    let lease = pool.acquire(&spec.id, &Fingerprint::empty(), &[], &cancel).await.unwrap();

    // Two callers queue up behind the single instance, A first then B, each
    // wanting a different fingerprint.
    let pool_a = pool.clone();
    let id_a = spec.id.clone();
    let waiter_a = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        pool_a.acquire(&id_a, &fp_a, &[], &cancel).await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let pool_b = pool.clone();
    let id_b = spec.id.clone();
    let waiter_b = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        pool_b.acquire(&id_b, &fp_b, &[], &cancel).await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(!waiter_a.is_finished());
    assert!(!waiter_b.is_finished());

    // The release carries B's fingerprint, so B jumps ahead of A even
    // though A queued first.
    lease.release(fp_b).await;
    let lease_b = waiter_b.await.unwrap().unwrap();
    assert!(!waiter_a.is_finished());

    // Releasing back with A's fingerprint now serves A, who was skipped
    // only once.
    lease_b.release(fp_a).await;
    let lease_a = waiter_a.await.unwrap().unwrap();
    lease_a.release(Fingerprint::empty()).await;
}

/// Mirrors spec scenario S2: two independent conversations get two distinct
/// instances, and a follow-up turn on one of them is served by the same
/// instance it started on (testable property 5, §8).
#[tokio::test]
async fn sequential_conversation_turns_stick_to_one_instance() {
    let dir = tempfile::tempdir().unwrap();
    let spec = echo_spec_with_file("m5", 2, dir.path());
    let pool = build_pool(vec![spec.clone()], dir.path(), 8).await;
    let cancel = CancellationToken::new();

    let a1 = chat_req(&spec.id, vec![user("Write a haiku about bears")]);
    let result_a1 = pool
        .run_chat_completion(a1, cancel.clone(), None, Arc::new(ToolHandlers::new()))
        .await
        .unwrap();

    let b1 = chat_req(&spec.id, vec![user("Write a haiku about pancakes")]);
    let result_b1 = pool
        .run_chat_completion(b1, cancel.clone(), None, Arc::new(ToolHandlers::new()))
        .await
        .unwrap();

    assert_eq!(pool.instance_count(&spec.id).await, 2);
    let after_first_round = pool.instance_fingerprints(&spec.id).await;
    assert_eq!(after_first_round.len(), 2);
    // Both instances now hold a non-empty, distinct fingerprint (the request
    // plus its echoed assistant reply), never an empty one, since both turns
    // completed successfully.
    assert_ne!(after_first_round[0].1, Fingerprint::empty());
    assert_ne!(after_first_round[1].1, Fingerprint::empty());
    assert_ne!(after_first_round[0].1, after_first_round[1].1);

    // A2 continues conversation A: prior user message, the assistant reply
    // just produced, and a new follow-up. Its dropLast-fingerprint (i.e. the
    // fingerprint of everything but the new trailing message) must exactly
    // match the fingerprint instance A now holds, so the scheduler picks it
    // back up instead of scaling to a third instance.
    let mut a2_messages = vec![user("Write a haiku about bears")];
    a2_messages.push(result_a1.message.clone().unwrap());
    a2_messages.push(user("Give it a 6-word title"));
    let a2 = chat_req(&spec.id, a2_messages);
    let result_a2 = pool
        .run_chat_completion(a2, cancel.clone(), None, Arc::new(ToolHandlers::new()))
        .await
        .unwrap();

    // No third instance was created: A2 reused one of the two existing ones.
    assert_eq!(pool.instance_count(&spec.id).await, 2);
    assert!(result_a2.message.unwrap().content.contains("Give it a 6-word title"));
    let _ = result_b1;
}

/// Mirrors spec scenario S3: with `maxInstances = 1`, a second, unrelated
/// conversation cannot inherit the first conversation's cached context --
/// the instance's fingerprint after A1 reflects only A1, never a
/// concatenation with whatever comes next (testable property 6, §8).
#[tokio::test]
async fn single_instance_fingerprint_does_not_leak_across_conversations() {
    let dir = tempfile::tempdir().unwrap();
    let spec = echo_spec_with_file("m6", 1, dir.path());
    let pool = build_pool(vec![spec.clone()], dir.path(), 8).await;
    let cancel = CancellationToken::new();

    let a1 = chat_req(
        &spec.id,
        vec![user("Remember: platypuses have venomous spurs. Reply OK.")],
    );
    pool.run_chat_completion(a1.clone(), cancel.clone(), None, Arc::new(ToolHandlers::new()))
        .await
        .unwrap();

    let expected_fp = scheduler::fingerprint(&scheduler::canonicalize(&[
        a1.messages[0].clone(),
        ChatMessage {
            role: "assistant".to_string(),
            content: a1.messages[0].content.clone(),
            tool_calls: Vec::new(),
            call_id: None,
        },
    ]));
    let after_a1 = pool.instance_fingerprints(&spec.id).await;
    assert_eq!(after_a1.len(), 1);
    assert_eq!(after_a1[0].1, expected_fp);

    let b1 = chat_req(&spec.id, vec![user("Remind me of one animal fact?")]);
    pool.run_chat_completion(b1.clone(), cancel.clone(), None, Arc::new(ToolHandlers::new()))
        .await
        .unwrap();

    // The single instance's fingerprint now reflects only B1, not a
    // concatenation of A1 and B1.
    let after_b1 = pool.instance_fingerprints(&spec.id).await;
    assert_eq!(after_b1.len(), 1);
    assert_ne!(after_b1[0].1, after_a1[0].1);
    assert_ne!(after_b1[0].1, expected_fp);
}
