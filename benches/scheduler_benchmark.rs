// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Benchmarks the context-affinity scheduler's hot path: canonicalizing a
//! conversation, fingerprinting it, and selecting an instance out of a pool
//! of candidates. Grounded on the teacher's own `benches/embed_benchmark.rs`
//! (criterion, one `bench_function` per code path under test).

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use inference_mux::engine::ChatMessage;
use inference_mux::instance::{Fingerprint, Instance, InstanceState};
use inference_mux::model::ModelId;
use inference_mux::scheduler::{canonicalize, fingerprint, prefix_fingerprints, select};

fn sample_messages(turns: usize) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage {
        role: "system".to_string(),
        content: "you are a helpful assistant".to_string(),
        tool_calls: Vec::new(),
        call_id: None,
    }];
    for i in 0..turns {
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: format!("question number {i} about something reasonably long to type"),
            tool_calls: Vec::new(),
            call_id: None,
        });
        messages.push(ChatMessage {
            role: "assistant".to_string(),
            content: format!("answer number {i}, also reasonably long, to approximate real traffic"),
            tool_calls: Vec::new(),
            call_id: None,
        });
    }
    messages
}

fn sample_instances(count: usize) -> Vec<Instance> {
    (0..count)
        .map(|_| {
            let mut inst = Instance::new_loading(ModelId::new("bench-model").unwrap(), false);
            inst.state = InstanceState::Idle;
            inst.fingerprint = Fingerprint::empty();
            inst
        })
        .collect()
}

fn bench_canonicalize(c: &mut Criterion) {
    let messages = sample_messages(20);
    c.bench_function("canonicalize_40_messages", |b| {
        b.iter(|| canonicalize(black_box(&messages)))
    });
}

fn bench_fingerprint(c: &mut Criterion) {
    let messages = sample_messages(20);
    let canonical = canonicalize(&messages);
    c.bench_function("fingerprint_40_messages", |b| {
        b.iter(|| fingerprint(black_box(&canonical)))
    });
}

fn bench_prefix_fingerprints(c: &mut Criterion) {
    let messages = sample_messages(20);
    let canonical = canonicalize(&messages);
    c.bench_function("prefix_fingerprints_40_messages", |b| {
        b.iter(|| prefix_fingerprints(black_box(&canonical)))
    });
}

fn bench_select(c: &mut Criterion) {
    let instances = sample_instances(16);
    let want = Fingerprint::empty();
    let prefixes = vec![Fingerprint::empty()];
    c.bench_function("select_among_16_idle_instances", |b| {
        b.iter(|| {
            let _ = select(black_box(&instances), black_box(&want), black_box(&prefixes));
        })
    });
}

criterion_group!(benches, bench_canonicalize, bench_fingerprint, bench_prefix_fingerprints, bench_select);
criterion_main!(benches);
