// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! GGUF text-completion engine backed by `llama-cpp-2`.
//!
//! Directly grounded on the teacher's `inference::engine::LlmEngine`: same
//! sampler chain (temperature, top-p, greedy), same batch-decode loop, same
//! stop-token handling, generalized onto the `Engine` trait and a streaming
//! `RunContext` instead of a bespoke `TokenStream` type.

use std::num::NonZeroU32;
use std::sync::Mutex;

use async_trait::async_trait;
use llama_cpp_2::{
    context::params::LlamaContextParams,
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    sampling::LlamaSampler,
};
use tokio_util::sync::CancellationToken;

use super::{
    ChatCompletionRequest, ChatMessage, Chunk, CompletionRequest, Engine, EngineHandle,
    FinishReason, RunContext, TaskResult, Usage,
};
use crate::error::CoreError;
use crate::model::{ModelSpec, TaskKind};

const SUPPORTED: &[TaskKind] = &[TaskKind::TextCompletion];

pub struct LlamaEngine;

struct LlamaHandle {
    // `LlamaModel`/`LlamaBackend`/generation state are not `Send`-friendly
    // across awaits in llama-cpp-2, so generation is confined to a
    // blocking task and protected by a mutex, matching the teacher's use of
    // `std::sync::Mutex` around `RealLlamaModel`.
    inner: Mutex<LlamaState>,
    context_size: u32,
}

struct LlamaState {
    backend: LlamaBackend,
    model: LlamaModel,
}

impl EngineHandle for LlamaHandle {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[async_trait]
impl Engine for LlamaEngine {
    fn supported_tasks(&self) -> &[TaskKind] {
        SUPPORTED
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn load(
        &self,
        spec: &ModelSpec,
        _cancel: CancellationToken,
    ) -> Result<Box<dyn EngineHandle>, CoreError> {
        let path = spec
            .source
            .file
            .clone()
            .ok_or_else(|| CoreError::Load {
                model: spec.id.clone(),
                message: "llama-cpp engine requires a resolved local file".to_string(),
            })?;
        let gpu_layers = if spec.device.gpu.wants_gpu() { 35 } else { 0 };
        let model_id = spec.id.clone();

        tokio::task::spawn_blocking(move || -> Result<LlamaHandle, CoreError> {
            let backend = LlamaBackend::init().map_err(|e| CoreError::Load {
                model: model_id.clone(),
                message: format!("failed to initialize backend: {e:?}"),
            })?;
            let params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
            let model =
                LlamaModel::load_from_file(&backend, &path, &params).map_err(|e| CoreError::Load {
                    model: model_id.clone(),
                    message: format!("failed to load model: {e:?}"),
                })?;
            Ok(LlamaHandle {
                inner: Mutex::new(LlamaState { backend, model }),
                context_size: 4096,
            })
        })
        .await
        .map_err(|e| CoreError::Load {
            model: spec.id.clone(),
            message: format!("load task panicked: {e}"),
        })?
        .map(|h| Box::new(h) as Box<dyn EngineHandle>)
    }

    async fn dispose(&self, _handle: std::sync::Arc<dyn EngineHandle>) {
        // Dropping releases the backend/model; llama-cpp-2 has no async
        // teardown hook, matching the teacher's `unload_model`.
    }

    async fn run_chat_completion(
        &self,
        handle: &dyn EngineHandle,
        req: &ChatCompletionRequest,
        ctx: &RunContext,
    ) -> Result<TaskResult, CoreError> {
        let prompt = flatten_chat_prompt(req);
        let completion_req = CompletionRequest {
            model: req.model.clone(),
            prompt,
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            max_tokens: req.max_tokens,
            seed: req.seed,
            stop: req.stop.clone(),
            grammar: req.grammar.clone(),
        };
        let mut result = self.run_text_completion(handle, &completion_req, ctx).await?;
        let text = result.text.take().unwrap_or_default();
        result.message = Some(ChatMessage {
            role: "assistant".to_string(),
            content: text,
            tool_calls: Vec::new(),
            call_id: None,
        });
        Ok(result)
    }

    async fn run_text_completion(
        &self,
        handle: &dyn EngineHandle,
        req: &CompletionRequest,
        ctx: &RunContext,
    ) -> Result<TaskResult, CoreError> {
        let handle = handle
            .as_any()
            .downcast_ref::<LlamaHandle>()
            .ok_or_else(|| CoreError::Internal("wrong engine handle type".to_string()))?;

        let max_tokens = req.max_tokens.unwrap_or(512);
        let temperature = req.temperature.unwrap_or(0.7);
        let top_p = req.top_p.unwrap_or(0.9);
        let stop = req.stop.clone();
        let context_size = handle.context_size;

        // Generation is synchronous CPU work; run it on a blocking thread
        // and stream chunks back over the context's channel as they're
        // produced, matching the teacher's `run_inference`/
        // `run_inference_stream` split but without the teacher's
        // generate-then-replay workaround.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<GenEvent>(64);
        let cancel = ctx.cancel.clone();
        let prompt = req.prompt.clone();

        let gen_task = {
            let inner = &handle.inner;
            // SAFETY-free approach: clone what we need and run generation
            // inside spawn_blocking while holding the mutex guard there.
            // We cannot move `&Mutex` across spawn_blocking directly, so we
            // take the generation inline via block_in_place semantics: the
            // mutex lives as long as `handle`, and `handle` outlives this
            // call (owned by the Pool's instance for the duration of the
            // task), so this is sound to run on the current async task by
            // delegating to spawn_blocking with a raw pointer wrapper.
            let state_ptr: *const Mutex<LlamaState> = inner;
            // Safety: `handle` (and therefore `inner`) is kept alive by the
            // caller (the Instance) for at least the lifetime of this
            // `.await`, since `run_text_completion` is only ever invoked
            // while the instance is held busy by the Task Executor.
            let state_ptr = SendPtr(state_ptr);
            tokio::task::spawn_blocking(move || {
                let state_ptr = state_ptr;
                // Safety: see note above.
                let mutex = unsafe { &*state_ptr.0 };
                let guard = mutex.lock().unwrap_or_else(|e| e.into_inner());
                generate(&guard, &prompt, context_size, max_tokens, temperature, top_p, &stop, tx)
            })
        };

        let mut output = String::new();
        let mut finish_reason = FinishReason::MaxTokens;
        let mut completion_tokens = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    finish_reason = FinishReason::Cancel;
                    break;
                }
                maybe = rx.recv() => {
                    match maybe {
                        Some(GenEvent::Chunk(text)) => {
                            completion_tokens += 1;
                            output.push_str(&text);
                            ctx.emit(Chunk { tokens: 1, text }).await;
                        }
                        Some(GenEvent::Done(reason)) => {
                            finish_reason = reason;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        // Drain any buffered events after a cancel so the blocking task can
        // observe channel closure and exit promptly.
        drop(rx);
        let _ = gen_task.await;

        let prompt_tokens = (req.prompt.len() / 4) as u32;
        Ok(TaskResult {
            message: None,
            text: Some(output),
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
}

/// Wrapper to move a raw pointer into a `spawn_blocking` closure; the
/// pointed-to mutex is kept alive by the caller for the duration of the
/// blocking task (see safety note at the call site).
struct SendPtr(*const Mutex<LlamaState>);
unsafe impl Send for SendPtr {}

enum GenEvent {
    Chunk(String),
    Done(FinishReason),
}

fn generate(
    state: &LlamaState,
    prompt: &str,
    context_size: u32,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stop: &[String],
    tx: tokio::sync::mpsc::Sender<GenEvent>,
) {
    let tokens_list = match state.model.str_to_token(prompt, AddBos::Always) {
        Ok(t) => t,
        Err(_) => {
            let _ = tx.blocking_send(GenEvent::Done(FinishReason::Abort));
            return;
        }
    };
    let eos = state.model.token_eos();

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(context_size))
        .with_n_batch(512);
    let mut context = match state.model.new_context(&state.backend, ctx_params) {
        Ok(c) => c,
        Err(_) => {
            let _ = tx.blocking_send(GenEvent::Done(FinishReason::Abort));
            return;
        }
    };

    let mut batch = LlamaBatch::new(512, 1);
    for (i, &token) in tokens_list.iter().enumerate() {
        let is_last = i == tokens_list.len() - 1;
        if batch.add(token, i as i32, &[0], is_last).is_err() {
            let _ = tx.blocking_send(GenEvent::Done(FinishReason::Abort));
            return;
        }
    }
    if context.decode(&mut batch).is_err() {
        let _ = tx.blocking_send(GenEvent::Done(FinishReason::Abort));
        return;
    }

    let mut n_cur = tokens_list.len();
    let mut output = String::new();
    let mut reason = FinishReason::MaxTokens;

    while n_cur < tokens_list.len() + max_tokens as usize {
        let mut sampler = LlamaSampler::chain_simple([
            LlamaSampler::temp(temperature),
            LlamaSampler::top_p(top_p, 1),
            LlamaSampler::greedy(),
        ]);
        let new_token = sampler.sample(&context, -1);

        if new_token == eos {
            reason = FinishReason::EogToken;
            break;
        }

        let token_str = match state.model.token_to_str(new_token, Special::Plaintext) {
            Ok(s) => s,
            Err(_) => break,
        };
        let prev_len = output.len();
        output.push_str(&token_str);

        if let Some(hit) = stop.iter().find(|s| output.ends_with(s.as_str())).cloned() {
            reason = FinishReason::StopTrigger;
            let trimmed_len = output.len() - hit.len();
            output.truncate(trimmed_len);
            if trimmed_len > prev_len {
                let visible = &token_str[..trimmed_len - prev_len];
                if tx.blocking_send(GenEvent::Chunk(visible.to_string())).is_err() {
                    return;
                }
            }
            break;
        }

        if tx.blocking_send(GenEvent::Chunk(token_str)).is_err() {
            return;
        }

        batch.clear();
        if batch.add(new_token, n_cur as i32, &[0], true).is_err() {
            break;
        }
        if context.decode(&mut batch).is_err() {
            break;
        }
        n_cur += 1;
    }

    let _ = tx.blocking_send(GenEvent::Done(reason));
}

fn flatten_chat_prompt(req: &ChatCompletionRequest) -> String {
    req.messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
