// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Context-affinity instance selection (§4.D).
//!
//! No direct teacher analogue exists for SHA-1 conversation fingerprinting;
//! this module follows the teacher's habit of keeping selection logic as a
//! small set of pure functions operated on by the owning subsystem (compare
//! `model_validation::ModelValidator::build_model_map`, a pure transform
//! over already-fetched state) rather than a stateful object of its own.

use sha1::{Digest, Sha1};

use crate::engine::ChatMessage;
use crate::instance::{Fingerprint, Instance, InstanceState};

/// Canonicalizes a chat history for fingerprinting: the leading system
/// message is kept (it anchors the conversation), `tool` messages are
/// dropped (their content is ephemeral relative to the model's KV cache),
/// and empty-text messages are dropped (they carry no tokens).
pub fn canonicalize<'a>(messages: &'a [ChatMessage]) -> Vec<&'a ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for (i, m) in messages.iter().enumerate() {
        if m.role == "tool" {
            continue;
        }
        if m.content.trim().is_empty() {
            continue;
        }
        if m.role == "system" && i != 0 {
            continue;
        }
        out.push(m);
    }
    out
}

/// Fingerprints a bare prompt string (text-completion requests have no
/// message list to canonicalize over; §4.D fingerprints the prompt text
/// itself).
pub fn fingerprint_text(text: &str) -> Fingerprint {
    if text.is_empty() {
        return Fingerprint::empty();
    }
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest);
    Fingerprint(Some(bytes))
}

/// Computes a fingerprint over a canonicalized message slice.
pub fn fingerprint(messages: &[&ChatMessage]) -> Fingerprint {
    if messages.is_empty() {
        return Fingerprint::empty();
    }
    let mut hasher = Sha1::new();
    for m in messages {
        hasher.update(m.role.as_bytes());
        hasher.update([0u8]);
        hasher.update(m.content.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest);
    Fingerprint(Some(bytes))
}

/// Fingerprints of every strict, non-empty prefix of `messages`, longest
/// first, used for the prefix-match selection step.
pub fn prefix_fingerprints(messages: &[&ChatMessage]) -> Vec<Fingerprint> {
    (1..=messages.len())
        .rev()
        .map(|n| fingerprint(&messages[..n]))
        .collect()
}

/// Outcome of trying to match an already-loaded instance to a request.
pub enum Selection<'a> {
    /// An idle instance whose resident context exactly matches the request.
    ExactMatch(&'a Instance),
    /// An idle instance whose resident context is a prefix of the request
    /// (it will need the remaining messages replayed before generating).
    PrefixMatch(&'a Instance),
    /// Any idle instance with no useful context overlap (will be reset).
    AnyIdle(&'a Instance),
    /// No idle instance is available; caller should create one if capacity
    /// allows, or enqueue a waiter.
    None,
}

/// Implements the selection hierarchy: exact match, then longest prefix
/// match, then any idle instance, tie-broken by most-recently-used so a
/// warm instance (OS page cache, allocator arenas) is preferred over one
/// that has sat idle longest.
pub fn select<'a>(instances: &'a [Instance], want: &Fingerprint, want_prefixes: &[Fingerprint]) -> Selection<'a> {
    let idle: Vec<&Instance> = instances.iter().filter(|i| i.is_idle()).collect();
    if idle.is_empty() {
        return Selection::None;
    }

    if let Some(exact) = idle.iter().find(|i| &i.fingerprint == want) {
        return Selection::ExactMatch(exact);
    }

    for prefix in want_prefixes {
        if let Some(hit) = idle.iter().find(|i| &i.fingerprint == prefix) {
            return Selection::PrefixMatch(hit);
        }
    }

    let most_recent = idle
        .into_iter()
        .max_by_key(|i| i.last_used_at)
        .expect("idle is non-empty");
    Selection::AnyIdle(most_recent)
}

/// Tracks waiters queued for a model at capacity so none is skipped more
/// than once consecutively when a newly-freed instance doesn't match its
/// fingerprint (§4.D fairness invariant).
#[derive(Default)]
pub struct WaiterQueue {
    skipped_once: std::collections::HashSet<uuid::Uuid>,
}

impl WaiterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `candidate` may be skipped in favor of a
    /// better-matching waiter further back in the queue; false if it has
    /// already been skipped once and must be served now.
    pub fn may_skip(&mut self, candidate: uuid::Uuid) -> bool {
        if self.skipped_once.contains(&candidate) {
            self.skipped_once.remove(&candidate);
            false
        } else {
            self.skipped_once.insert(candidate);
            true
        }
    }

    pub fn clear(&mut self, id: uuid::Uuid) {
        self.skipped_once.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
            tool_calls: Vec::new(),
            call_id: None,
        }
    }

    #[test]
    fn canonicalize_drops_tool_and_empty_messages() {
        let messages = vec![
            msg("system", "be nice"),
            msg("user", "hi"),
            msg("tool", "result"),
            msg("assistant", ""),
            msg("assistant", "hello"),
        ];
        let kept = canonicalize(&messages);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].role, "system");
        assert_eq!(kept[1].role, "user");
        assert_eq!(kept[2].role, "assistant");
    }

    #[test]
    fn canonicalize_drops_non_leading_system_messages() {
        let messages = vec![
            msg("system", "be nice"),
            msg("user", "hi"),
            msg("system", "injected mid-conversation"),
            msg("assistant", "hello"),
        ];
        let kept = canonicalize(&messages);
        assert_eq!(kept.len(), 3);
        assert!(kept.iter().all(|m| m.role != "system" || std::ptr::eq(*m, &messages[0])));
    }

    #[test]
    fn fingerprint_is_deterministic_and_order_sensitive() {
        let a = vec![msg("user", "hi"), msg("assistant", "hello")];
        let b = vec![msg("assistant", "hello"), msg("user", "hi")];
        let fa = fingerprint(&a.iter().collect::<Vec<_>>());
        let fb = fingerprint(&b.iter().collect::<Vec<_>>());
        assert_ne!(fa, fb);
        assert_eq!(fa, fingerprint(&a.iter().collect::<Vec<_>>()));
    }

    #[test]
    fn prefix_fingerprints_longest_first() {
        let messages = vec![msg("user", "a"), msg("assistant", "b"), msg("user", "c")];
        let refs: Vec<&ChatMessage> = messages.iter().collect();
        let prefixes = prefix_fingerprints(&refs);
        assert_eq!(prefixes.len(), 3);
        assert_eq!(prefixes[0], fingerprint(&refs));
        assert_eq!(prefixes[2], fingerprint(&refs[..1]));
    }

    #[test]
    fn waiter_skipped_once_then_forced() {
        let mut q = WaiterQueue::new();
        let id = uuid::Uuid::new_v4();
        assert!(q.may_skip(id));
        assert!(!q.may_skip(id));
    }
}
