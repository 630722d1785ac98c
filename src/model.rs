// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Declarative model registry types (the "Model Store" data model).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CoreError;

/// Validated model identifier. Must match `[A-Za-z0-9_:\-.]+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelId(String);

impl ModelId {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if raw.is_empty() || !id_pattern().is_match(&raw) {
            return Err(CoreError::Validation(format!(
                "invalid model id '{raw}': must match [A-Za-z0-9_:\\-.]+"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ModelId {
    type Error = CoreError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        ModelId::new(value)
    }
}

impl From<ModelId> for String {
    fn from(value: ModelId) -> Self {
        value.0
    }
}

fn id_pattern() -> &'static Regex {
    // Compiled once per call site is fine here; registration is not hot path.
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_:\-.]+$").expect("static pattern"))
}

/// The kind of inference task a model serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    TextCompletion,
    Embedding,
    ImageToText,
    SpeechToText,
}

/// Where the GPU should be used, per-model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuPreference {
    #[default]
    Auto,
    Always,
    Never,
}

impl GpuPreference {
    pub fn wants_gpu(self) -> bool {
        matches!(self, GpuPreference::Auto | GpuPreference::Always)
    }
}

/// `ModelSpec.device`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSpec {
    #[serde(default)]
    pub gpu: GpuPreference,
    pub cpu_threads: Option<usize>,
    #[serde(default)]
    pub mem_lock: bool,
}

/// `ModelSpec.source`. At least one of `url`/`file` is required unless the
/// engine is the built-in "composite" engine, which needs neither.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSource {
    pub url: Option<Url>,
    pub file: Option<PathBuf>,
    pub sha256: Option<String>,
    pub md5: Option<String>,
}

/// When Store preparation happens relative to server startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreparationMode {
    #[default]
    OnDemand,
    Blocking,
    Async,
}

/// Optional conversation/tooling material to pre-ingest right after load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreloadSpec {
    #[serde(default)]
    pub messages: Vec<crate::engine::ChatMessage>,
    pub tool_documentation: Option<String>,
}

/// The declarative, immutable-after-startup description of one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: ModelId,
    pub task: TaskKind,
    pub engine: String,
    #[serde(default)]
    pub source: ModelSource,
    pub context_size: Option<u32>,
    #[serde(default)]
    pub min_instances: usize,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default = "default_ttl", with = "humantime_seconds")]
    pub ttl: Duration,
    #[serde(default)]
    pub device: DeviceSpec,
    #[serde(default)]
    pub completion_defaults: HashMap<String, serde_json::Value>,
    pub preload: Option<PreloadSpec>,
    #[serde(default)]
    pub tools: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub grammars: HashMap<String, String>,
    #[serde(default)]
    pub preparation: PreparationMode,
}

fn default_max_instances() -> usize {
    1
}

fn default_ttl() -> Duration {
    Duration::from_secs(300)
}

mod humantime_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

impl ModelSpec {
    /// Effective preparation mode: `minInstances > 0` forces `blocking`.
    pub fn effective_preparation_mode(&self) -> PreparationMode {
        if self.min_instances > 0 {
            PreparationMode::Blocking
        } else {
            self.preparation
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let is_composite = self.engine == "composite";
        if !is_composite && self.source.url.is_none() && self.source.file.is_none() {
            return Err(CoreError::Validation(format!(
                "model '{}': source must declare url or file unless engine is 'composite'",
                self.id
            )));
        }
        if self.max_instances == 0 {
            return Err(CoreError::Validation(format!(
                "model '{}': maxInstances must be at least 1",
                self.id
            )));
        }
        if self.min_instances > self.max_instances {
            return Err(CoreError::Validation(format!(
                "model '{}': minInstances ({}) exceeds maxInstances ({})",
                self.id, self.min_instances, self.max_instances
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_ids() {
        assert!(ModelId::new("good-id_1.2:3").is_ok());
        assert!(ModelId::new("bad id with spaces").is_err());
        assert!(ModelId::new("").is_err());
    }

    #[test]
    fn min_instances_forces_blocking() {
        let mut spec = sample_spec();
        spec.min_instances = 1;
        spec.preparation = PreparationMode::OnDemand;
        assert_eq!(spec.effective_preparation_mode(), PreparationMode::Blocking);
    }

    #[test]
    fn validate_requires_source_unless_composite() {
        let mut spec = sample_spec();
        spec.source = ModelSource::default();
        assert!(spec.validate().is_err());
        spec.engine = "composite".to_string();
        assert!(spec.validate().is_ok());
    }

    fn sample_spec() -> ModelSpec {
        ModelSpec {
            id: ModelId::new("m1").unwrap(),
            task: TaskKind::TextCompletion,
            engine: "llama-cpp".to_string(),
            source: ModelSource {
                file: Some(PathBuf::from("model.gguf")),
                ..Default::default()
            },
            context_size: Some(4096),
            min_instances: 0,
            max_instances: 1,
            ttl: Duration::from_secs(300),
            device: DeviceSpec::default(),
            completion_defaults: HashMap::new(),
            preload: None,
            tools: HashMap::new(),
            grammars: HashMap::new(),
            preparation: PreparationMode::OnDemand,
        }
    }
}
