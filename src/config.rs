// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Server configuration (§4.G, ambient stack): a TOML file describing the
//! model registry plus a handful of server-wide knobs, with environment
//! variable overrides for the knobs the teacher's `main.rs` also reads from
//! the environment (port, models path).

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::CoreError;
use crate::model::ModelSpec;

fn default_models_path() -> PathBuf {
    dirs_models_path()
}

fn dirs_models_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
        .join("inference-mux")
        .join("models")
}

fn default_concurrency() -> usize {
    1
}

fn default_download_concurrency() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub models: HashMap<String, ModelSpecFile>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_models_path")]
    pub models_path: PathBuf,
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// `ModelSpec` as it appears under `[models.<id>]` in the TOML file: the id
/// itself comes from the table key, not a field, so this is the same shape
/// minus `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSpecFile {
    pub task: crate::model::TaskKind,
    pub engine: String,
    #[serde(default)]
    pub source: crate::model::ModelSource,
    pub context_size: Option<u32>,
    #[serde(default)]
    pub min_instances: usize,
    #[serde(default = "one")]
    pub max_instances: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub device: crate::model::DeviceSpec,
    #[serde(default)]
    pub completion_defaults: HashMap<String, serde_json::Value>,
    pub preload: Option<crate::model::PreloadSpec>,
    #[serde(default)]
    pub tools: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub grammars: HashMap<String, String>,
    #[serde(default)]
    pub preparation: crate::model::PreparationMode,
}

fn one() -> usize {
    1
}

fn default_ttl_secs() -> u64 {
    300
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            models: HashMap::new(),
            concurrency: default_concurrency(),
            models_path: default_models_path(),
            download_concurrency: default_download_concurrency(),
            log_level: default_log_level(),
            listen_addr: default_listen_addr(),
        }
    }
}

impl Configuration {
    pub fn from_toml_str(text: &str) -> Result<Self, CoreError> {
        toml::from_str(text).map_err(|e| CoreError::Validation(format!("invalid configuration: {e}")))
    }

    pub async fn load(path: &std::path::Path) -> Result<Self, CoreError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CoreError::Validation(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Applies the `INFERENCE_MUX_LISTEN_ADDR`/`INFERENCE_MUX_MODELS_PATH`
    /// overrides, mirroring the teacher's env-var precedence for
    /// `API_PORT`/`MODEL_PATH` in `main.rs`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("INFERENCE_MUX_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(path) = std::env::var("INFERENCE_MUX_MODELS_PATH") {
            self.models_path = PathBuf::from(path);
        }
    }

    pub fn model_specs(&self) -> Result<Vec<ModelSpec>, CoreError> {
        self.models
            .iter()
            .map(|(id, file)| {
                Ok(ModelSpec {
                    id: crate::model::ModelId::new(id.clone())?,
                    task: file.task,
                    engine: file.engine.clone(),
                    source: file.source.clone(),
                    context_size: file.context_size,
                    min_instances: file.min_instances,
                    max_instances: file.max_instances,
                    ttl: std::time::Duration::from_secs(file.ttl_secs),
                    device: file.device.clone(),
                    completion_defaults: file.completion_defaults.clone(),
                    preload: file.preload.clone(),
                    tools: file.tools.clone(),
                    grammars: file.grammars.clone(),
                    preparation: file.preparation,
                })
            })
            .collect()
    }
}

/// Initializes the global `tracing` subscriber from `RUST_LOG`, falling
/// back to `log_level`. Mirrors the teacher's `tracing_subscriber::fmt::init()`
/// call in `main.rs`, generalized to respect a configured default level.
pub fn init_logging(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
