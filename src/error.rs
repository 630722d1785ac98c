// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Crate-wide error kinds (§7 of the design spec).
//!
//! Mirrors the teacher's layered `thiserror` enums (`ApiError`,
//! `DownloadError`, `ModelValidationError`): one enum per concern, converted
//! into an HTTP status only at the façade boundary.

use thiserror::Error;

use crate::model::ModelId;

#[derive(Error, Debug, Clone)]
pub enum PreparationError {
    #[error("checksum mismatch for model {model}: expected {expected}, got {actual}")]
    Checksum {
        model: ModelId,
        expected: String,
        actual: String,
    },
    #[error("download failed for model {model}: {message}")]
    Download { model: ModelId, message: String },
}

#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown model: {0}")]
    UnknownModel(ModelId),

    #[error("preparation failed: {0}")]
    Preparation(#[from] PreparationError),

    #[error("load failed for model {model}: {message}")]
    Load { model: ModelId, message: String },

    #[error("engine runtime error for model {model}: {message}")]
    EngineRuntime { model: ModelId, message: String },

    #[error("engine does not support task: {0:?}")]
    UnsupportedTask(crate::model::TaskKind),

    #[error("server is shutting down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// HTTP status code for this error, used only at the HTTP façade.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Validation(_) | CoreError::UnknownModel(_) => 400,
            CoreError::Preparation(_) | CoreError::Load { .. } => 503,
            CoreError::EngineRuntime { .. } | CoreError::Internal(_) => 500,
            CoreError::UnsupportedTask(_) => 400,
            CoreError::Shutdown => 503,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "invalid_request",
            CoreError::UnknownModel(_) => "invalid_model",
            CoreError::Preparation(_) => "preparation_error",
            CoreError::Load { .. } => "load_error",
            CoreError::EngineRuntime { .. } => "engine_error",
            CoreError::UnsupportedTask(_) => "unsupported_task",
            CoreError::Shutdown => "shutdown",
            CoreError::Internal(_) => "internal_error",
        }
    }
}
