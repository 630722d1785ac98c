// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Resolves a `ModelSource` into a local file path, without touching the
//! network. Grounded on the teacher's `ModelDownloader::generate_local_path`
//! (models/downloading.rs), generalized from the teacher's single
//! HuggingFace-only layout into the four-step resolution order this crate's
//! sources support: explicit absolute file, explicit relative file, a
//! Hugging Face Hub URL, or an arbitrary HTTP(S) URL.

use std::path::{Path, PathBuf};

use url::Url;

use crate::error::CoreError;
use crate::model::{ModelId, ModelSource};

/// Resolves where a model's artifact lives (or should be downloaded to) on
/// disk, relative to the configured `models_path`.
pub fn resolve_path(model_id: &ModelId, source: &ModelSource, models_path: &Path) -> Result<PathBuf, CoreError> {
    if let Some(file) = &source.file {
        if file.is_absolute() {
            return Ok(file.clone());
        }
        return Ok(models_path.join(file));
    }

    let url = source.url.as_ref().ok_or_else(|| {
        CoreError::Validation(format!(
            "model '{model_id}': source has neither file nor url"
        ))
    })?;

    if let Some(path) = hub_blob_path(url, models_path) {
        return Ok(path);
    }

    Ok(generic_http_path(url, models_path))
}

/// `https://huggingface.co/<org>/<repo>/resolve/<branch>/<filename>` is
/// rewritten to `<modelsPath>/huggingface/<org>/<repo>-<branch>/<filename>`,
/// mirroring the teacher's `hf_hub_id`-keyed cache layout but flattened to a
/// plain path (no xet/hub cache metadata, since this crate owns its own
/// cache directory rather than delegating to `hf-hub`'s).
fn hub_blob_path(url: &Url, models_path: &Path) -> Option<PathBuf> {
    let host = url.host_str()?;
    if host != "huggingface.co" {
        return None;
    }
    let segments: Vec<&str> = url.path_segments()?.collect();
    // [org, repo, "resolve", branch, ...filename_parts]
    if segments.len() < 5 || segments[2] != "resolve" {
        return None;
    }
    let org = segments[0];
    let repo = segments[1];
    let branch = segments[3];
    let filename = segments[4..].join("/");
    Some(
        models_path
            .join("huggingface")
            .join(format!("{org}/{repo}-{branch}"))
            .join(filename),
    )
}

/// Any other URL lands at `<modelsPath>/<hostname>/<filename>`, where
/// filename is the last path segment (or a hash of the full URL if the path
/// has none, e.g. a bare query-string download endpoint).
fn generic_http_path(url: &Url, models_path: &Path) -> PathBuf {
    let host = url.host_str().unwrap_or("unknown-host");
    let filename = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:x}", md5::compute(url.as_str())));
    models_path.join(host).join(filename)
}
