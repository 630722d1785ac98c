// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Resumable artifact download with checksum verification.
//!
//! Grounded on the teacher's `ModelDownloader` (models/downloading.rs):
//! same `Semaphore`-bounded concurrency and `DownloadProgress` shape, but
//! wired to a real `reqwest` streamed GET with a `Range` header for resume
//! instead of the teacher's mock byte-stepping loop, and a single retry
//! instead of the teacher's full exponential-backoff policy (§4.B of the
//! design spec calls for "one retry", not an open-ended backoff schedule).

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};

use crate::error::PreparationError;
use crate::model::{ModelId, ModelSource};

#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
}

pub struct Downloader {
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
}

impl Downloader {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Downloads `source.url` to `dest`, resuming a partial file if one is
    /// already present, then verifies `source.sha256`/`source.md5` if set.
    /// Retries the whole transfer once on a network-level failure.
    pub async fn download(
        &self,
        model_id: &ModelId,
        source: &ModelSource,
        dest: &Path,
        progress: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<(), PreparationError> {
        let url = source.url.as_ref().ok_or_else(|| PreparationError::Download {
            model: model_id.clone(),
            message: "no url to download from".to_string(),
        })?;

        let _permit = self.semaphore.acquire().await.map_err(|e| PreparationError::Download {
            model: model_id.clone(),
            message: format!("download semaphore closed: {e}"),
        })?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PreparationError::Download {
                    model: model_id.clone(),
                    message: format!("failed to create {}: {e}", parent.display()),
                })?;
        }

        let mut last_err = None;
        for attempt in 0..2 {
            match self.try_download(url.as_str(), dest, progress.clone()).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    tracing::warn!(model = %model_id, attempt, error = %e, "download attempt failed");
                    last_err = Some(e);
                }
            }
        }
        if let Some(e) = last_err {
            return Err(PreparationError::Download {
                model: model_id.clone(),
                message: e,
            });
        }

        self.verify_checksum(model_id, source, dest).await
    }

    async fn try_download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<(), String> {
        let resume_from = tokio::fs::metadata(dest).await.map(|m| m.len()).unwrap_or(0);

        let mut request = self.client.get(url);
        if resume_from > 0 {
            request = request.header("Range", format!("bytes={resume_from}-"));
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() && status.as_u16() != 416 {
            return Err(format!("unexpected status {status}"));
        }

        let resumed = status.as_u16() == 206;
        let total_bytes = response
            .content_length()
            .map(|len| if resumed { len + resume_from } else { len });

        let mut file = if resumed {
            let mut f = OpenOptions::new()
                .append(true)
                .open(dest)
                .await
                .map_err(|e| e.to_string())?;
            f.seek(std::io::SeekFrom::End(0)).await.map_err(|e| e.to_string())?;
            f
        } else {
            File::create(dest).await.map_err(|e| e.to_string())?
        };

        let mut downloaded = if resumed { resume_from } else { 0 };
        let mut stream = response.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            file.write_all(&chunk).await.map_err(|e| e.to_string())?;
            downloaded += chunk.len() as u64;
            if let Some(tx) = &progress {
                let _ = tx
                    .send(DownloadProgress {
                        bytes_downloaded: downloaded,
                        total_bytes,
                    })
                    .await;
            }
        }
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn verify_checksum(
        &self,
        model_id: &ModelId,
        source: &ModelSource,
        dest: &Path,
    ) -> Result<(), PreparationError> {
        if let Some(expected) = &source.sha256 {
            let actual = sha256_of(dest).await.map_err(|e| PreparationError::Download {
                model: model_id.clone(),
                message: format!("failed to hash downloaded file: {e}"),
            })?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(PreparationError::Checksum {
                    model: model_id.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        } else if let Some(expected) = &source.md5 {
            let actual = md5_of(dest).await.map_err(|e| PreparationError::Download {
                model: model_id.clone(),
                message: format!("failed to hash downloaded file: {e}"),
            })?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(PreparationError::Checksum {
                    model: model_id.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

async fn sha256_of(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

async fn md5_of(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(format!("{:x}", md5::compute(&bytes)))
}
