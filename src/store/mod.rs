// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! The Model Store (§4.B): resolves declared `ModelSpec`s to local files,
//! downloading and verifying them on demand, with at most one preparation
//! in flight per model.
//!
//! Grounded on the teacher's `ModelDownloader` for the download/verify
//! mechanics (see `store::download`) and on `api::pool::ConnectionPool`'s
//! `Arc<RwLock<...>>`-guarded shared state for the in-flight dedup pattern.

pub mod artifact;
pub mod download;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};

use crate::error::CoreError;
use crate::model::{ModelId, ModelSpec, PreparationMode};
use download::{DownloadProgress, Downloader};

#[derive(Debug, Clone)]
pub enum PreparationEvent {
    Started { model: ModelId },
    Progress { model: ModelId, progress: DownloadProgress },
    Ready { model: ModelId, path: PathBuf },
    Failed { model: ModelId, message: String },
}

enum PreparationState {
    Ready(PathBuf),
    InFlight,
    Failed(String),
}

/// Holds the declarative model registry and mediates preparation
/// (download + checksum verification) of each model's local artifact.
pub struct Store {
    specs: HashMap<ModelId, ModelSpec>,
    models_path: PathBuf,
    downloader: Downloader,
    state: RwLock<HashMap<ModelId, PreparationState>>,
    // One lock per model id, acquired for the duration of a preparation, so
    // concurrent callers for the same model wait instead of racing two
    // downloads to the same destination file.
    locks: Mutex<HashMap<ModelId, Arc<Mutex<()>>>>,
    events: broadcast::Sender<PreparationEvent>,
}

impl Store {
    pub fn new(specs: Vec<ModelSpec>, models_path: PathBuf, download_concurrency: usize) -> Result<Self, CoreError> {
        let mut map = HashMap::new();
        for spec in specs {
            spec.validate()?;
            map.insert(spec.id.clone(), spec);
        }
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            specs: map,
            models_path,
            downloader: Downloader::new(download_concurrency.max(1)),
            state: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn spec(&self, id: &ModelId) -> Result<&ModelSpec, CoreError> {
        self.specs.get(id).ok_or_else(|| CoreError::UnknownModel(id.clone()))
    }

    pub fn specs(&self) -> impl Iterator<Item = &ModelSpec> {
        self.specs.values()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreparationEvent> {
        self.events.subscribe()
    }

    /// Models whose `effectivePreparationMode` is `blocking` or `async`,
    /// used at startup to kick off eager preparation.
    pub fn eager_models(&self) -> Vec<ModelId> {
        self.specs
            .values()
            .filter(|s| s.effective_preparation_mode() != PreparationMode::OnDemand)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Ensures the model's artifact is present locally, downloading it if
    /// necessary. Safe to call concurrently for the same model: only the
    /// first caller performs the download, the rest wait on its result.
    pub async fn prepare(&self, id: &ModelId) -> Result<PathBuf, CoreError> {
        let spec = self.spec(id)?;
        if spec.engine == "composite" {
            return Ok(PathBuf::new());
        }

        let per_model_lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _guard = per_model_lock.lock().await;

        if let Some(PreparationState::Ready(path)) = self.state.read().await.get(id) {
            return Ok(path.clone());
        }

        let path = artifact::resolve_path(id, &spec.source, &self.models_path)?;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            if spec.source.sha256.is_none() && spec.source.md5.is_none() {
                self.state.write().await.insert(id.clone(), PreparationState::Ready(path.clone()));
                return Ok(path);
            }
            // A checksum is declared: verify the file already on disk before
            // touching the network at all (spec §4.B step 1).
            match self.downloader.verify_checksum(id, &spec.source, &path).await {
                Ok(()) => {
                    self.state.write().await.insert(id.clone(), PreparationState::Ready(path.clone()));
                    return Ok(path);
                }
                Err(e) if spec.source.url.is_none() => {
                    self.state.write().await.insert(id.clone(), PreparationState::Failed(e.to_string()));
                    let _ = self.events.send(PreparationEvent::Failed {
                        model: id.clone(),
                        message: e.to_string(),
                    });
                    return Err(CoreError::Preparation(e));
                }
                Err(_) => {
                    // Mismatch but a url exists: fall through to re-download.
                }
            }
        }

        self.state.write().await.insert(id.clone(), PreparationState::InFlight);
        let _ = self.events.send(PreparationEvent::Started { model: id.clone() });

        if spec.source.url.is_some() {
            let (tx, mut rx) = tokio::sync::mpsc::channel(16);
            let events = self.events.clone();
            let model_for_progress = id.clone();
            let progress_task = tokio::spawn(async move {
                while let Some(p) = rx.recv().await {
                    let _ = events.send(PreparationEvent::Progress {
                        model: model_for_progress.clone(),
                        progress: p,
                    });
                }
            });

            let result = self.downloader.download(id, &spec.source, &path, Some(tx)).await;
            let _ = progress_task.await;

            if let Err(e) = result {
                self.state.write().await.insert(id.clone(), PreparationState::Failed(e.to_string()));
                let _ = self.events.send(PreparationEvent::Failed {
                    model: id.clone(),
                    message: e.to_string(),
                });
                return Err(CoreError::Preparation(e));
            }
        } else if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let message = format!("no url configured and local file {} is missing", path.display());
            self.state.write().await.insert(id.clone(), PreparationState::Failed(message.clone()));
            let _ = self.events.send(PreparationEvent::Failed { model: id.clone(), message: message.clone() });
            return Err(CoreError::Validation(message));
        }

        self.state.write().await.insert(id.clone(), PreparationState::Ready(path.clone()));
        let _ = self.events.send(PreparationEvent::Ready { model: id.clone(), path: path.clone() });
        Ok(path)
    }
}
