use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use deaddrop_shared::constants::{MAX_UPLOAD_CHUNKS, UPLOAD_TTL_SECS};
use deaddrop_shared::protocol::FileDescriptor;
use deaddrop_shared::types::{PairingCode, UploadId};

use crate::error::ServerError;
use crate::storage::FileStore;

struct UploadState {
    code: PairingCode,
    file_name: String,
    total_size: u64,
    chunk_count: u32,
    mime_type: String,
    received: HashSet<u32>,
    chunk_dir: PathBuf,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    /// Set once `complete` starts; chunks arriving after that are refused.
    completing: bool,
}

impl UploadState {
    fn chunk_path(&self, index: u32) -> PathBuf {
        self.chunk_dir.join(format!("chunk_{index}"))
    }

    fn progress(&self) -> UploadProgress {
        let received = self.received.len() as u32;
        UploadProgress {
            total_chunks: self.chunk_count,
            received_chunks: received,
            progress: received as f64 * 100.0 / self.chunk_count as f64,
            missing_chunks: (0..self.chunk_count)
                .filter(|i| !self.received.contains(i))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub total_chunks: u32,
    pub received_chunks: u32,
    /// Percentage, 0..=100.
    pub progress: f64,
    pub missing_chunks: Vec<u32>,
}

/// A finished upload: the descriptor for the client plus the session the
/// bytes must be accounted against.
#[derive(Debug)]
pub struct FinishedUpload {
    pub code: PairingCode,
    pub file: FileDescriptor,
}

/// Chunked upload state machine: `init` → `put_chunk`* → `complete`, with
/// explicit `cancel` and a TTL sweep for abandoned uploads. Chunks for one
/// upload may arrive concurrently; the per-upload mutex covers only state
/// transitions, never chunk I/O.
pub struct UploadEngine {
    uploads: Mutex<HashMap<UploadId, Arc<Mutex<UploadState>>>>,
    store: Arc<FileStore>,
}

impl UploadEngine {
    pub fn new(store: Arc<FileStore>) -> Self {
        Self {
            uploads: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub async fn init(
        &self,
        code: PairingCode,
        file_name: String,
        total_size: u64,
        chunk_count: u32,
        mime_type: String,
    ) -> Result<UploadId, ServerError> {
        if chunk_count == 0 || chunk_count > MAX_UPLOAD_CHUNKS {
            return Err(ServerError::BadRequest(format!(
                "totalChunks must be between 1 and {MAX_UPLOAD_CHUNKS}"
            )));
        }

        let id = UploadId::new();
        let chunk_dir = self.store.allocate_chunk_dir(&code, &id).await?;

        let state = UploadState {
            code: code.clone(),
            file_name,
            total_size,
            chunk_count,
            mime_type,
            received: HashSet::new(),
            chunk_dir,
            created_at: Utc::now(),
            last_activity: Utc::now(),
            completing: false,
        };
        self.uploads
            .lock()
            .await
            .insert(id, Arc::new(Mutex::new(state)));

        info!(upload = %id, code = %code, chunks = chunk_count, size = total_size, "Upload initialized");
        Ok(id)
    }

    async fn get(&self, id: UploadId) -> Result<Arc<Mutex<UploadState>>, ServerError> {
        self.uploads
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(ServerError::UploadNotFound(id))
    }

    async fn remove(&self, id: UploadId) -> Option<Arc<Mutex<UploadState>>> {
        self.uploads.lock().await.remove(&id)
    }

    /// Store one chunk. Idempotent: a chunk index that already landed is
    /// acknowledged without rewriting, with the same progress response.
    pub async fn put_chunk(
        &self,
        id: UploadId,
        index: u32,
        data: &[u8],
    ) -> Result<UploadProgress, ServerError> {
        let upload = self.get(id).await?;

        let chunk_path = {
            let mut state = upload.lock().await;
            if state.completing {
                return Err(ServerError::BadRequest(
                    "Upload is already finalizing".to_string(),
                ));
            }
            if index >= state.chunk_count {
                return Err(ServerError::InvalidChunkIndex {
                    index,
                    total: state.chunk_count,
                });
            }
            state.last_activity = Utc::now();
            if state.received.contains(&index) {
                return Ok(state.progress());
            }
            state.chunk_path(index)
        };

        // Write outside the lock so parallel chunks don't serialize on it.
        // Staged under a unique name and renamed into place, so a racing
        // duplicate sender can never expose a half-written chunk.
        let staging = chunk_path.with_extension(format!("part-{}", Uuid::new_v4()));
        fs::write(&staging, data)
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to write chunk {index}: {e}")))?;
        if let Err(e) = fs::rename(&staging, &chunk_path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(ServerError::Storage(format!(
                "Failed to place chunk {index}: {e}"
            )));
        }

        // The upload may have been cancelled or swept while we wrote.
        let upload = self.get(id).await?;
        let mut state = upload.lock().await;
        if state.completing {
            return Err(ServerError::BadRequest(
                "Upload is already finalizing".to_string(),
            ));
        }
        state.received.insert(index);
        state.last_activity = Utc::now();
        debug!(upload = %id, chunk = index, bytes = data.len(), "Chunk stored");
        Ok(state.progress())
    }

    /// Assemble the chunks, in index order, into the session's file area.
    /// The declared size must match what lands on disk; any failure rolls
    /// back both the partial destination and the chunk staging area.
    pub async fn complete(&self, id: UploadId) -> Result<FinishedUpload, ServerError> {
        let upload = self.get(id).await?;

        let (code, file_name, total_size, chunk_count, mime_type, chunk_dir) = {
            let mut state = upload.lock().await;
            if state.completing {
                return Err(ServerError::BadRequest(
                    "Upload is already finalizing".to_string(),
                ));
            }
            let received = state.received.len() as u32;
            if received != state.chunk_count {
                return Err(ServerError::UploadIncomplete {
                    received,
                    total: state.chunk_count,
                });
            }
            state.completing = true;
            (
                state.code.clone(),
                state.file_name.clone(),
                state.total_size,
                state.chunk_count,
                state.mime_type.clone(),
                state.chunk_dir.clone(),
            )
        };

        // The files/ directory may be missing if the pre-create failed.
        self.store.create_session_tree(&code).await?;
        let dest = self.store.allocate_file_path(&code, &file_name);

        let assembled = assemble(&chunk_dir, chunk_count, &dest.path).await;
        let actual = match assembled {
            Ok(actual) => actual,
            Err(e) => {
                self.discard(id, &chunk_dir, Some(&dest.path)).await;
                return Err(e);
            }
        };

        if actual != total_size {
            self.discard(id, &chunk_dir, Some(&dest.path)).await;
            return Err(ServerError::SizeMismatch {
                expected: total_size,
                actual,
            });
        }

        self.discard(id, &chunk_dir, None).await;
        info!(upload = %id, code = %code, file = %dest.stored_name, size = total_size, "Upload assembled");

        Ok(FinishedUpload {
            code,
            file: FileDescriptor {
                name: file_name,
                size: total_size,
                mime_type,
                download_url: dest.download_url,
            },
        })
    }

    /// Best-effort teardown of an in-flight upload.
    pub async fn cancel(&self, id: UploadId) {
        if let Some(upload) = self.remove(id).await {
            let chunk_dir = upload.lock().await.chunk_dir.clone();
            if let Err(e) = fs::remove_dir_all(&chunk_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(upload = %id, error = %e, "Failed to remove cancelled chunk dir");
                }
            }
            info!(upload = %id, "Upload cancelled");
        }
    }

    pub async fn progress(&self, id: UploadId) -> Result<UploadProgress, ServerError> {
        let upload = self.get(id).await?;
        let state = upload.lock().await;
        Ok(state.progress())
    }

    /// Drop uploads whose last chunk is older than the TTL. Per-item
    /// failures are logged and skipped.
    pub async fn sweep_once(&self) {
        let cutoff = Utc::now() - Duration::seconds(UPLOAD_TTL_SECS as i64);

        let stale: Vec<(UploadId, i64)> = {
            let uploads = self.uploads.lock().await;
            let mut stale = Vec::new();
            for (id, upload) in uploads.iter() {
                let state = upload.lock().await;
                if state.last_activity < cutoff && !state.completing {
                    let age_secs = (Utc::now() - state.created_at).num_seconds();
                    stale.push((*id, age_secs));
                }
            }
            stale
        };

        for (id, age_secs) in stale {
            info!(upload = %id, age_secs, "Sweeping expired upload");
            self.cancel(id).await;
        }
    }

    /// Remove registry state, the chunk staging dir, and optionally a
    /// partial destination file.
    async fn discard(&self, id: UploadId, chunk_dir: &Path, partial: Option<&Path>) {
        self.remove(id).await;
        if let Err(e) = fs::remove_dir_all(chunk_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(upload = %id, error = %e, "Failed to remove chunk dir");
            }
        }
        if let Some(path) = partial {
            if let Err(e) = fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(upload = %id, error = %e, "Failed to remove partial file");
                }
            }
        }
    }
}

async fn assemble(chunk_dir: &Path, chunk_count: u32, dest: &Path) -> Result<u64, ServerError> {
    let mut out = fs::File::create(dest)
        .await
        .map_err(|e| ServerError::Storage(format!("Failed to create '{}': {}", dest.display(), e)))?;

    for index in 0..chunk_count {
        let chunk_path = chunk_dir.join(format!("chunk_{index}"));
        let mut chunk = fs::File::open(&chunk_path).await.map_err(|e| {
            ServerError::Storage(format!("Failed to open chunk {index} for assembly: {e}"))
        })?;
        tokio::io::copy(&mut chunk, &mut out)
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to append chunk {index}: {e}")))?;
    }

    out.sync_all()
        .await
        .map_err(|e| ServerError::Storage(format!("Failed to sync assembled file: {e}")))?;

    let meta = fs::metadata(dest)
        .await
        .map_err(|e| ServerError::Storage(format!("Failed to stat assembled file: {e}")))?;
    Ok(meta.len())
}
