use std::collections::HashSet;
use std::path::PathBuf;

use chrono::Utc;
use tokio::fs;
use tracing::{debug, info, warn};

use deaddrop_shared::types::{PairingCode, UploadId};

use crate::error::ServerError;

/// Owns the on-disk namespace under a single root directory. Every session
/// occupies a disjoint subtree:
///
/// ```text
/// <root>/<code>/files/<timestamp>-<sanitized-name>
/// <root>/<code>/chunks/<upload-id>/chunk_<index>
/// ```
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    base_url: String,
}

/// Reserved destination for an incoming file. The file itself is not
/// created until the caller writes it.
#[derive(Debug, Clone)]
pub struct AllocatedFile {
    pub path: PathBuf,
    pub stored_name: String,
    pub download_url: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionUsage {
    pub bytes: u64,
    pub file_count: u64,
}

impl FileStore {
    pub async fn new(root: PathBuf, base_url: String) -> Result<Self, ServerError> {
        fs::create_dir_all(&root).await.map_err(|e| {
            ServerError::Storage(format!(
                "Failed to create storage root '{}': {}",
                root.display(),
                e
            ))
        })?;

        info!(path = %root.display(), "File store initialized");

        Ok(Self {
            root,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn session_dir(&self, code: &PairingCode) -> PathBuf {
        self.root.join(code.as_str())
    }

    fn files_dir(&self, code: &PairingCode) -> PathBuf {
        self.session_dir(code).join("files")
    }

    fn chunks_dir(&self, code: &PairingCode) -> PathBuf {
        self.session_dir(code).join("chunks")
    }

    /// Create the session's directory tree. Idempotent.
    pub async fn create_session_tree(&self, code: &PairingCode) -> Result<(), ServerError> {
        for dir in [self.files_dir(code), self.chunks_dir(code)] {
            fs::create_dir_all(&dir).await.map_err(|e| {
                ServerError::Storage(format!("Failed to create '{}': {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Remove the session's entire subtree. A missing tree is not an error.
    pub async fn delete_session_tree(&self, code: &PairingCode) -> Result<(), ServerError> {
        let dir = self.session_dir(code);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(code = %code, "Session tree deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::Storage(format!(
                "Failed to delete '{}': {}",
                dir.display(),
                e
            ))),
        }
    }

    /// Reserve a destination for an incoming file. The original name is
    /// untrusted; it is reduced to a safe basename and prefixed with a
    /// millisecond timestamp to avoid collisions within the session.
    pub fn allocate_file_path(&self, code: &PairingCode, original_name: &str) -> AllocatedFile {
        let stored_name = format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            sanitize_file_name(original_name)
        );
        let path = self.files_dir(code).join(&stored_name);
        let download_url = format!("{}/downloads/{}/{}", self.base_url, code, stored_name);
        AllocatedFile {
            path,
            stored_name,
            download_url,
        }
    }

    /// Create and return the chunk directory for one upload.
    pub async fn allocate_chunk_dir(
        &self,
        code: &PairingCode,
        upload_id: &UploadId,
    ) -> Result<PathBuf, ServerError> {
        let dir = self.chunks_dir(code).join(upload_id.to_string());
        fs::create_dir_all(&dir).await.map_err(|e| {
            ServerError::Storage(format!("Failed to create '{}': {}", dir.display(), e))
        })?;
        Ok(dir)
    }

    /// Scan the session subtree: total bytes on disk plus the number of
    /// completed files. Chunk staging areas count toward bytes, not files.
    pub async fn session_usage(&self, code: &PairingCode) -> Result<SessionUsage, ServerError> {
        let files_dir = self.files_dir(code);
        let mut usage = SessionUsage::default();

        let mut pending = vec![self.session_dir(code)];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(ServerError::Storage(format!(
                        "Failed to scan '{}': {}",
                        dir.display(),
                        e
                    )))
                }
            };

            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                ServerError::Storage(format!("Failed to read entry in '{}': {}", dir.display(), e))
            })? {
                let meta = entry.metadata().await.map_err(|e| {
                    ServerError::Storage(format!(
                        "Failed to stat '{}': {}",
                        entry.path().display(),
                        e
                    ))
                })?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else {
                    usage.bytes += meta.len();
                    if entry.path().parent() == Some(files_dir.as_path()) {
                        usage.file_count += 1;
                    }
                }
            }
        }

        Ok(usage)
    }

    /// Delete every child directory of the root that is not a live session.
    /// Per-item failures are logged and skipped. Returns how many orphans
    /// were removed.
    pub async fn sweep_orphans(&self, live_codes: &HashSet<String>) -> usize {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Orphan sweep could not read storage root");
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Orphan sweep could not advance directory listing");
                    break;
                }
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            if live_codes.contains(&name) {
                continue;
            }
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }

            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    info!(dir = %name, "Removed orphaned session directory");
                    removed += 1;
                }
                Err(e) => {
                    warn!(dir = %name, error = %e, "Failed to remove orphaned directory");
                }
            }
        }
        removed
    }

    /// Open a stored file for serving. The stored name is untrusted input:
    /// traversal characters are rejected outright and the resolved path is
    /// canonicalized and re-checked against the session's files directory.
    pub async fn open_file(
        &self,
        code: &PairingCode,
        stored_name: &str,
    ) -> Result<(fs::File, u64), ServerError> {
        validate_path_component(stored_name)?;

        let files_dir = self.files_dir(code);
        let candidate = files_dir.join(stored_name);

        let canonical_dir = fs::canonicalize(&files_dir).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServerError::FileNotFound(stored_name.to_string())
            } else {
                ServerError::Storage(format!("Failed to resolve '{}': {}", files_dir.display(), e))
            }
        })?;
        let canonical = fs::canonicalize(&candidate).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServerError::FileNotFound(stored_name.to_string())
            } else {
                ServerError::Storage(format!("Failed to resolve '{}': {}", candidate.display(), e))
            }
        })?;

        if !canonical.starts_with(&canonical_dir) {
            return Err(ServerError::InvalidPath(stored_name.to_string()));
        }

        let file = fs::File::open(&canonical).await.map_err(|e| {
            ServerError::Storage(format!("Failed to open '{}': {}", canonical.display(), e))
        })?;
        let len = file
            .metadata()
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to stat download: {e}")))?
            .len();

        Ok((file, len))
    }
}

/// Reject path components that could escape the session namespace.
pub fn validate_path_component(name: &str) -> Result<(), ServerError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(ServerError::InvalidPath(name.to_string()));
    }
    Ok(())
}

/// Reduce an untrusted client-supplied name to a safe basename: drop any
/// directory part, then map everything outside `[A-Za-z0-9._-]` to `_`.
pub fn sanitize_file_name(original: &str) -> String {
    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original)
        .trim();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.replace("..", "_");

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "file".to_string()
    } else {
        cleaned
    }
}
