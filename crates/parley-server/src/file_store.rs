//! On-disk storage for avatars, banners and other user files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;

/// A file written by a [`FileStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Generated name the bytes are stored under.
    pub name: String,
    pub size: usize,
}

/// Store bytes under a generated name and read them back.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Store `data` under a fresh name starting with `prefix`.
    async fn store(
        &self,
        data: &[u8],
        prefix: &str,
        extension: Option<&str>,
    ) -> Result<StoredFile, ServerError>;

    async fn load(&self, name: &str) -> Result<Vec<u8>, ServerError>;

    fn max_size(&self) -> usize;
}

/// Verify that a resolved path stays within the expected base directory.
/// Prevents path traversal attacks.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {} // RootDir, CurDir, Prefix
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// File names are generated by us; anything else is rejected before it
/// reaches the filesystem.
pub fn is_valid_file_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Keep a short alphanumeric extension from a peer-reported file name.
pub fn extension_of(name: &str) -> Option<&str> {
    let (_, ext) = name.rsplit_once('.')?;
    (!ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .then_some(ext)
}

#[derive(Debug, Clone)]
pub struct DiskFileStore {
    base_path: PathBuf,
    max_size: usize,
}

impl DiskFileStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::Internal(format!(
                "Failed to create file directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "File store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    fn safe_path(&self, name: &str) -> Result<PathBuf, ServerError> {
        if !is_valid_file_name(name) {
            return Err(ServerError::BadRequest("Invalid file name".to_string()));
        }
        ensure_within(&self.base_path, &self.base_path.join(name))
    }
}

#[async_trait]
impl FileStorage for DiskFileStore {
    async fn store(
        &self,
        data: &[u8],
        prefix: &str,
        extension: Option<&str>,
    ) -> Result<StoredFile, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty file".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::BadRequest(format!(
                "File too large: {} bytes (max {})",
                data.len(),
                self.max_size
            )));
        }

        let mut name = format!("{prefix}{}", Uuid::new_v4().simple());
        if let Some(ext) = extension {
            name.push('.');
            name.push_str(ext);
        }
        let path = self.safe_path(&name)?;

        fs::write(&path, data)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to write file {name}: {e}")))?;

        debug!(name = %name, size = data.len(), "Stored file");
        Ok(StoredFile {
            name,
            size: data.len(),
        })
    }

    async fn load(&self, name: &str) -> Result<Vec<u8>, ServerError> {
        let path = self.safe_path(name)?;

        if !path.exists() {
            return Err(ServerError::NotFound(format!("File {name}")));
        }

        let data = fs::read(&path)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to read file {name}: {e}")))?;

        debug!(name = %name, size = data.len(), "Loaded file");
        Ok(data)
    }

    fn max_size(&self) -> usize {
        self.max_size
    }
}
