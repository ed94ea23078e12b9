//! Local persistent key-value store.
//!
//! String keys to string values, the shape of a mobile app's on-device
//! storage. Two implementations:
//!
//! - [`InMemoryLocalStore`] for tests and ephemeral sessions
//! - [`FileLocalStore`], one file per key under a directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use babble_core::{compute_content_hash, BabbleResult, StorageError, ValidationError};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistent string key-value storage.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Read a value. A missing key is `Ok(None)`.
    async fn get_item(&self, key: &str) -> BabbleResult<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set_item(&self, key: &str, value: String) -> BabbleResult<()>;

    /// Remove a value. Removing a missing key succeeds.
    async fn remove_item(&self, key: &str) -> BabbleResult<()>;

    /// Every stored key, sorted.
    async fn get_all_keys(&self) -> BabbleResult<Vec<String>>;

    /// Remove several keys.
    async fn multi_remove(&self, keys: &[String]) -> BabbleResult<()>;
}

fn ensure_key(key: &str) -> BabbleResult<()> {
    if key.is_empty() {
        return Err(ValidationError::EmptyKey.into());
    }
    Ok(())
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Local store backed by a map. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct InMemoryLocalStore {
    items: RwLock<BTreeMap<String, String>>,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn get_item(&self, key: &str) -> BabbleResult<Option<String>> {
        ensure_key(key)?;
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> BabbleResult<()> {
        ensure_key(key)?;
        self.items.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> BabbleResult<()> {
        ensure_key(key)?;
        self.items.write().await.remove(key);
        Ok(())
    }

    async fn get_all_keys(&self) -> BabbleResult<Vec<String>> {
        Ok(self.items.read().await.keys().cloned().collect())
    }

    async fn multi_remove(&self, keys: &[String]) -> BabbleResult<()> {
        let mut items = self.items.write().await;
        for key in keys {
            items.remove(key);
        }
        Ok(())
    }
}

// ============================================================================
// FILE STORE
// ============================================================================

const FILE_EXTENSION: &str = "json";
const KEY_EXTENSION: &str = "key";
const TMP_EXTENSION: &str = "tmp";
/// Longest hex file stem; longer keys are stored under a hash.
const MAX_HEX_STEM: usize = 200;
const HASHED_PREFIX: &str = "sha256-";

/// Local store writing one file per key.
///
/// File names are the hex encoding of the key, so any key (including ones
/// with `/` or `:`) maps to a single flat file. Keys too long for a file
/// name are stored as `sha256-<digest>.json` with the key itself in a
/// `.key` file alongside. Every write goes to a uniquely named temporary
/// file that is renamed into place, so concurrent writers never share one.
#[derive(Debug, Clone)]
pub struct FileLocalStore {
    root: PathBuf,
}

impl FileLocalStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> BabbleResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error(&root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stem_for(key: &str) -> String {
        let encoded = hex::encode(key.as_bytes());
        if encoded.len() <= MAX_HEX_STEM {
            encoded
        } else {
            format!("{HASHED_PREFIX}{}", hex::encode(compute_content_hash(key.as_bytes())))
        }
    }

    fn file(&self, stem: &str, extension: &str) -> PathBuf {
        self.root.join(format!("{stem}.{extension}"))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.file(&Self::stem_for(key), FILE_EXTENSION)
    }

    async fn key_for(&self, path: &Path) -> Option<String> {
        if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        if stem.starts_with(HASHED_PREFIX) {
            return tokio::fs::read_to_string(self.file(stem, KEY_EXTENSION))
                .await
                .ok();
        }
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }

    async fn write_atomic(&self, key: &str, path: &Path, contents: &[u8]) -> BabbleResult<()> {
        let tmp = self
            .root
            .join(format!(".{}.{}", Uuid::now_v7(), TMP_EXTENSION));
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| io_error(key, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(key, e));
        }
        Ok(())
    }
}

async fn remove_if_present(key: &str, path: &Path) -> BabbleResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(key, e)),
    }
}

fn io_error(key: &str, e: std::io::Error) -> babble_core::BabbleError {
    StorageError::Io {
        key: key.to_string(),
        reason: e.to_string(),
    }
    .into()
}

#[async_trait]
impl LocalStore for FileLocalStore {
    async fn get_item(&self, key: &str) -> BabbleResult<Option<String>> {
        ensure_key(key)?;
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(key, e)),
        }
    }

    async fn set_item(&self, key: &str, value: String) -> BabbleResult<()> {
        ensure_key(key)?;
        let stem = Self::stem_for(key);
        if stem.starts_with(HASHED_PREFIX) {
            self.write_atomic(key, &self.file(&stem, KEY_EXTENSION), key.as_bytes())
                .await?;
        }
        let path = self.file(&stem, FILE_EXTENSION);
        self.write_atomic(key, &path, value.as_bytes()).await?;
        tracing::debug!(key, path = %path.display(), "Stored local item");
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> BabbleResult<()> {
        ensure_key(key)?;
        let stem = Self::stem_for(key);
        remove_if_present(key, &self.file(&stem, FILE_EXTENSION)).await?;
        if stem.starts_with(HASHED_PREFIX) {
            remove_if_present(key, &self.file(&stem, KEY_EXTENSION)).await?;
        }
        Ok(())
    }

    async fn get_all_keys(&self) -> BabbleResult<Vec<String>> {
        let root = self.root.display().to_string();
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error(&root, e))?;
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(&root, e))? {
            if let Some(key) = self.key_for(&entry.path()).await {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn multi_remove(&self, keys: &[String]) -> BabbleResult<()> {
        for key in keys {
            self.remove_item(key).await?;
        }
        Ok(())
    }
}
