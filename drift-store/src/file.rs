//! Filesystem storage backend
//!
//! One JSON document per key under a root directory. Writes go through a
//! temp file followed by a rename so a crash mid-write never leaves a
//! half-written document behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};

use crate::errors::{Result, StoreError};
use crate::StorageAdapter;

/// Durable store backed by one JSON file per key.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a file store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        debug!("File store opened at {:?}", root);
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("empty key".to_string()));
        }
        Ok(self.root.join(format!("{}.json", encode_key(key))))
    }
}

#[async_trait]
impl StorageAdapter for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec_pretty(&value)?;

        // Atomic write: temp file in the same directory, then rename.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;

        debug!("Wrote {} bytes for key {}", bytes.len(), key);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<()> {
        for key in self.keys().await? {
            self.remove(&key).await?;
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(encoded) = name.strip_suffix(".json") else {
                continue;
            };
            match decode_key(encoded) {
                Some(key) => keys.push(key),
                None => warn!("Skipping undecodable store file: {}", name),
            }
        }
        Ok(keys)
    }
}

/// Encode a key into a filesystem-safe filename. Alphanumerics plus
/// `.`, `_` and `-` pass through, everything else becomes `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut chars = encoded.bytes();
    while let Some(b) = chars.next() {
        if b == b'%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).ok()
}
