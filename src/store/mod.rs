//! # Content Store
//!
//! Content-addressed storage for step results and artifacts. Objects are
//! immutable byte sequences identified by `sha256:<hex>` and laid out on disk
//! as `<root>/<first-2-hex>/<remaining-62-hex>`.
//!
//! Writes are idempotent: writing bytes that already exist is a no-op, which
//! makes concurrent writers safe without locking.

use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::{EngineError, Result};

/// Serializes a JSON value with object keys in sorted order.
///
/// This is the canonical form hashed for content ids and cache keys; two
/// structurally equal values always produce identical bytes. (`serde_json`
/// maps are ordered, so a plain serialization is already canonical.)
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes raw bytes, returning the content hash id (`sha256:<hex>`).
    ///
    /// If the object already exists the bytes are not rewritten.
    pub fn write(&self, content: &[u8]) -> Result<String> {
        let hex = sha256_hex(content);
        let hash_id = format!("sha256:{hex}");

        let subdir = self.root.join(&hex[..2]);
        std::fs::create_dir_all(&subdir)?;

        let path = subdir.join(&hex[2..]);
        if !path.exists() {
            std::fs::write(&path, content)?;
            debug!(content_hash = %hash_id, path = %path.display(), "store.write.new_object");
        } else {
            debug!(content_hash = %hash_id, "store.write.object_exists");
        }

        Ok(hash_id)
    }

    /// Serializes a value to canonical JSON and writes it.
    pub fn write_json(&self, value: &Value) -> Result<String> {
        self.write(canonical_json(value).as_bytes())
    }

    /// Resolves a hash id to its on-disk path.
    ///
    /// Fails with `Value` on a malformed id and `NotFound` when the object is
    /// absent.
    pub fn path_of(&self, hash_id: &str) -> Result<PathBuf> {
        let hex = Self::parse_hash_id(hash_id)?;
        let path = self.root.join(&hex[..2]).join(&hex[2..]);
        if !path.exists() {
            return Err(EngineError::NotFound(format!(
                "cache object not found for hash: {hash_id}"
            )));
        }
        Ok(path)
    }

    pub fn read_bytes(&self, hash_id: &str) -> Result<Vec<u8>> {
        let path = self.path_of(hash_id)?;
        Ok(std::fs::read(path)?)
    }

    /// Reads an object back as a JSON value.
    pub fn read_json(&self, hash_id: &str) -> Result<Value> {
        let bytes = self.read_bytes(hash_id)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn parse_hash_id(hash_id: &str) -> Result<&str> {
        let (algo, hex) = hash_id.split_once(':').ok_or_else(|| {
            EngineError::Value(format!("invalid content hash id format: {hash_id}"))
        })?;
        if algo != "sha256" {
            return Err(EngineError::Value(format!(
                "unsupported hash algorithm: {algo}"
            )));
        }
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(EngineError::Value(format!(
                "invalid content hash id format: {hash_id}"
            )));
        }
        Ok(hex)
    }
}
