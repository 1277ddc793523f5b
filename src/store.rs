// ===============================
// src/store.rs (dokumen JSON per key: holdings, strategy, ...)
// ===============================
//
// Satu file `<DATA_DIR>/<key>.json` per key. Tulis ke `.tmp` dulu lalu rename,
// supaya pembaca tidak pernah melihat file setengah jadi.
//
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store key `{0}` (allowed: a-z, 0-9, '-', '_')")]
    InvalidKey(String),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored document is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 64
        && key.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
}

pub struct DocumentStore {
    dir: PathBuf,
}

impl DocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    pub fn dir(&self) -> &Path { &self.dir }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if !valid_key(key) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    /// `Ok(None)` when nothing has been stored under `key` yet.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn put(&self, key: &str, doc: &Value) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(doc)?).await?;
        fs::rename(&tmp, &path).await?;
        debug!(%key, path = %path.display(), "document stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_roundtrips_and_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path().join("nested"));

        assert_eq!(store.get("holdings").await.unwrap(), None);
        store.put("holdings", &json!({"AAPL": {"shares": 100}})).await.unwrap();
        assert_eq!(store.get("holdings").await.unwrap(), Some(json!({"AAPL": {"shares": 100}})));

        store.put("holdings", &json!([])).await.unwrap();
        assert_eq!(store.get("holdings").await.unwrap(), Some(json!([])));
    }

    #[tokio::test]
    async fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path());
        for bad in ["", "../etc", "Holdings", "a/b", "a.b"] {
            assert!(matches!(store.put(bad, &json!(1)).await, Err(StoreError::InvalidKey(_))), "{bad}");
        }
        assert!(valid_key("strategy_v2-notes"));
    }

    #[tokio::test]
    async fn corrupt_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("strategy.json"), b"{not json").unwrap();
        let store = DocumentStore::new(dir.path());
        assert!(matches!(store.get("strategy").await, Err(StoreError::Serialization(_))));
    }
}
