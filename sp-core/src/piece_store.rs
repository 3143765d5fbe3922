//! Opaque blob-store contract for piece payload data. Keys follow the stable
//! piece-key encoding; the backing store is deployment-provided (object
//! store, local disk). Concurrent-safe with a single writer per key.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};

#[async_trait]
pub trait PieceStore: Send + Sync {
    async fn put_piece(&self, key: &str, data: Vec<u8>) -> Result<()>;
    async fn get_piece(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete_piece(&self, key: &str) -> Result<()>;
    async fn has_piece(&self, key: &str) -> Result<bool>;
}

/// In-memory reference implementation.
#[derive(Debug, Default)]
pub struct MemPieceStore {
    pieces: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemPieceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.lock().unwrap().len()
    }
}

#[async_trait]
impl PieceStore for MemPieceStore {
    async fn put_piece(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.pieces.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn get_piece(&self, key: &str) -> Result<Vec<u8>> {
        self.pieces
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::PieceStore(format!("piece {} not found", key)))
    }

    async fn delete_piece(&self, key: &str) -> Result<()> {
        self.pieces.lock().unwrap().remove(key);
        Ok(())
    }

    async fn has_piece(&self, key: &str) -> Result<bool> {
        Ok(self.pieces.lock().unwrap().contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemPieceStore::new();
        store.put_piece("s1_s0", vec![1, 2, 3]).await.unwrap();
        assert!(store.has_piece("s1_s0").await.unwrap());
        assert_eq!(store.get_piece("s1_s0").await.unwrap(), vec![1, 2, 3]);
        store.delete_piece("s1_s0").await.unwrap();
        assert!(!store.has_piece("s1_s0").await.unwrap());
        assert!(store.get_piece("s1_s0").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemPieceStore::new();
        store.delete_piece("missing").await.unwrap();
    }
}
