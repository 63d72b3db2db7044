//! Object storage abstraction for uploaded files
//!
//! The engine stores only the reference returned by `put`, never raw bytes.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("Object not found: {url}")]
    NotFound { url: String },
    #[error("Object store unavailable: {message}")]
    Unavailable { message: String },
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` and return a URL that `get` accepts
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, ObjectStoreError>;

    async fn get(&self, url: &str) -> Result<Vec<u8>, ObjectStoreError>;
}

const MEMORY_SCHEME: &str = "memory://";

#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, ObjectStoreError> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(format!("{MEMORY_SCHEME}{key}"))
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let key = url
            .strip_prefix(MEMORY_SCHEME)
            .ok_or_else(|| ObjectStoreError::NotFound {
                url: url.to_string(),
            })?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound {
                url: url.to_string(),
            })
    }
}
