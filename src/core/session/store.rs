//! Session persistence with a pluggable backend.
//!
//! Sessions are serialized to JSON and stored as [`Bytes`] behind a small
//! backend trait, so tests can swap in alternatives and the store stays
//! agnostic of where the bytes live. The default backend is an in-process
//! moka cache with a TTL so abandoned sessions age out on their own.

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache as MokaCache;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::Session;

/// Errors from session persistence.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session backend error: {0}")]
    Backend(String),
}

/// Storage interface for raw session bytes.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process backend: bounded moka cache with idle expiry.
pub struct MemorySessionBackend {
    cache: MokaCache<String, Bytes>,
}

impl MemorySessionBackend {
    pub fn new(max_sessions: u64, ttl: Duration) -> Self {
        Self {
            cache: MokaCache::builder()
                .max_capacity(max_sessions)
                .time_to_idle(ttl)
                .build(),
        }
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.cache.insert(key.to_string(), value).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.cache.get(key).await)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}

/// Typed facade over a [`SessionBackend`].
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self { backend }
    }

    /// Store with defaults suitable for a single-process deployment.
    pub fn in_memory(max_sessions: u64, ttl: Duration) -> Self {
        Self::new(Arc::new(MemorySessionBackend::new(max_sessions, ttl)))
    }

    pub async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let bytes = Bytes::from(serde_json::to_vec(session)?);
        debug!(session_id = %session.id, size = bytes.len(), "saving session");
        self.backend.set(&session.id, bytes).await
    }

    pub async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        match self.backend.get(id).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        debug!(session_id = %id, "deleting session");
        self.backend.delete(id).await
    }
}
