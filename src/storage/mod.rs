//! Storage collaborator seams.
//!
//! The transport layer needs two things from storage: a key/value cache for
//! ACME certificate material and a liveness probe for `/healthcheck`. Both are
//! traits so the embedding application can back them with its own database;
//! `DirStore` and `MemoryStore` are the bundled implementations.

mod dir;
mod memory;

use async_trait::async_trait;

pub use dir::DirStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Key/value store for certificate material.
///
/// Implementations must tolerate concurrent calls from simultaneous TLS
/// handshakes.
#[async_trait]
pub trait CertificateCache: Send + Sync {
    /// Returns `None` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Liveness check used by `/healthcheck`.
#[async_trait]
pub trait StorageProbe: Send + Sync {
    async fn ping(&self) -> Result<(), StorageError>;
}
