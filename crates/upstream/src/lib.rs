//! Upstream chat-service abstraction for teldrive.
//!
//! This crate provides:
//! - The [`UpstreamClient`] capability: blob download, upload, copy, delete,
//!   channel creation, admin promotion and history with totals
//! - Backends: local filesystem and in-memory
//! - Rate-limit, flood-wait and back-off middleware
//! - A pool of authenticated clients keyed by user and credential

pub mod backends;
pub mod error;
pub mod pool;
pub mod retry;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use backends::memory::{MemoryConnector, MemoryNetwork};
pub use error::{UpstreamError, UpstreamResult};
pub use pool::ClientPool;
pub use retry::{RetryClient, RetryPolicy};
pub use traits::{Connector, Credential, HistoryPage, Identity, MessageLocation, UpstreamClient};

use std::sync::Arc;
use teldrive_core::config::UpstreamBackendConfig;

/// Create a connector from configuration.
pub async fn from_config(config: &UpstreamBackendConfig) -> UpstreamResult<Arc<dyn Connector>> {
    match config {
        UpstreamBackendConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        UpstreamBackendConfig::Memory => {
            tracing::warn!("using in-memory upstream backend; stored data is lost on exit");
            Ok(Arc::new(MemoryConnector::new(MemoryNetwork::new())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = UpstreamBackendConfig::Filesystem {
            path: temp.path().join("channels"),
        };
        let connector = from_config(&config).await.unwrap();
        let client = connector
            .connect(1, &Credential::Session("1:s".into()))
            .await
            .unwrap();
        assert_eq!(client.self_info().await.unwrap().user_id, 1);
        assert!(temp.path().join("channels/accounts").exists());
    }
}
