//! Common test utilities for upstream backends.

use std::sync::Arc;
use teldrive_upstream::{
    Connector, Credential, FilesystemBackend, MemoryConnector, MemoryNetwork, UpstreamClient,
};
use tempfile::TempDir;

/// A connector plus whatever keeps its storage alive.
pub struct TestBackend {
    pub name: &'static str,
    pub connector: Arc<dyn Connector>,
    _temp_dir: Option<TempDir>,
}

impl TestBackend {
    /// A client for user `id` authenticating with `id:secret`.
    pub async fn user(&self, id: i64) -> Arc<dyn UpstreamClient> {
        self.connector
            .connect(id, &Credential::Session(format!("{id}:secret")))
            .await
            .expect("connect user")
    }

    /// A client for bot `id` authenticating with `id:token`.
    #[allow(dead_code)]
    pub async fn bot(&self, owner: i64, id: i64) -> Arc<dyn UpstreamClient> {
        self.connector
            .connect(owner, &Credential::Bot(format!("{id}:token")))
            .await
            .expect("connect bot")
    }
}

/// Every backend, each with fresh storage.
pub async fn backends() -> Vec<TestBackend> {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let filesystem = FilesystemBackend::new(temp_dir.path())
        .await
        .expect("Failed to create filesystem backend");
    vec![
        TestBackend {
            name: "memory",
            connector: Arc::new(MemoryConnector::new(MemoryNetwork::new())),
            _temp_dir: None,
        },
        TestBackend {
            name: "filesystem",
            connector: Arc::new(filesystem),
            _temp_dir: Some(temp_dir),
        },
    ]
}
