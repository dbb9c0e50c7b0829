//! Server test utilities.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use teldrive_core::MemoryCache;
use teldrive_core::config::AppConfig;
use teldrive_metadata::{LocalEventBus, MetadataStore, SqliteStore};
use teldrive_server::{AppState, create_router};
use teldrive_upstream::{MemoryConnector, MemoryNetwork};
use tempfile::TempDir;
use tower::ServiceExt;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub network: Arc<MemoryNetwork>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// A server on SQLite and the in-memory upstream.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig::for_testing();
        modifier(&mut config);

        let network = MemoryNetwork::new();
        let state = AppState::new(
            config,
            metadata,
            Arc::new(LocalEventBus::default()),
            Arc::new(MemoryConnector::new(Arc::clone(&network))),
            Arc::new(MemoryCache::new(1000)),
        );
        let router = create_router(state.clone());

        Self {
            router,
            state,
            network,
            _temp_dir: temp_dir,
        }
    }

    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// Log in as `user_id` and return the bearer token and the selected
    /// channel created on first login.
    pub async fn login(&self, user_id: i64) -> (String, i64) {
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("Content-Type", "application/json")
            .body(Body::from(
                serde_json::json!({ "session": format!("{user_id}:secret") }).to_string(),
            ))
            .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = json["token"].as_str().unwrap().to_string();

        let channel = self
            .metadata()
            .selected_channel(user_id)
            .await
            .unwrap()
            .expect("login selects a channel");
        (token, channel.channel_id)
    }
}
