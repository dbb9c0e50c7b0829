//! Domain services behind the HTTP handlers.

pub mod bots;
pub mod channels;
pub mod events;
pub mod files;
pub mod uploads;

#[cfg(test)]
pub(crate) mod testing {
    use crate::auth::AuthenticatedUser;
    use crate::state::AppState;
    use std::sync::Arc;
    use teldrive_core::MemoryCache;
    use teldrive_core::config::AppConfig;
    use teldrive_metadata::models::{ChannelRow, SessionRow};
    use teldrive_metadata::{LocalEventBus, MetadataStore, SqliteStore};
    use teldrive_upstream::{MemoryConnector, MemoryNetwork};
    use tempfile::TempDir;
    use time::OffsetDateTime;

    pub(crate) struct TestContext {
        pub _temp: TempDir,
        pub state: AppState,
        pub network: Arc<MemoryNetwork>,
    }

    impl TestContext {
        pub async fn new(config: AppConfig) -> Self {
            let temp = tempfile::tempdir().unwrap();
            let metadata: Arc<dyn MetadataStore> = Arc::new(
                SqliteStore::new(&temp.path().join("metadata.db"), None)
                    .await
                    .unwrap(),
            );
            let network = MemoryNetwork::new();
            let state = AppState::new(
                config,
                metadata,
                Arc::new(LocalEventBus::default()),
                Arc::new(MemoryConnector::new(Arc::clone(&network))),
                Arc::new(MemoryCache::new(1000)),
            );
            Self {
                _temp: temp,
                state,
                network,
            }
        }

        /// A logged-in user owning one selected channel.
        pub async fn user(&self, user_id: i64) -> (AuthenticatedUser, i64) {
            let now = OffsetDateTime::now_utc();
            let session = format!("{user_id}:session");
            let session_hash = crate::auth::hash_token(&session);
            self.state
                .metadata
                .create_session(&SessionRow {
                    session_hash: session_hash.clone(),
                    user_id,
                    session: session.clone(),
                    created_at: now,
                    expires_at: now + time::Duration::days(1),
                })
                .await
                .unwrap();
            let channel_id = self.network.seed_channel(user_id);
            self.state
                .channels
                .select(&ChannelRow {
                    channel_id,
                    channel_name: "storage".into(),
                    user_id,
                    selected: true,
                })
                .await
                .unwrap();
            let user = AuthenticatedUser {
                user_id,
                session_hash,
                session,
                expires_at: now + time::Duration::days(1),
            };
            (user, channel_id)
        }
    }
}
