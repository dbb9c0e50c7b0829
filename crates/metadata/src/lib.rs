//! Metadata store abstraction and implementations for teldrive.
//!
//! This crate provides the relational half of the system:
//! - The file tree with upsert, move, recursive delete and listings
//! - Upload parts and their atomic consumption into files
//! - Channels, bots, shares, users and sessions
//! - The event log and an event bus for multi-instance fan-out
//! - Shared counters for coordinated round-robin

/// Bind [`query::Arg`]s to a query in order.
macro_rules! bind_args {
    ($query:expr, $args:expr) => {{
        let mut query = $query;
        for arg in $args {
            query = match arg {
                $crate::query::Arg::Int(v) => query.bind(*v),
                $crate::query::Arg::Text(v) => query.bind(v.clone()),
                $crate::query::Arg::Uuid(v) => query.bind(*v),
                $crate::query::Arg::Time(v) => query.bind(*v),
            };
        }
        query
    }};
}

pub mod bus;
pub mod error;
pub mod models;
pub mod postgres;
pub mod query;
pub mod repos;
pub mod store;

pub use bus::{EventBus, LocalEventBus};
pub use error::{MetadataError, MetadataResult};
pub use postgres::{PgEventBus, PostgresStore};
pub use store::{MetadataStore, SqliteStore};

use std::sync::Arc;
use teldrive_core::config::MetadataConfig;

/// Create a metadata store from configuration.
///
/// The event bus is backed by LISTEN/NOTIFY on PostgreSQL and is in-process
/// on SQLite.
pub async fn from_config(
    config: &MetadataConfig,
) -> MetadataResult<(Arc<dyn MetadataStore>, Arc<dyn EventBus>)> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs).await?;
            Ok((Arc::new(store), Arc::new(LocalEventBus::default())))
        }
        MetadataConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            statement_timeout_ms,
        } => {
            let store = if let Some(url) = url {
                tracing::info!("Connecting to PostgreSQL using connection URL");
                PostgresStore::from_url(url, *max_connections, *statement_timeout_ms).await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    *max_connections,
                    *statement_timeout_ms,
                )
                .await?
            } else {
                return Err(MetadataError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            let bus = store.event_bus();
            Ok((Arc::new(store), Arc::new(bus)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teldrive_core::config::MetadataConfig;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("metadata.db");
        let config = MetadataConfig::Sqlite {
            path: db_path.clone(),
            query_timeout_secs: None,
        };

        let (store, _bus) = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        assert!(db_path.exists());
    }
}
