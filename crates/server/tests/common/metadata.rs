//! Throwaway metadata stores for integration tests.
//!
//! SQLite lives in a temp dir; PostgreSQL runs in a disposable container
//! and is skipped when Docker cannot start one.

use sqlx::{Pool, Postgres as SqlxPostgres, Sqlite};
use std::sync::Arc;
use teldrive_metadata::{MetadataError, MetadataResult, MetadataStore, PostgresStore, SqliteStore};
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Marks errors raised while starting the container, as opposed to schema
/// or connection failures, which must not be skipped.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

const POSTGRES_TAG: &str = "15-alpine";
const POSTGRES_POOL_SIZE: u32 = 5;

/// Migrated SQLite store; the database file goes away with the value.
#[allow(dead_code)]
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    pub(crate) sqlite_store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir()?;
        let sqlite_store = Arc::new(SqliteStore::new(&temp_dir.path().join("meta.db"), None).await?);
        Ok(Self {
            store: sqlite_store.clone(),
            sqlite_store,
            _temp_dir: temp_dir,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        Arc::clone(&self.store)
    }

    /// For checks on rows no repository method returns.
    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }
}

/// Migrated PostgreSQL store backed by a container that lives as long as
/// the value.
#[allow(dead_code)]
pub struct PostgresTestMetadata {
    pub store: Arc<dyn MetadataStore>,
    pub(crate) postgres_store: Arc<PostgresStore>,
    _container: ContainerAsync<Postgres>,
}

fn container_error(what: &str, e: impl std::fmt::Display) -> MetadataError {
    MetadataError::Internal(format!("{POSTGRES_CONTAINER_START_ERR_PREFIX} {what}: {e}"))
}

impl PostgresTestMetadata {
    pub async fn new() -> MetadataResult<Self> {
        let container = Postgres::default()
            .with_tag(POSTGRES_TAG)
            .start()
            .await
            .map_err(|e| container_error("container did not start", e))?;
        let host = container
            .get_host()
            .await
            .map_err(|e| container_error("no container host", e))?;
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .map_err(|e| container_error("no mapped port", e))?;

        // testcontainers-modules ships the image with postgres/postgres.
        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let postgres_store = Arc::new(PostgresStore::from_url(&url, POSTGRES_POOL_SIZE, None).await?);
        Ok(Self {
            store: postgres_store.clone(),
            postgres_store,
            _container: container,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        Arc::clone(&self.store)
    }

    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<SqlxPostgres> {
        self.postgres_store.pool()
    }
}

/// Run `test_fn` on a fresh SQLite store, then on a fresh PostgreSQL store
/// unless `SKIP_POSTGRES_TESTS` is set or Docker is unavailable.
#[allow(dead_code)]
pub async fn run_metadata_test_both<F, Fut>(test_fn: F)
where
    F: Fn(Arc<dyn MetadataStore>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let sqlite = TestMetadata::new().await.unwrap();
    test_fn(sqlite.store()).await;

    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return;
    }
    match PostgresTestMetadata::new().await {
        Ok(postgres) => test_fn(postgres.store()).await,
        Err(e) if e.to_string().contains(POSTGRES_CONTAINER_START_ERR_PREFIX) => {
            eprintln!("PostgreSQL unavailable, ran on SQLite only: {e}");
        }
        Err(e) => panic!("PostgreSQL test store failed: {e}"),
    }
}
