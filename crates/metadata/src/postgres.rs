//! PostgreSQL-based metadata store implementation.

use crate::bus::{BusStream, EVENTS_TOPIC, EventBus};
use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::query::{Dialect, FileQuery};
use crate::repos::files::tombstone;
use crate::repos::{
    BotRepo, ChannelRepo, ContentSource, CounterRepo, EventRepo, FileContent, FileRepo,
    FileUpdate, ShareRepo, UploadRepo, UserRepo,
};
use crate::store::MetadataStore;
use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{PgConnection, Pool, Postgres};
use std::str::FromStr;
use teldrive_core::config::PgSslMode;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// An event bus sharing this store's pool.
    pub fn event_bus(&self) -> PgEventBus {
        PgEventBus {
            pool: self.pool.clone(),
        }
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement,
        // so we split the schema and execute each statement separately.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Event bus over LISTEN/NOTIFY.
#[derive(Clone)]
pub struct PgEventBus {
    pool: Pool<Postgres>,
}

#[async_trait]
impl EventBus for PgEventBus {
    async fn publish(&self, payload: &str) -> MetadataResult<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(EVENTS_TOPIC)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> MetadataResult<BusStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(EVENTS_TOPIC).await?;
        let stream = listener.into_stream().map(|item| {
            item.map(|n| n.payload().to_string())
                .map_err(MetadataError::from)
        });
        Ok(Box::pin(stream))
    }
}

const INSERT_FILE: &str = "INSERT INTO files (id, name, type, mime_type, size, category, \
    encrypted, user_id, status, parent_id, parts, channel_id, hash, created_at, updated_at) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)";

const WRITE_FILE: &str = "UPDATE files SET name = $1, parent_id = $2, mime_type = $3, size = $4, \
    category = $5, encrypted = $6, parts = $7, channel_id = $8, hash = $9, updated_at = $10 \
    WHERE id = $11";

const ANCESTORS: &str = "WITH RECURSIVE chain(id, depth) AS (\
    SELECT id, 0 FROM files WHERE id = $1 \
    UNION ALL \
    SELECT f.parent_id, c.depth + 1 FROM files f JOIN chain c ON f.id = c.id \
    WHERE f.parent_id IS NOT NULL AND c.depth < 256) \
    SELECT files.* FROM files JOIN chain ON files.id = chain.id ORDER BY chain.depth";

async fn get_file_tx(conn: &mut PgConnection, id: Uuid) -> MetadataResult<Option<FileRow>> {
    let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

async fn find_child_tx(
    conn: &mut PgConnection,
    user_id: i64,
    parent_id: Option<Uuid>,
    name: &str,
    lock: bool,
) -> MetadataResult<Option<FileRow>> {
    let sql = format!(
        "SELECT * FROM files WHERE user_id = $1 AND name = $2 AND status = 'active' \
         AND parent_id IS NOT DISTINCT FROM $3{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query_as::<_, FileRow>(&sql)
        .bind(user_id)
        .bind(name)
        .bind(parent_id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

async fn insert_file_tx(conn: &mut PgConnection, row: &FileRow) -> MetadataResult<()> {
    sqlx::query(INSERT_FILE)
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.file_type)
        .bind(&row.mime_type)
        .bind(row.size)
        .bind(&row.category)
        .bind(row.encrypted)
        .bind(row.user_id)
        .bind(&row.status)
        .bind(row.parent_id)
        .bind(&row.parts)
        .bind(row.channel_id)
        .bind(&row.hash)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(conn)
        .await?;
    Ok(())
}

/// Insert a new active entry, or take over the content of one that a
/// concurrent writer inserted first.
async fn upsert_new_tx(conn: &mut PgConnection, row: &FileRow) -> MetadataResult<FileRow> {
    let stored = sqlx::query_as::<_, FileRow>(
        "INSERT INTO files (id, name, type, mime_type, size, category, encrypted, user_id, \
         status, parent_id, parts, channel_id, hash, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         ON CONFLICT (name, coalesce(parent_id, '00000000-0000-0000-0000-000000000000'::uuid), user_id) \
         WHERE status = 'active' \
         DO UPDATE SET mime_type = EXCLUDED.mime_type, size = EXCLUDED.size, \
         category = EXCLUDED.category, encrypted = EXCLUDED.encrypted, parts = EXCLUDED.parts, \
         channel_id = EXCLUDED.channel_id, hash = EXCLUDED.hash, updated_at = EXCLUDED.updated_at \
         WHERE files.type = EXCLUDED.type \
         RETURNING *",
    )
    .bind(row.id)
    .bind(&row.name)
    .bind(&row.file_type)
    .bind(&row.mime_type)
    .bind(row.size)
    .bind(&row.category)
    .bind(row.encrypted)
    .bind(row.user_id)
    .bind(&row.status)
    .bind(row.parent_id)
    .bind(&row.parts)
    .bind(row.channel_id)
    .bind(&row.hash)
    .bind(row.created_at)
    .bind(row.updated_at)
    .fetch_optional(conn)
    .await?;
    stored.ok_or_else(|| {
        MetadataError::Constraint(format!("'{}' already exists with another type", row.name))
    })
}

async fn write_file_tx(conn: &mut PgConnection, row: &FileRow) -> MetadataResult<()> {
    sqlx::query(WRITE_FILE)
        .bind(&row.name)
        .bind(row.parent_id)
        .bind(&row.mime_type)
        .bind(row.size)
        .bind(&row.category)
        .bind(row.encrypted)
        .bind(&row.parts)
        .bind(row.channel_id)
        .bind(&row.hash)
        .bind(row.updated_at)
        .bind(row.id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn resolve_content_tx(
    conn: &mut PgConnection,
    user_id: i64,
    source: &ContentSource,
) -> MetadataResult<Option<FileContent>> {
    match source {
        ContentSource::Row => Ok(None),
        ContentSource::Parts(content) => Ok(Some(content.clone())),
        ContentSource::Upload(upload_id) => {
            let rows = sqlx::query_as::<_, UploadRow>(
                "SELECT * FROM uploads WHERE upload_id = $1 AND user_id = $2 \
                 ORDER BY part_no FOR UPDATE",
            )
            .bind(upload_id)
            .bind(user_id)
            .fetch_all(conn)
            .await?;
            Ok(Some(FileContent::from_uploads(upload_id, &rows)?))
        }
    }
}

async fn consume_upload_tx(
    conn: &mut PgConnection,
    user_id: i64,
    source: &ContentSource,
) -> MetadataResult<()> {
    if let ContentSource::Upload(upload_id) = source {
        sqlx::query("DELETE FROM uploads WHERE upload_id = $1 AND user_id = $2")
            .bind(upload_id)
            .bind(user_id)
            .execute(conn)
            .await?;
    }
    Ok(())
}

/// Mark files under `ids` pending and remove the folders, in one statement.
async fn delete_tree_tx(
    conn: &mut PgConnection,
    user_id: i64,
    ids: &[Uuid],
    now: OffsetDateTime,
) -> MetadataResult<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let affected: i64 = sqlx::query_scalar(
        "WITH RECURSIVE tree AS (\
         SELECT id, type FROM files WHERE user_id = $1 AND id = ANY($2) \
         UNION \
         SELECT f.id, f.type FROM files f JOIN tree t ON f.parent_id = t.id WHERE f.user_id = $1), \
         marked AS (\
         UPDATE files SET status = 'pending_deletion', updated_at = $3 \
         WHERE id IN (SELECT id FROM tree WHERE type = 'file') AND status = 'active' \
         RETURNING id), \
         removed AS (\
         DELETE FROM files WHERE id IN (SELECT id FROM tree WHERE type = 'folder') \
         RETURNING id) \
         SELECT (SELECT COUNT(*) FROM marked) + (SELECT COUNT(*) FROM removed)",
    )
    .bind(user_id)
    .bind(ids)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(affected as u64)
}

#[async_trait]
impl FileRepo for PostgresStore {
    async fn get_file(&self, id: Uuid) -> MetadataResult<Option<FileRow>> {
        let mut conn = self.pool.acquire().await?;
        get_file_tx(&mut conn, id).await
    }

    async fn find_child(
        &self,
        user_id: i64,
        parent_id: Option<Uuid>,
        name: &str,
    ) -> MetadataResult<Option<FileRow>> {
        let mut conn = self.pool.acquire().await?;
        find_child_tx(&mut conn, user_id, parent_id, name, false).await
    }

    async fn upsert_file(&self, row: &FileRow, content: ContentSource) -> MetadataResult<FileRow> {
        let mut tx = self.pool.begin().await?;

        let mut row = row.clone();
        if let Some(content) = resolve_content_tx(&mut tx, row.user_id, &content).await? {
            content.apply(&mut row);
        }

        let existing = find_child_tx(&mut tx, row.user_id, row.parent_id, &row.name, true).await?;
        let stored = match existing {
            None => upsert_new_tx(&mut tx, &row).await?,
            Some(existing) if existing.file_type != row.file_type => {
                return Err(MetadataError::Constraint(format!(
                    "'{}' already exists as a {}",
                    existing.name, existing.file_type
                )));
            }
            Some(existing) if existing.is_folder() => existing,
            Some(existing) => {
                if let Some(old) = tombstone(&existing, &row, row.updated_at) {
                    insert_file_tx(&mut tx, &old).await?;
                }
                row.id = existing.id;
                row.created_at = existing.created_at;
                write_file_tx(&mut tx, &row).await?;
                row
            }
        };

        consume_upload_tx(&mut tx, stored.user_id, &content).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn insert_file(&self, row: &FileRow, content: ContentSource) -> MetadataResult<FileRow> {
        let mut tx = self.pool.begin().await?;

        let mut row = row.clone();
        if let Some(content) = resolve_content_tx(&mut tx, row.user_id, &content).await? {
            content.apply(&mut row);
        }
        if find_child_tx(&mut tx, row.user_id, row.parent_id, &row.name, true)
            .await?
            .is_some()
        {
            return Err(MetadataError::AlreadyExists(format!("'{}'", row.name)));
        }
        // A concurrent insert of the same name trips the unique index.
        insert_file_tx(&mut tx, &row).await?;

        consume_upload_tx(&mut tx, row.user_id, &content).await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn update_file(&self, id: Uuid, update: &FileUpdate) -> MetadataResult<FileRow> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, FileRow>(
            "SELECT * FROM files WHERE id = $1 AND status = 'active' FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("file {id}")))?;

        let mut row = existing.clone();
        if let Some(name) = &update.name {
            row.name = name.clone();
        }
        if let Some(parent_id) = update.parent_id {
            row.parent_id = parent_id;
        }
        let content = resolve_content_tx(&mut tx, existing.user_id, &update.content).await?;
        if let Some(content) = content {
            content.apply(&mut row);
            if let Some(old) = tombstone(&existing, &row, update.updated_at) {
                insert_file_tx(&mut tx, &old).await?;
            }
        }
        row.updated_at = update.updated_at;

        write_file_tx(&mut tx, &row).await?;
        consume_upload_tx(&mut tx, existing.user_id, &update.content).await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn list_files(&self, query: &FileQuery) -> MetadataResult<(Vec<FileRow>, i64)> {
        let built = query.build(Dialect::Postgres);
        let rows = bind_args!(sqlx::query_as::<_, FileRow>(&built.sql), &built.args)
            .fetch_all(&self.pool)
            .await?;
        let total: i64 = bind_args!(sqlx::query_scalar::<_, i64>(&built.count_sql), &built.args)
            .fetch_one(&self.pool)
            .await?;
        Ok((rows, total))
    }

    async fn delete_files(&self, user_id: i64, ids: &[Uuid]) -> MetadataResult<u64> {
        let mut conn = self.pool.acquire().await?;
        delete_tree_tx(&mut conn, user_id, ids, OffsetDateTime::now_utc()).await
    }

    async fn move_file(
        &self,
        user_id: i64,
        id: Uuid,
        parent_id: Option<Uuid>,
        name: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<FileRow> {
        let mut tx = self.pool.begin().await?;

        let mut source = get_file_tx(&mut tx, id)
            .await?
            .filter(|f| f.is_active() && f.user_id == user_id)
            .ok_or_else(|| MetadataError::NotFound(format!("file {id}")))?;

        if let Some(parent) = parent_id {
            let chain = sqlx::query_as::<_, FileRow>(ANCESTORS)
                .bind(parent)
                .fetch_all(&mut *tx)
                .await?;
            match chain.first() {
                Some(p) if p.is_folder() && p.is_active() && p.user_id == user_id => {}
                _ => {
                    return Err(MetadataError::Constraint(format!(
                        "destination {parent} is not a folder"
                    )));
                }
            }
            if chain.iter().any(|f| f.id == id) {
                return Err(MetadataError::Constraint(
                    "cannot move a folder into itself".to_string(),
                ));
            }
        }

        let existing = find_child_tx(&mut tx, user_id, parent_id, name, true)
            .await?
            .filter(|f| f.id != id);
        if let Some(dest) = existing {
            if dest.is_folder() && source.is_folder() {
                sqlx::query(
                    "UPDATE files SET parent_id = $1, updated_at = $2 \
                     WHERE parent_id = $3 AND status = 'active' AND name NOT IN \
                     (SELECT name FROM files WHERE parent_id = $1 AND status = 'active')",
                )
                .bind(id)
                .bind(updated_at)
                .bind(dest.id)
                .execute(&mut *tx)
                .await?;
            }
            delete_tree_tx(&mut tx, user_id, &[dest.id], updated_at).await?;
        }

        source.parent_id = parent_id;
        source.name = name.to_string();
        source.updated_at = updated_at;
        write_file_tx(&mut tx, &source).await?;
        tx.commit().await?;
        Ok(source)
    }

    async fn ancestors(&self, id: Uuid) -> MetadataResult<Vec<FileRow>> {
        let rows = sqlx::query_as::<_, FileRow>(ANCESTORS)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn pending_deletions(&self, limit: i64) -> MetadataResult<Vec<FileRow>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT * FROM files WHERE status = 'pending_deletion' AND type = 'file' \
             ORDER BY updated_at LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn purge_files(&self, ids: &[Uuid]) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM files WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn channel_files(&self, user_id: i64, channel_id: i64) -> MetadataResult<Vec<FileRow>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT * FROM files WHERE user_id = $1 AND channel_id = $2 AND type = 'file'",
        )
        .bind(user_id)
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn category_stats(&self, user_id: i64) -> MetadataResult<Vec<CategoryStats>> {
        let rows = sqlx::query_as::<_, CategoryStats>(
            "SELECT category, COUNT(*) AS total_files, COALESCE(SUM(size), 0)::BIGINT AS total_size \
             FROM files WHERE user_id = $1 AND status = 'active' AND type = 'file' \
             GROUP BY category ORDER BY category",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn daily_usage(
        &self,
        user_id: i64,
        since: OffsetDateTime,
    ) -> MetadataResult<Vec<DailyUsage>> {
        let rows = sqlx::query_as::<_, DailyUsage>(
            "SELECT to_char(created_at AT TIME ZONE 'UTC', 'YYYY-MM-DD') AS day, \
             COALESCE(SUM(size), 0)::BIGINT AS total_size \
             FROM files WHERE user_id = $1 AND type = 'file' AND created_at >= $2 \
             GROUP BY day ORDER BY day",
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl UploadRepo for PostgresStore {
    async fn create_part(&self, part: &UploadRow) -> MetadataResult<()> {
        if part.part_id == 0 {
            return Err(MetadataError::Constraint("part has no message id".to_string()));
        }
        sqlx::query(
            r#"
            INSERT INTO uploads (
                upload_id, user_id, name, part_no, part_id, channel_id, size,
                encrypted, salt, block_hashes, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (upload_id, part_no) DO UPDATE SET
                name = EXCLUDED.name, part_id = EXCLUDED.part_id,
                channel_id = EXCLUDED.channel_id, size = EXCLUDED.size,
                encrypted = EXCLUDED.encrypted, salt = EXCLUDED.salt,
                block_hashes = EXCLUDED.block_hashes, created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&part.upload_id)
        .bind(part.user_id)
        .bind(&part.name)
        .bind(part.part_no)
        .bind(part.part_id)
        .bind(part.channel_id)
        .bind(part.size)
        .bind(part.encrypted)
        .bind(&part.salt)
        .bind(&part.block_hashes)
        .bind(part.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_parts(
        &self,
        upload_id: &str,
        user_id: i64,
        not_before: OffsetDateTime,
    ) -> MetadataResult<Vec<UploadRow>> {
        let rows = sqlx::query_as::<_, UploadRow>(
            "SELECT * FROM uploads WHERE upload_id = $1 AND user_id = $2 AND created_at >= $3 \
             ORDER BY part_no",
        )
        .bind(upload_id)
        .bind(user_id)
        .bind(not_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_upload(&self, upload_id: &str, user_id: i64) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM uploads WHERE upload_id = $1 AND user_id = $2")
            .bind(upload_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn expired_parts(&self, cutoff: OffsetDateTime) -> MetadataResult<Vec<UploadRow>> {
        let rows = sqlx::query_as::<_, UploadRow>(
            "SELECT * FROM uploads WHERE created_at < $1 ORDER BY channel_id, part_id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_parts_by_message(
        &self,
        channel_id: i64,
        part_ids: &[i64],
    ) -> MetadataResult<u64> {
        let result =
            sqlx::query("DELETE FROM uploads WHERE channel_id = $1 AND part_id = ANY($2)")
                .bind(channel_id)
                .bind(part_ids)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn channel_upload_messages(&self, channel_id: i64) -> MetadataResult<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT part_id FROM uploads WHERE channel_id = $1")
            .bind(channel_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[async_trait]
impl ChannelRepo for PostgresStore {
    async fn list_channels(&self, user_id: i64) -> MetadataResult<Vec<ChannelRow>> {
        let rows = sqlx::query_as::<_, ChannelRow>(
            "SELECT * FROM channels WHERE user_id = $1 ORDER BY channel_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn selected_channel(&self, user_id: i64) -> MetadataResult<Option<ChannelRow>> {
        let row = sqlx::query_as::<_, ChannelRow>(
            "SELECT * FROM channels WHERE user_id = $1 AND selected",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn select_channel(&self, channel: &ChannelRow) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE channels SET selected = FALSE WHERE user_id = $1")
            .bind(channel.user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO channels (channel_id, channel_name, user_id, selected) \
             VALUES ($1, $2, $3, TRUE) \
             ON CONFLICT (channel_id) DO UPDATE SET \
             channel_name = EXCLUDED.channel_name, selected = TRUE",
        )
        .bind(channel.channel_id)
        .bind(&channel.channel_name)
        .bind(channel.user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl BotRepo for PostgresStore {
    async fn list_bots(&self, user_id: i64, channel_id: i64) -> MetadataResult<Vec<BotRow>> {
        let rows = sqlx::query_as::<_, BotRow>(
            "SELECT * FROM bots WHERE user_id = $1 AND channel_id = $2 ORDER BY bot_id",
        )
        .bind(user_id)
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn add_bots(&self, bots: &[BotRow]) -> MetadataResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut added = 0;
        for bot in bots {
            added += sqlx::query(
                "INSERT INTO bots (token, user_id, bot_id, channel_id) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (token) DO UPDATE SET user_id = EXCLUDED.user_id, \
                 bot_id = EXCLUDED.bot_id, channel_id = EXCLUDED.channel_id",
            )
            .bind(&bot.token)
            .bind(bot.user_id)
            .bind(bot.bot_id)
            .bind(bot.channel_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(added)
    }

    async fn delete_bots(&self, user_id: i64, channel_id: i64) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM bots WHERE user_id = $1 AND channel_id = $2")
            .bind(user_id)
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ShareRepo for PostgresStore {
    async fn create_share(&self, share: &ShareRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO file_shares (id, file_id, user_id, password, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(share.id)
        .bind(share.file_id)
        .bind(share.user_id)
        .bind(&share.password)
        .bind(share.expires_at)
        .bind(share.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_share(&self, id: Uuid) -> MetadataResult<Option<ShareRow>> {
        let row = sqlx::query_as::<_, ShareRow>("SELECT * FROM file_shares WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn shares_for_file(&self, user_id: i64, file_id: Uuid) -> MetadataResult<Vec<ShareRow>> {
        let rows = sqlx::query_as::<_, ShareRow>(
            "SELECT * FROM file_shares WHERE user_id = $1 AND file_id = $2 ORDER BY created_at",
        )
        .bind(user_id)
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_share(
        &self,
        id: Uuid,
        password: Option<&str>,
        expires_at: Option<OffsetDateTime>,
    ) -> MetadataResult<()> {
        let result =
            sqlx::query("UPDATE file_shares SET password = $1, expires_at = $2 WHERE id = $3")
                .bind(password)
                .bind(expires_at)
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("share {id}")));
        }
        Ok(())
    }

    async fn delete_share(&self, id: Uuid) -> MetadataResult<()> {
        let result = sqlx::query("DELETE FROM file_shares WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("share {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl EventRepo for PostgresStore {
    async fn insert_event(&self, event: &EventRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO events (id, type, user_id, source, created_at) VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(event.id)
        .bind(&event.event_type)
        .bind(event.user_id)
        .bind(&event.source)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_since(&self, since: OffsetDateTime, limit: i64) -> MetadataResult<Vec<EventRow>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events WHERE created_at > $1 ORDER BY created_at LIMIT $2",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn recent_events(&self, user_id: i64, limit: i64) -> MetadataResult<Vec<EventRow>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_events_before(&self, cutoff: OffsetDateTime) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl UserRepo for PostgresStore {
    async fn upsert_user(&self, user: &UserRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO users (user_id, user_name, name, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id) DO UPDATE SET \
             user_name = EXCLUDED.user_name, name = EXCLUDED.name, \
             updated_at = EXCLUDED.updated_at",
        )
        .bind(user.user_id)
        .bind(&user.user_name)
        .bind(&user.name)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, user_id: i64) -> MetadataResult<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_users(&self) -> MetadataResult<Vec<UserRow>> {
        let rows = sqlx::query_as::<_, UserRow>("SELECT * FROM users ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn create_session(&self, session: &SessionRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO sessions (session_hash, user_id, session, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&session.session_hash)
        .bind(session.user_id)
        .bind(&session.session)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_hash: &str) -> MetadataResult<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE session_hash = $1")
            .bind(session_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn delete_session(&self, session_hash: &str) -> MetadataResult<()> {
        sqlx::query("DELETE FROM sessions WHERE session_hash = $1")
            .bind(session_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_session(
        &self,
        user_id: i64,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE user_id = $1 AND expires_at > $2 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete_expired_sessions(&self, now: OffsetDateTime) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CounterRepo for PostgresStore {
    async fn next_counter(&self, key: &str) -> MetadataResult<i64> {
        let value = sqlx::query_scalar::<_, i64>(
            "INSERT INTO counters (counter_key, counter_value) VALUES ($1, 1) \
             ON CONFLICT (counter_key) DO UPDATE SET counter_value = counters.counter_value + 1 \
             RETURNING counter_value",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }
}
