//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{
    BotRepo, ChannelRepo, CounterRepo, EventRepo, FileRepo, ShareRepo, UploadRepo, UserRepo,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    FileRepo
    + UploadRepo
    + ChannelRepo
    + BotRepo
    + ShareRepo
    + EventRepo
    + UserRepo
    + CounterRepo
    + Send
    + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // A single connection serialises writers and keeps the select-then-write
        // upserts below race free.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(
            query_timeout_secs,
            "SQLite query timeout is advisory only; use PostgreSQL for multi-instance deployments"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// `?, ?, ?` for an IN list of `n` items.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::query::{Dialect, FileQuery};
    use crate::repos::files::tombstone;
    use crate::repos::{ContentSource, FileContent, FileUpdate};
    use sqlx::SqliteConnection;
    use time::OffsetDateTime;
    use uuid::Uuid;

    const INSERT_FILE: &str = "INSERT INTO files (id, name, type, mime_type, size, category, \
        encrypted, user_id, status, parent_id, parts, channel_id, hash, created_at, updated_at) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

    const WRITE_FILE: &str = "UPDATE files SET name = ?, parent_id = ?, mime_type = ?, size = ?, \
        category = ?, encrypted = ?, parts = ?, channel_id = ?, hash = ?, updated_at = ? \
        WHERE id = ?";

    const ANCESTORS: &str = "WITH RECURSIVE chain(id, depth) AS (\
        SELECT id, 0 FROM files WHERE id = ? \
        UNION ALL \
        SELECT f.parent_id, c.depth + 1 FROM files f JOIN chain c ON f.id = c.id \
        WHERE f.parent_id IS NOT NULL AND c.depth < 256) \
        SELECT files.* FROM files JOIN chain ON files.id = chain.id ORDER BY chain.depth";

    async fn get_file_tx(conn: &mut SqliteConnection, id: Uuid) -> MetadataResult<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(conn)
            .await?;
        Ok(row)
    }

    async fn find_child_tx(
        conn: &mut SqliteConnection,
        user_id: i64,
        parent_id: Option<Uuid>,
        name: &str,
    ) -> MetadataResult<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>(
            "SELECT * FROM files WHERE user_id = ? AND name = ? AND status = 'active' \
             AND parent_id IS ?",
        )
        .bind(user_id)
        .bind(name)
        .bind(parent_id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    async fn insert_file_tx(conn: &mut SqliteConnection, row: &FileRow) -> MetadataResult<()> {
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

    async fn write_file_tx(conn: &mut SqliteConnection, row: &FileRow) -> MetadataResult<()> {
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

    /// Resolve a content source, returning the upload to consume, if any.
    async fn resolve_content_tx(
        conn: &mut SqliteConnection,
        user_id: i64,
        source: &ContentSource,
    ) -> MetadataResult<Option<FileContent>> {
        match source {
            ContentSource::Row => Ok(None),
            ContentSource::Parts(content) => Ok(Some(content.clone())),
            ContentSource::Upload(upload_id) => {
                let rows = sqlx::query_as::<_, UploadRow>(
                    "SELECT * FROM uploads WHERE upload_id = ? AND user_id = ? ORDER BY part_no",
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
        conn: &mut SqliteConnection,
        user_id: i64,
        source: &ContentSource,
    ) -> MetadataResult<()> {
        if let ContentSource::Upload(upload_id) = source {
            sqlx::query("DELETE FROM uploads WHERE upload_id = ? AND user_id = ?")
                .bind(upload_id)
                .bind(user_id)
                .execute(conn)
                .await?;
        }
        Ok(())
    }

    /// Mark files under `ids` pending and remove the folders among them.
    async fn delete_tree_tx(
        conn: &mut SqliteConnection,
        user_id: i64,
        ids: &[Uuid],
        now: OffsetDateTime,
    ) -> MetadataResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let tree = format!(
            "WITH RECURSIVE tree(id) AS (\
             SELECT id FROM files WHERE user_id = ? AND id IN ({}) \
             UNION \
             SELECT f.id FROM files f JOIN tree t ON f.parent_id = t.id WHERE f.user_id = ?)",
            placeholders(ids.len())
        );

        let mark_sql = format!(
            "{tree} UPDATE files SET status = 'pending_deletion', updated_at = ? \
             WHERE id IN (SELECT id FROM tree) AND type = 'file' AND status = 'active'"
        );
        let mut mark = sqlx::query(&mark_sql).bind(user_id);
        for id in ids {
            mark = mark.bind(*id);
        }
        let marked = mark
            .bind(user_id)
            .bind(now)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        let remove_sql =
            format!("{tree} DELETE FROM files WHERE id IN (SELECT id FROM tree) AND type = 'folder'");
        let mut remove = sqlx::query(&remove_sql).bind(user_id);
        for id in ids {
            remove = remove.bind(*id);
        }
        let removed = remove.bind(user_id).execute(&mut *conn).await?.rows_affected();

        Ok(marked + removed)
    }

    #[async_trait]
    impl FileRepo for SqliteStore {
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
            find_child_tx(&mut conn, user_id, parent_id, name).await
        }

        async fn upsert_file(
            &self,
            row: &FileRow,
            content: ContentSource,
        ) -> MetadataResult<FileRow> {
            let mut tx = self.pool.begin().await?;

            let mut row = row.clone();
            if let Some(content) = resolve_content_tx(&mut tx, row.user_id, &content).await? {
                content.apply(&mut row);
            }

            let existing = find_child_tx(&mut tx, row.user_id, row.parent_id, &row.name).await?;
            let stored = match existing {
                None => {
                    insert_file_tx(&mut tx, &row).await?;
                    row
                }
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

        async fn insert_file(
            &self,
            row: &FileRow,
            content: ContentSource,
        ) -> MetadataResult<FileRow> {
            let mut tx = self.pool.begin().await?;

            let mut row = row.clone();
            if let Some(content) = resolve_content_tx(&mut tx, row.user_id, &content).await? {
                content.apply(&mut row);
            }
            if find_child_tx(&mut tx, row.user_id, row.parent_id, &row.name)
                .await?
                .is_some()
            {
                return Err(MetadataError::AlreadyExists(format!("'{}'", row.name)));
            }
            insert_file_tx(&mut tx, &row).await?;

            consume_upload_tx(&mut tx, row.user_id, &content).await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn update_file(&self, id: Uuid, update: &FileUpdate) -> MetadataResult<FileRow> {
            let mut tx = self.pool.begin().await?;

            let existing = get_file_tx(&mut tx, id)
                .await?
                .filter(FileRow::is_active)
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
            let built = query.build(Dialect::Sqlite);
            let rows = bind_args!(sqlx::query_as::<_, FileRow>(&built.sql), &built.args)
                .fetch_all(&self.pool)
                .await?;
            let total: i64 =
                bind_args!(sqlx::query_scalar::<_, i64>(&built.count_sql), &built.args)
                    .fetch_one(&self.pool)
                    .await?;
            Ok((rows, total))
        }

        async fn delete_files(&self, user_id: i64, ids: &[Uuid]) -> MetadataResult<u64> {
            let mut tx = self.pool.begin().await?;
            let affected = delete_tree_tx(&mut tx, user_id, ids, OffsetDateTime::now_utc()).await?;
            tx.commit().await?;
            Ok(affected)
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

            let existing = find_child_tx(&mut tx, user_id, parent_id, name)
                .await?
                .filter(|f| f.id != id);
            if let Some(dest) = existing {
                if dest.is_folder() && source.is_folder() {
                    sqlx::query(
                        "UPDATE files SET parent_id = ?, updated_at = ? \
                         WHERE parent_id = ? AND status = 'active' AND name NOT IN \
                         (SELECT name FROM files WHERE parent_id = ? AND status = 'active')",
                    )
                    .bind(id)
                    .bind(updated_at)
                    .bind(dest.id)
                    .bind(id)
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
                 ORDER BY updated_at LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn purge_files(&self, ids: &[Uuid]) -> MetadataResult<u64> {
            if ids.is_empty() {
                return Ok(0);
            }
            let sql = format!("DELETE FROM files WHERE id IN ({})", placeholders(ids.len()));
            let mut query = sqlx::query(&sql);
            for id in ids {
                query = query.bind(*id);
            }
            Ok(query.execute(&self.pool).await?.rows_affected())
        }

        async fn channel_files(
            &self,
            user_id: i64,
            channel_id: i64,
        ) -> MetadataResult<Vec<FileRow>> {
            let rows = sqlx::query_as::<_, FileRow>(
                "SELECT * FROM files WHERE user_id = ? AND channel_id = ? AND type = 'file'",
            )
            .bind(user_id)
            .bind(channel_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn category_stats(&self, user_id: i64) -> MetadataResult<Vec<CategoryStats>> {
            let rows = sqlx::query_as::<_, CategoryStats>(
                "SELECT category, COUNT(*) AS total_files, COALESCE(SUM(size), 0) AS total_size \
                 FROM files WHERE user_id = ? AND status = 'active' AND type = 'file' \
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
                "SELECT substr(created_at, 1, 10) AS day, COALESCE(SUM(size), 0) AS total_size \
                 FROM files WHERE user_id = ? AND type = 'file' AND created_at >= ? \
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
    impl UploadRepo for SqliteStore {
        async fn create_part(&self, part: &UploadRow) -> MetadataResult<()> {
            if part.part_id == 0 {
                return Err(MetadataError::Constraint(
                    "part has no message id".to_string(),
                ));
            }
            sqlx::query(
                r#"
                INSERT INTO uploads (
                    upload_id, user_id, name, part_no, part_id, channel_id, size,
                    encrypted, salt, block_hashes, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(upload_id, part_no) DO UPDATE SET
                    name = excluded.name, part_id = excluded.part_id,
                    channel_id = excluded.channel_id, size = excluded.size,
                    encrypted = excluded.encrypted, salt = excluded.salt,
                    block_hashes = excluded.block_hashes, created_at = excluded.created_at
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
                "SELECT * FROM uploads WHERE upload_id = ? AND user_id = ? AND created_at >= ? \
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
            let result = sqlx::query("DELETE FROM uploads WHERE upload_id = ? AND user_id = ?")
                .bind(upload_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }

        async fn expired_parts(&self, cutoff: OffsetDateTime) -> MetadataResult<Vec<UploadRow>> {
            let rows = sqlx::query_as::<_, UploadRow>(
                "SELECT * FROM uploads WHERE created_at < ? ORDER BY channel_id, part_id",
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
            if part_ids.is_empty() {
                return Ok(0);
            }
            let sql = format!(
                "DELETE FROM uploads WHERE channel_id = ? AND part_id IN ({})",
                placeholders(part_ids.len())
            );
            let mut query = sqlx::query(&sql).bind(channel_id);
            for id in part_ids {
                query = query.bind(*id);
            }
            Ok(query.execute(&self.pool).await?.rows_affected())
        }

        async fn channel_upload_messages(&self, channel_id: i64) -> MetadataResult<Vec<i64>> {
            let ids = sqlx::query_scalar::<_, i64>("SELECT part_id FROM uploads WHERE channel_id = ?")
                .bind(channel_id)
                .fetch_all(&self.pool)
                .await?;
            Ok(ids)
        }
    }

    #[async_trait]
    impl ChannelRepo for SqliteStore {
        async fn list_channels(&self, user_id: i64) -> MetadataResult<Vec<ChannelRow>> {
            let rows = sqlx::query_as::<_, ChannelRow>(
                "SELECT * FROM channels WHERE user_id = ? ORDER BY channel_id",
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn selected_channel(&self, user_id: i64) -> MetadataResult<Option<ChannelRow>> {
            let row = sqlx::query_as::<_, ChannelRow>(
                "SELECT * FROM channels WHERE user_id = ? AND selected = 1",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn select_channel(&self, channel: &ChannelRow) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            sqlx::query("UPDATE channels SET selected = ? WHERE user_id = ?")
                .bind(false)
                .bind(channel.user_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO channels (channel_id, channel_name, user_id, selected) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT(channel_id) DO UPDATE SET \
                 channel_name = excluded.channel_name, selected = excluded.selected",
            )
            .bind(channel.channel_id)
            .bind(&channel.channel_name)
            .bind(channel.user_id)
            .bind(true)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl BotRepo for SqliteStore {
        async fn list_bots(&self, user_id: i64, channel_id: i64) -> MetadataResult<Vec<BotRow>> {
            let rows = sqlx::query_as::<_, BotRow>(
                "SELECT * FROM bots WHERE user_id = ? AND channel_id = ? ORDER BY bot_id",
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
                    "INSERT INTO bots (token, user_id, bot_id, channel_id) VALUES (?, ?, ?, ?) \
                     ON CONFLICT(token) DO UPDATE SET user_id = excluded.user_id, \
                     bot_id = excluded.bot_id, channel_id = excluded.channel_id",
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
            let result = sqlx::query("DELETE FROM bots WHERE user_id = ? AND channel_id = ?")
                .bind(user_id)
                .bind(channel_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl ShareRepo for SqliteStore {
        async fn create_share(&self, share: &ShareRow) -> MetadataResult<()> {
            sqlx::query(
                "INSERT INTO file_shares (id, file_id, user_id, password, expires_at, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
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
            let row = sqlx::query_as::<_, ShareRow>("SELECT * FROM file_shares WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn shares_for_file(
            &self,
            user_id: i64,
            file_id: Uuid,
        ) -> MetadataResult<Vec<ShareRow>> {
            let rows = sqlx::query_as::<_, ShareRow>(
                "SELECT * FROM file_shares WHERE user_id = ? AND file_id = ? ORDER BY created_at",
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
                sqlx::query("UPDATE file_shares SET password = ?, expires_at = ? WHERE id = ?")
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
            let result = sqlx::query("DELETE FROM file_shares WHERE id = ?")
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
    impl EventRepo for SqliteStore {
        async fn insert_event(&self, event: &EventRow) -> MetadataResult<()> {
            sqlx::query(
                "INSERT INTO events (id, type, user_id, source, created_at) VALUES (?, ?, ?, ?, ?)",
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

        async fn events_since(
            &self,
            since: OffsetDateTime,
            limit: i64,
        ) -> MetadataResult<Vec<EventRow>> {
            let rows = sqlx::query_as::<_, EventRow>(
                "SELECT * FROM events WHERE created_at > ? ORDER BY created_at LIMIT ?",
            )
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn recent_events(&self, user_id: i64, limit: i64) -> MetadataResult<Vec<EventRow>> {
            let rows = sqlx::query_as::<_, EventRow>(
                "SELECT * FROM events WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_events_before(&self, cutoff: OffsetDateTime) -> MetadataResult<u64> {
            let result = sqlx::query("DELETE FROM events WHERE created_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl UserRepo for SqliteStore {
        async fn upsert_user(&self, user: &UserRow) -> MetadataResult<()> {
            sqlx::query(
                "INSERT INTO users (user_id, user_name, name, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(user_id) DO UPDATE SET \
                 user_name = excluded.user_name, name = excluded.name, \
                 updated_at = excluded.updated_at",
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
            let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE user_id = ?")
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
                 VALUES (?, ?, ?, ?, ?)",
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
            let row =
                sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE session_hash = ?")
                    .bind(session_hash)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn delete_session(&self, session_hash: &str) -> MetadataResult<()> {
            sqlx::query("DELETE FROM sessions WHERE session_hash = ?")
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
                "SELECT * FROM sessions WHERE user_id = ? AND expires_at > ? \
                 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(user_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn delete_expired_sessions(&self, now: OffsetDateTime) -> MetadataResult<u64> {
            let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
                .bind(now)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl CounterRepo for SqliteStore {
        async fn next_counter(&self, key: &str) -> MetadataResult<i64> {
            let value = sqlx::query_scalar::<_, i64>(
                "INSERT INTO counters (counter_key, counter_value) VALUES (?, 1) \
                 ON CONFLICT(counter_key) DO UPDATE SET counter_value = counters.counter_value + 1 \
                 RETURNING counter_value",
            )
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
            Ok(value)
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id BLOB PRIMARY KEY,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size INTEGER,
    category TEXT NOT NULL,
    encrypted INTEGER NOT NULL DEFAULT 0,
    user_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    parent_id BLOB,
    parts TEXT,
    channel_id INTEGER,
    hash TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
-- Names are unique per folder among active entries; NULL parent is the root.
CREATE UNIQUE INDEX IF NOT EXISTS idx_files_active_name
    ON files(name, coalesce(parent_id, X'00000000000000000000000000000000'), user_id)
    WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_files_parent ON files(parent_id);
CREATE INDEX IF NOT EXISTS idx_files_user_status ON files(user_id, status);
CREATE INDEX IF NOT EXISTS idx_files_channel ON files(user_id, channel_id);
CREATE INDEX IF NOT EXISTS idx_files_updated ON files(updated_at);

CREATE TABLE IF NOT EXISTS uploads (
    upload_id TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    part_no INTEGER NOT NULL,
    part_id INTEGER NOT NULL,
    channel_id INTEGER NOT NULL,
    size INTEGER NOT NULL,
    encrypted INTEGER NOT NULL DEFAULT 0,
    salt TEXT,
    block_hashes BLOB NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (upload_id, part_no)
);
CREATE INDEX IF NOT EXISTS idx_uploads_created ON uploads(created_at);
CREATE INDEX IF NOT EXISTS idx_uploads_channel ON uploads(channel_id);

CREATE TABLE IF NOT EXISTS channels (
    channel_id INTEGER PRIMARY KEY,
    channel_name TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    selected INTEGER NOT NULL DEFAULT 0
);
-- At most one selected channel per user.
CREATE UNIQUE INDEX IF NOT EXISTS idx_channels_selected ON channels(user_id) WHERE selected = 1;

CREATE TABLE IF NOT EXISTS bots (
    token TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    bot_id INTEGER NOT NULL,
    channel_id INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bots_user_channel ON bots(user_id, channel_id);

CREATE TABLE IF NOT EXISTS file_shares (
    id BLOB PRIMARY KEY,
    file_id BLOB NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL,
    password TEXT,
    expires_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_file_shares_file ON file_shares(file_id);

CREATE TABLE IF NOT EXISTS events (
    id BLOB PRIMARY KEY,
    type TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    source TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);
CREATE INDEX IF NOT EXISTS idx_events_user ON events(user_id, created_at);

CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    user_name TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    session_hash TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    session TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

CREATE TABLE IF NOT EXISTS counters (
    counter_key TEXT PRIMARY KEY,
    counter_value INTEGER NOT NULL
);
"#;
