//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Request read timeout in seconds (0 disables).
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Response write timeout in seconds (0 disables; streams can be long).
    #[serde(default)]
    pub write_timeout_secs: u64,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Upstream user ids allowed to log in. Empty allows everyone.
    #[serde(default)]
    pub allowed_users: Vec<i64>,
    /// Session lifetime in days.
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: u32,
    /// Mark the access_token cookie as Secure.
    #[serde(default)]
    pub cookie_secure: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_session_ttl_days() -> u32 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: 0,
            metrics_enabled: default_metrics_enabled(),
            allowed_users: Vec::new(),
            session_ttl_days: default_session_ttl_days(),
            cookie_secure: false,
        }
    }
}

impl ServerConfig {
    pub fn session_ttl(&self) -> time::Duration {
        time::Duration::days(self.session_ttl_days as i64)
    }

    /// Whether a user may authenticate.
    pub fn is_allowed(&self, user_id: i64) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.contains(&user_id)
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (single-host deployments and tests).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Advisory query timeout in seconds; SQLite cannot cancel statements.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer TELDRIVE_METADATA__PASSWORD over storing this in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/teldrive.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) => Ok(()),
                (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => Err(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ),
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }

    /// Whether the backend can host a shared counter and LISTEN/NOTIFY.
    pub fn is_postgres(&self) -> bool {
        matches!(self, MetadataConfig::Postgres { .. })
    }
}

/// Where channel messages physically live.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpstreamBackendConfig {
    /// Channels as directories on local disk.
    Filesystem { path: PathBuf },
    /// Volatile in-process channels.
    Memory,
}

impl Default for UpstreamBackendConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/channels"),
        }
    }
}

/// Upstream RPC configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub backend: UpstreamBackendConfig,
    /// Token bucket refill rate in requests per second.
    #[serde(default = "default_upstream_rate")]
    pub rate: u32,
    /// Token bucket burst.
    #[serde(default = "default_upstream_burst")]
    pub burst: u32,
    /// Attempts per RPC including the first.
    #[serde(default = "default_upstream_max_retries")]
    pub max_retries: u32,
    /// Evict pooled clients idle for this long.
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
    /// Deadline for a pooled client to authenticate.
    #[serde(default = "default_pool_startup_timeout_secs")]
    pub pool_startup_timeout_secs: u64,
}

fn default_upstream_rate() -> u32 {
    100
}

fn default_upstream_burst() -> u32 {
    5
}

fn default_upstream_max_retries() -> u32 {
    5
}

fn default_pool_idle_timeout_secs() -> u64 {
    300
}

fn default_pool_startup_timeout_secs() -> u64 {
    30
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            backend: UpstreamBackendConfig::default(),
            rate: default_upstream_rate(),
            burst: default_upstream_burst(),
            max_retries: default_upstream_max_retries(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
            pool_startup_timeout_secs: default_pool_startup_timeout_secs(),
        }
    }
}

impl UpstreamConfig {
    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn pool_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_startup_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.rate == 0 || self.burst == 0 {
            return Err("upstream.rate and upstream.burst must be at least 1".to_string());
        }
        if self.max_retries == 0 {
            return Err("upstream.max_retries must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Streaming configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Buffered chunks ahead of the consumer.
    #[serde(default = "default_stream_buffers")]
    pub buffers: usize,
    /// Concurrent chunk fetches; 0 selects the sequential reader.
    #[serde(default)]
    pub multi_threads: usize,
    /// Per-chunk fetch deadline.
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// Maximum bots used for streaming per user.
    #[serde(default = "default_bots_limit")]
    pub bots_limit: usize,
    /// Keep the bot round-robin counter in the metadata store.
    #[serde(default)]
    pub shared_bot_counter: bool,
}

fn default_stream_buffers() -> usize {
    8
}

fn default_chunk_timeout_secs() -> u64 {
    20
}

fn default_bots_limit() -> usize {
    5
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffers: default_stream_buffers(),
            multi_threads: 0,
            chunk_timeout_secs: default_chunk_timeout_secs(),
            bots_limit: default_bots_limit(),
            shared_bot_counter: false,
        }
    }
}

impl StreamConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.buffers == 0 {
            return Err("stream.buffers must be at least 1".to_string());
        }
        if self.chunk_timeout_secs == 0 {
            return Err("stream.chunk_timeout_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Upload configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadsConfig {
    /// Parallel part uploads per file on the server-side path.
    #[serde(default = "default_upload_threads")]
    pub threads: usize,
    /// Attempts for a single part upload.
    #[serde(default = "default_upload_max_retries")]
    pub max_retries: u32,
    /// Uncommitted parts older than this are purged.
    #[serde(default = "default_upload_retention_secs")]
    pub retention_secs: u64,
    /// Passphrase for encrypted parts. Required to write or read them.
    #[serde(default)]
    pub encryption_key: Option<String>,
    /// Largest accepted part body in bytes.
    #[serde(default = "default_max_part_size")]
    pub max_part_size: u64,
}

fn default_upload_threads() -> usize {
    4
}

fn default_upload_max_retries() -> u32 {
    10
}

fn default_upload_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_max_part_size() -> u64 {
    2000 * 1024 * 1024
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            threads: default_upload_threads(),
            max_retries: default_upload_max_retries(),
            retention_secs: default_upload_retention_secs(),
            encryption_key: None,
            max_part_size: default_max_part_size(),
        }
    }
}

impl UploadsConfig {
    pub fn retention(&self) -> time::Duration {
        let secs = i64::try_from(self.retention_secs).unwrap_or(i64::MAX);
        time::Duration::seconds(secs)
    }
}

/// Channel rollover configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Message count at which a new channel is created.
    #[serde(default = "default_message_limit")]
    pub message_limit: i64,
    /// Create new channels automatically when the limit is reached.
    #[serde(default = "default_auto_rollover")]
    pub auto_rollover: bool,
}

fn default_message_limit() -> i64 {
    500_000
}

fn default_auto_rollover() -> bool {
    true
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            message_limit: default_message_limit(),
            auto_rollover: default_auto_rollover(),
        }
    }
}

/// Event delivery mode.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventsMode {
    /// Single instance: local fan-out plus a lazy database poller.
    #[default]
    Polling,
    /// Multi-instance: publish to a shared topic and fan out locally.
    Pubsub,
}

/// Event broadcaster configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub mode: EventsMode,
    #[serde(default = "default_db_workers")]
    pub db_workers: usize,
    #[serde(default = "default_db_buffer_size")]
    pub db_buffer_size: usize,
    #[serde(default = "default_deduplication_ttl_secs")]
    pub deduplication_ttl_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
}

fn default_db_workers() -> usize {
    4
}

fn default_db_buffer_size() -> usize {
    1000
}

fn default_deduplication_ttl_secs() -> u64 {
    1800
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_reconnect_backoff_secs() -> u64 {
    5
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            mode: EventsMode::default(),
            db_workers: default_db_workers(),
            db_buffer_size: default_db_buffer_size(),
            deduplication_ttl_secs: default_deduplication_ttl_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
        }
    }
}

impl EventsConfig {
    pub fn deduplication_ttl(&self) -> Duration {
        Duration::from_secs(self.deduplication_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.db_workers == 0 || self.db_buffer_size == 0 {
            return Err("events.db_workers and events.db_buffer_size must be at least 1".into());
        }
        Ok(())
    }
}

/// Blob cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
}

fn default_cache_max_entries() -> usize {
    100_000
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            default_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Background job configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default = "default_cron_enabled")]
    pub enabled: bool,
    #[serde(default = "default_clean_files_interval_secs")]
    pub clean_files_interval_secs: u64,
    #[serde(default = "default_clean_uploads_interval_secs")]
    pub clean_uploads_interval_secs: u64,
    #[serde(default = "default_clean_events_interval_secs")]
    pub clean_events_interval_secs: u64,
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: u32,
}

fn default_cron_enabled() -> bool {
    true
}

fn default_clean_files_interval_secs() -> u64 {
    3600
}

fn default_clean_uploads_interval_secs() -> u64 {
    12 * 3600
}

fn default_clean_events_interval_secs() -> u64 {
    24 * 3600
}

fn default_event_retention_days() -> u32 {
    5
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: default_cron_enabled(),
            clean_files_interval_secs: default_clean_files_interval_secs(),
            clean_uploads_interval_secs: default_clean_uploads_interval_secs(),
            clean_events_interval_secs: default_clean_events_interval_secs(),
            event_retention_days: default_event_retention_days(),
        }
    }
}

impl CronConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if self.clean_files_interval_secs == 0
            || self.clean_uploads_interval_secs == 0
            || self.clean_events_interval_secs == 0
        {
            return Err("cron intervals cannot be 0 (tokio::time::interval would panic)".into());
        }
        Ok(())
    }
}

/// HTTP rate limiting configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Requests per minute per client IP for unauthenticated routes.
    #[serde(default = "default_ip_requests_per_minute")]
    pub ip_requests_per_minute: u32,
    /// Requests per minute per authenticated user.
    #[serde(default = "default_user_requests_per_minute")]
    pub user_requests_per_minute: u32,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// Proxies whose X-Forwarded-For / X-Real-IP headers are trusted.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Tracked keys before new ones are rejected.
    #[serde(default = "default_max_entries")]
    pub max_entries: u32,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: u64,
}

fn default_ip_requests_per_minute() -> u32 {
    120
}

fn default_user_requests_per_minute() -> u32 {
    1200
}

fn default_burst_size() -> u32 {
    50
}

fn default_max_entries() -> u32 {
    100_000
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_entry_ttl_secs() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ip_requests_per_minute: default_ip_requests_per_minute(),
            user_requests_per_minute: default_user_requests_per_minute(),
            burst_size: default_burst_size(),
            trusted_proxies: Vec::new(),
            max_entries: default_max_entries(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            entry_ttl_secs: default_entry_ttl_secs(),
        }
    }
}

impl RateLimitConfig {
    /// Returns warnings for insecure-but-allowed settings.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();
        if !self.enabled {
            return Ok(warnings);
        }
        if self.cleanup_interval_secs == 0 {
            return Err("rate_limit.cleanup_interval_secs cannot be 0".to_string());
        }
        if self.ip_requests_per_minute == 0 || self.user_requests_per_minute == 0 {
            return Err("rate_limit requests per minute must be at least 1".to_string());
        }
        if self.trusted_proxies.len() == 1 && self.trusted_proxies[0] == "*" {
            warnings.push(
                "rate_limit.trusted_proxies=['*'] trusts all forwarded headers; \
                 clients can spoof their address"
                    .to_string(),
            );
        }
        if self.entry_ttl_secs < 120 {
            warnings.push(format!(
                "rate_limit.entry_ttl_secs={} is shorter than two rate windows",
                self.entry_ttl_secs
            ));
        }
        Ok(warnings)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    /// Test configuration: in-memory upstream, SQLite metadata, no cron.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            upstream: UpstreamConfig {
                backend: UpstreamBackendConfig::Memory,
                rate: 10_000,
                burst: 10_000,
                ..UpstreamConfig::default()
            },
            cron: CronConfig {
                enabled: false,
                ..CronConfig::default()
            },
            uploads: UploadsConfig {
                encryption_key: Some("test-passphrase".to_string()),
                ..UploadsConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate every section. Returns accumulated warnings.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        self.metadata.validate()?;
        self.upstream.validate()?;
        self.stream.validate()?;
        self.events.validate()?;
        self.cron.validate()?;
        let mut warnings = self.rate_limit.validate()?;
        if self.events.mode == EventsMode::Pubsub && !self.metadata.is_postgres() {
            warnings.push(
                "events.mode=pubsub without PostgreSQL only fans out within this process"
                    .to_string(),
            );
        }
        if self.stream.shared_bot_counter && !self.metadata.is_postgres() {
            warnings.push(
                "stream.shared_bot_counter on SQLite is only shared by processes using the same file"
                    .to_string(),
            );
        }
        Ok(warnings)
    }
}
