//! Pool of authenticated upstream clients.
//!
//! Clients are keyed by `(user_id, token)`; an empty token means the user's
//! personal session. Creation is serialised per key so racing callers share
//! one connection. Each client owns a long-lived task that authenticates
//! under a startup deadline and then parks on its cancellation token until
//! the client is evicted or the pool is closed.

use crate::error::{UpstreamError, UpstreamResult};
use crate::retry::{RetryClient, RetryPolicy};
use crate::traits::{Connector, Credential, UpstreamClient};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PoolKey {
    user_id: i64,
    token: String,
}

struct PooledClient {
    client: Arc<dyn UpstreamClient>,
    cancel: CancellationToken,
    /// Milliseconds since `ClientPool::epoch` at last checkout.
    last_used: AtomicU64,
}

/// Process-wide cache of authenticated clients.
pub struct ClientPool {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    startup_timeout: Duration,
    idle_timeout: Duration,
    clients: RwLock<HashMap<PoolKey, Arc<PooledClient>>>,
    creating: DashMap<PoolKey, Arc<Mutex<()>>>,
    shutdown: CancellationToken,
    epoch: Instant,
}

impl ClientPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
        startup_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            policy,
            startup_timeout,
            idle_timeout,
            clients: RwLock::new(HashMap::new()),
            creating: DashMap::new(),
            shutdown: CancellationToken::new(),
            epoch: Instant::now(),
        }
    }

    pub fn from_config(
        connector: Arc<dyn Connector>,
        config: &teldrive_core::config::UpstreamConfig,
    ) -> Self {
        Self::new(
            connector,
            RetryPolicy::from_config(config),
            config.pool_startup_timeout(),
            config.pool_idle_timeout(),
        )
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn lookup(&self, key: &PoolKey) -> Option<Arc<dyn UpstreamClient>> {
        let clients = self.clients.read().unwrap_or_else(|p| p.into_inner());
        let pooled = clients.get(key)?;
        if pooled.cancel.is_cancelled() {
            return None;
        }
        pooled.last_used.store(self.now_ms(), Ordering::Relaxed);
        Some(Arc::clone(&pooled.client))
    }

    /// Get or create the authenticated client for a user and credential.
    pub async fn get(
        &self,
        user_id: i64,
        credential: &Credential,
    ) -> UpstreamResult<Arc<dyn UpstreamClient>> {
        if self.shutdown.is_cancelled() {
            return Err(UpstreamError::Closed);
        }
        let key = PoolKey {
            user_id,
            token: credential.pool_token().to_string(),
        };
        if let Some(client) = self.lookup(&key) {
            return Ok(client);
        }

        let gate = Arc::clone(
            &self
                .creating
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        let _guard = gate.lock().await;
        if let Some(client) = self.lookup(&key) {
            return Ok(client);
        }

        let pooled = self.start_client(user_id, credential).await?;
        let client = Arc::clone(&pooled.client);
        self.clients
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, pooled);
        Ok(client)
    }

    async fn start_client(
        &self,
        user_id: i64,
        credential: &Credential,
    ) -> UpstreamResult<Arc<PooledClient>> {
        let raw = self.connector.connect(user_id, credential).await?;
        let client: Arc<dyn UpstreamClient> = Arc::new(RetryClient::new(raw, self.policy));
        let cancel = self.shutdown.child_token();
        let expect_bot = credential.is_bot();

        let (ready_tx, ready_rx) = oneshot::channel();
        let task_client = Arc::clone(&client);
        let task_cancel = cancel.clone();
        let startup_timeout = self.startup_timeout;
        tokio::spawn(async move {
            let auth = tokio::select! {
                _ = task_cancel.cancelled() => Err(UpstreamError::Closed),
                res = tokio::time::timeout(startup_timeout, task_client.self_info()) => match res {
                    Ok(Ok(identity)) if identity.is_bot != expect_bot => Err(UpstreamError::Unauthorized(
                        "credential kind does not match account".into(),
                    )),
                    Ok(other) => other,
                    Err(_) => Err(UpstreamError::Timeout("client startup".into())),
                },
            };
            let ok = auth.is_ok();
            if let Ok(identity) = &auth {
                tracing::debug!(user_id, account = identity.user_id, is_bot = identity.is_bot, "upstream client ready");
            }
            let _ = ready_tx.send(auth);
            if ok {
                task_cancel.cancelled().await;
                tracing::debug!(user_id, "upstream client stopped");
            }
        });

        match ready_rx.await {
            Ok(Ok(_)) => Ok(Arc::new(PooledClient {
                client,
                cancel,
                last_used: AtomicU64::new(self.now_ms()),
            })),
            Ok(Err(err)) => {
                cancel.cancel();
                tracing::warn!(user_id, error = %err, "upstream client failed to start");
                Err(err)
            }
            Err(_) => {
                cancel.cancel();
                Err(UpstreamError::Closed)
            }
        }
    }

    /// Drop clients unused for longer than the idle window. Returns how many.
    pub fn evict_idle(&self) -> usize {
        let cutoff = self
            .now_ms()
            .saturating_sub(self.idle_timeout.as_millis() as u64);
        let mut clients = self.clients.write().unwrap_or_else(|p| p.into_inner());
        let before = clients.len();
        clients.retain(|_, pooled| {
            let keep = !pooled.cancel.is_cancelled()
                && pooled.last_used.load(Ordering::Relaxed) >= cutoff;
            if !keep {
                pooled.cancel.cancel();
            }
            keep
        });
        let evicted = before - clients.len();
        drop(clients);
        self.creating.retain(|_, gate| Arc::strong_count(gate) > 1);
        evicted
    }

    /// Number of live pooled clients.
    pub fn len(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every client and refuse new ones.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.clients
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryConnector, MemoryNetwork};

    fn new_pool(network: Arc<MemoryNetwork>, idle: Duration) -> ClientPool {
        ClientPool::new(
            Arc::new(MemoryConnector::new(network)),
            RetryPolicy::default(),
            Duration::from_secs(5),
            idle,
        )
    }

    #[tokio::test]
    async fn test_same_key_returns_same_client() {
        let pool = new_pool(MemoryNetwork::new(), Duration::from_secs(60));
        let cred = Credential::Session("1:s".into());
        let a = pool.get(1, &cred).await.unwrap();
        let b = pool.get(1, &cred).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let bot = pool.get(1, &Credential::Bot("9:t".into())).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &bot));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_creation() {
        let pool = Arc::new(new_pool(MemoryNetwork::new(), Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.get(1, &Credential::Session("1:s".into())).await.unwrap()
            }));
        }
        let clients: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(clients.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_credential_is_not_pooled() {
        let network = MemoryNetwork::new();
        let pool = new_pool(Arc::clone(&network), Duration::from_secs(60));
        pool.get(1, &Credential::Session("1:right".into()))
            .await
            .unwrap();
        pool.evict_idle();

        let pool2 = new_pool(network, Duration::from_secs(60));
        assert!(
            pool2
                .get(1, &Credential::Session("1:wrong".into()))
                .await
                .is_err()
        );
        assert!(pool2.is_empty());
    }

    #[tokio::test]
    async fn test_idle_eviction_and_close() {
        let pool = new_pool(MemoryNetwork::new(), Duration::ZERO);
        pool.get(1, &Credential::Session("1:s".into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(pool.evict_idle(), 1);
        assert!(pool.is_empty());

        pool.close();
        assert!(matches!(
            pool.get(1, &Credential::Session("1:s".into())).await,
            Err(UpstreamError::Closed)
        ));
    }
}
