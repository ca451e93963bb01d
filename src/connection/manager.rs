//! Connection Manager
//!
//! Owns the shared store backend, bounds concurrent use of it, retries
//! transient failures with exponential backoff and tracks store health.
//!
//! ## Health model
//!
//! ```text
//!   healthy ──(retries exhausted / health probe fails)──▶ unhealthy
//!      ▲                                                    │
//!      └────────────(recovery probe succeeds)───────────────┘
//! ```
//!
//! While unhealthy, `acquire` and `execute` block until the store is healthy
//! again or the caller's timeout elapses. Nothing is dropped silently.

use super::backend::{KeyPageStream, StoreBackend};
use super::backoff::Backoff;
use super::memory::MemoryBackend;
use super::redis::RedisBackend;
use crate::config::{RetryConfig, StoreConfig};
use crate::error::{Error, Result};
use ahash::AHashSet;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};

/// Result of a health probe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: bool,
    /// Round-trip time of the probe (None if it failed)
    pub latency: Option<Duration>,
}

/// A checked-out slot of the pool; the slot is returned on drop
pub struct ConnectionHandle {
    backend: Arc<dyn StoreBackend>,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionHandle {
    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("backend", &self.backend.name())
            .finish()
    }
}

struct Inner {
    backend: Arc<dyn StoreBackend>,
    permits: Arc<Semaphore>,
    pool_size: usize,
    retry: RetryConfig,
    op_timeout: Duration,
    health: watch::Sender<bool>,
    probing: AtomicBool,
}

/// Shared, cloneable handle to the store connection pool
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn StoreBackend>, store: &StoreConfig, retry: RetryConfig) -> Self {
        let pool_size = store.pool_size.max(1);
        let (health, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                backend,
                permits: Arc::new(Semaphore::new(pool_size)),
                pool_size,
                retry,
                op_timeout: store.op_timeout(),
                health,
                probing: AtomicBool::new(false),
            }),
        }
    }

    /// Connect to the Redis store named in `store.url`
    pub async fn connect(store: &StoreConfig, retry: RetryConfig) -> Result<Self> {
        let backend = RedisBackend::connect(&store.url, store.pool_size).await?;
        Ok(Self::new(Arc::new(backend), store, retry))
    }

    /// Manager over a fresh in-memory backend (tests and local development)
    pub fn in_memory(store: &StoreConfig, retry: RetryConfig) -> (Self, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let manager = Self::new(backend.clone(), store, retry);
        (manager, backend)
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.op_timeout
    }

    pub fn is_healthy(&self) -> bool {
        *self.inner.health.borrow()
    }

    /// Watch health transitions (`true` = healthy)
    pub fn health_watch(&self) -> watch::Receiver<bool> {
        self.inner.health.subscribe()
    }

    /// Check out a pool slot, waiting for the store to be healthy.
    ///
    /// Fails with a connection error if `timeout` (or the configured default)
    /// elapses first.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<ConnectionHandle> {
        let timeout = timeout.unwrap_or(self.inner.op_timeout);
        tokio::time::timeout(timeout, self.acquire_inner())
            .await
            .map_err(|_| Error::connection(format!("no healthy connection within {timeout:?}")))?
    }

    async fn acquire_inner(&self) -> Result<ConnectionHandle> {
        self.wait_healthy().await;
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::connection("connection pool closed"))?;
        Ok(ConnectionHandle {
            backend: self.inner.backend.clone(),
            _permit: permit,
        })
    }

    async fn wait_healthy(&self) {
        let mut rx = self.inner.health.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|healthy| *healthy).await;
    }

    /// Run `op` against the store, retrying transient failures with backoff.
    ///
    /// When the retry budget is exhausted the manager marks itself unhealthy,
    /// starts a recovery probe and keeps waiting. Only the timeout surfaces a
    /// connection error; every other error is returned as-is.
    pub async fn execute<T, F, Fut>(&self, timeout: Option<Duration>, mut op: F) -> Result<T>
    where
        F: FnMut(Arc<dyn StoreBackend>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let timeout = timeout.unwrap_or(self.inner.op_timeout);
        let attempt_loop = async {
            let mut backoff = Backoff::new(self.inner.retry.clone());
            loop {
                let handle = self.acquire_inner().await?;
                let result = op(handle.backend().clone()).await;
                drop(handle);

                match result {
                    Err(e) if e.is_transient() => self.back_off(&mut backoff, &e).await,
                    other => return other,
                }
            }
        };

        match tokio::time::timeout(timeout, attempt_loop).await {
            Ok(result) => result,
            Err(_) => Err(Error::connection(format!(
                "store operation abandoned after {timeout:?}"
            ))),
        }
    }

    /// Lazily scan keys matching `pattern`.
    ///
    /// Each page is fetched like an `execute` call: it holds a pool slot, waits
    /// out outages and retries transient failures until `timeout`. A failed
    /// scan restarts from the first page; keys already yielded are skipped.
    /// The stream ends after the first error it yields.
    pub fn scan(&self, pattern: &str, timeout: Option<Duration>) -> KeyPageStream {
        let cursor = ScanCursor {
            manager: self.clone(),
            pattern: pattern.to_string(),
            timeout: timeout.unwrap_or(self.inner.op_timeout),
            pages: None,
            seen: AHashSet::new(),
        };
        futures::stream::unfold(Some(cursor), |cursor| async move {
            let mut cursor = cursor?;
            match cursor.next_page().await {
                Ok(Some(keys)) => Some((Ok(keys), Some(cursor))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }

    /// Sleep before the next attempt, or mark the store unhealthy and start
    /// over once the retry budget is spent
    async fn back_off(&self, backoff: &mut Backoff, error: &Error) {
        match backoff.next_delay() {
            Some(delay) => {
                tracing::warn!(
                    "{}: {} - retrying in {}ms (attempt {}/{})",
                    self.inner.backend.name(),
                    error,
                    delay.as_millis(),
                    backoff.attempt_count(),
                    backoff.limit_label()
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                self.mark_unhealthy(&error.to_string());
                backoff.reset();
            }
        }
    }

    /// Probe the store once and update the health state accordingly
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let probe = tokio::time::timeout(self.inner.op_timeout, self.inner.backend.ping()).await;
        match probe {
            Ok(Ok(())) => {
                let latency = started.elapsed();
                self.mark_healthy();
                HealthReport {
                    healthy: true,
                    latency: Some(latency),
                }
            }
            Ok(Err(e)) => {
                self.mark_unhealthy(&e.to_string());
                HealthReport {
                    healthy: false,
                    latency: None,
                }
            }
            Err(_) => {
                self.mark_unhealthy("health probe timed out");
                HealthReport {
                    healthy: false,
                    latency: None,
                }
            }
        }
    }

    /// Spawn a background task that probes health every `interval`
    pub fn spawn_monitor(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.health_check().await;
            }
        })
    }

    fn mark_healthy(&self) {
        let changed = self.inner.health.send_if_modified(|healthy| {
            let was = *healthy;
            *healthy = true;
            !was
        });
        if changed {
            tracing::info!("{}: Connected", self.inner.backend.name());
        }
    }

    /// Mark the store unhealthy and start the recovery probe if not running
    fn mark_unhealthy(&self, reason: &str) {
        let changed = self.inner.health.send_if_modified(|healthy| {
            let was = *healthy;
            *healthy = false;
            was
        });
        if changed {
            tracing::warn!("{}: Disconnected - {}", self.inner.backend.name(), reason);
        }
        self.start_recovery();
    }

    fn start_recovery(&self) {
        if self.inner.probing.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            // Recovery never gives up; the interval is capped by max_delay
            let mut backoff = Backoff::new(RetryConfig {
                max_attempts: 0,
                ..manager.inner.retry.clone()
            });
            loop {
                let ping = tokio::time::timeout(
                    manager.inner.op_timeout,
                    manager.inner.backend.ping(),
                )
                .await;
                if matches!(ping, Ok(Ok(()))) {
                    manager.inner.probing.store(false, Ordering::SeqCst);
                    manager.mark_healthy();
                    return;
                }
                let delay = backoff.next_delay().unwrap_or(manager.inner.retry.max_delay());
                tracing::info!(
                    "{}: Reconnecting in {}ms (attempt {}/∞)",
                    manager.inner.backend.name(),
                    delay.as_millis(),
                    backoff.attempt_count()
                );
                tokio::time::sleep(delay).await;
            }
        });
    }
}

/// Resumable state of one `ConnectionManager::scan`
struct ScanCursor {
    manager: ConnectionManager,
    pattern: String,
    timeout: Duration,
    pages: Option<KeyPageStream>,
    seen: AHashSet<String>,
}

impl ScanCursor {
    async fn next_page(&mut self) -> Result<Option<Vec<String>>> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(Error::connection(format!(
                "scan of {} abandoned after {timeout:?}",
                self.pattern
            ))),
        }
    }

    async fn fetch(&mut self) -> Result<Option<Vec<String>>> {
        let mut backoff = Backoff::new(self.manager.inner.retry.clone());
        loop {
            let handle = self.manager.acquire_inner().await?;
            let pattern = &self.pattern;
            let pages = self
                .pages
                .get_or_insert_with(|| handle.backend().scan(pattern));
            let page = pages.next().await;
            drop(handle);

            match page {
                None => return Ok(None),
                Some(Ok(keys)) => {
                    let fresh = keys
                        .into_iter()
                        .filter(|key| self.seen.insert(key.clone()))
                        .collect();
                    return Ok(Some(fresh));
                }
                Some(Err(e)) if e.is_transient() => {
                    self.pages = None;
                    self.manager.back_off(&mut backoff, &e).await;
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("backend", &self.inner.backend.name())
            .field("pool_size", &self.inner.pool_size)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts,
        }
    }

    fn store_config(pool_size: usize) -> StoreConfig {
        StoreConfig {
            pool_size,
            op_timeout_ms: 2_000,
            ..StoreConfig::default()
        }
    }

    #[tokio::test]
    async fn test_execute_retries_transient_failures() {
        let (manager, backend) = ConnectionManager::in_memory(&store_config(2), fast_retry(0));
        backend.fail_next(3);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        manager
            .execute(None, move |b| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { b.ping().await }
            })
            .await
            .expect("eventually succeeds");

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(manager.is_healthy());
    }

    #[tokio::test]
    async fn test_non_transient_errors_are_not_retried() {
        let (manager, _backend) = ConnectionManager::in_memory(&store_config(1), fast_retry(0));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = manager
            .execute(None, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::not_found("Record", "x")) }
            })
            .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_unhealthy_then_recover() {
        let (manager, backend) = ConnectionManager::in_memory(&store_config(1), fast_retry(2));
        backend.set_available(false);

        let mut health = manager.health_watch();
        let op = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute(Some(Duration::from_secs(5)), |b| async move { b.ping().await })
                    .await
            })
        };

        health.wait_for(|h| !*h).await.expect("became unhealthy");
        assert!(!manager.is_healthy());

        backend.set_available(true);
        health.wait_for(|h| *h).await.expect("recovered");
        op.await.expect("join").expect("operation completed after recovery");
    }

    #[tokio::test]
    async fn test_timeout_surfaces_connection_error() {
        let (manager, backend) = ConnectionManager::in_memory(&store_config(1), fast_retry(0));
        backend.set_available(false);

        let err = manager
            .execute(Some(Duration::from_millis(50)), |b| async move {
                b.ping().await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_scan_waits_out_outage() {
        let (manager, backend) = ConnectionManager::in_memory(&store_config(1), fast_retry(2));
        for i in 0..150 {
            backend.put_raw(&format!("ns:t:{i}"), Default::default());
        }
        backend.set_available(false);
        let restore = {
            let backend = backend.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                backend.set_available(true);
            })
        };

        let pages: Vec<Result<Vec<String>>> = manager.scan("ns:t:*", None).collect().await;
        restore.await.expect("join");
        let keys: Vec<String> = pages
            .into_iter()
            .flat_map(|page| page.expect("page"))
            .collect();
        assert_eq!(keys.len(), 150);
        assert!(manager.is_healthy());
    }

    #[tokio::test]
    async fn test_scan_holds_a_pool_slot_per_page() {
        let (manager, backend) = ConnectionManager::in_memory(&store_config(1), fast_retry(0));
        backend.put_raw("ns:t:1", Default::default());

        let held = manager.acquire(None).await.expect("slot");
        let blocked: Vec<_> = manager
            .scan("ns:t:*", Some(Duration::from_millis(30)))
            .collect()
            .await;
        assert!(matches!(blocked.as_slice(), [Err(Error::Connection { .. })]));

        drop(held);
        let pages: Vec<_> = manager.scan("ns:t:*", None).collect().await;
        assert_eq!(pages.len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_is_bounded_by_pool_size() {
        let (manager, _backend) = ConnectionManager::in_memory(&store_config(1), fast_retry(0));
        let held = manager.acquire(None).await.expect("first slot");
        let second = manager.acquire(Some(Duration::from_millis(30))).await;
        assert!(matches!(second, Err(Error::Connection { .. })));
        drop(held);
        assert!(manager.acquire(Some(Duration::from_millis(30))).await.is_ok());
    }

    #[tokio::test]
    async fn test_health_check_reports_latency() {
        let (manager, backend) = ConnectionManager::in_memory(&store_config(1), fast_retry(0));
        let report = manager.health_check().await;
        assert!(report.healthy);
        assert!(report.latency.is_some());

        backend.set_available(false);
        let report = manager.health_check().await;
        assert!(!report.healthy);
        assert!(!manager.is_healthy());

        backend.set_available(true);
        let mut health = manager.health_watch();
        health.wait_for(|h| *h).await.expect("recovered");
    }
}
