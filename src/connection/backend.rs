//! Store Backend
//!
//! The narrow set of key-value store primitives the core relies on. The Redis
//! implementation talks to a real server; the in-memory one is the test double.

use crate::error::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use tokio::sync::broadcast;

/// Field name → stored string value of one record hash
pub type FieldMap = BTreeMap<String, String>;

/// Bookkeeping fields written next to the persisted fields of every record
pub const FIELD_VERSION: &str = "version";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_UPDATED_AT: &str = "updated_at";
pub const RESERVED_FIELDS: &[&str] = &[FIELD_VERSION, FIELD_CREATED_AT, FIELD_UPDATED_AT];

/// Precondition of a versioned write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteCondition {
    /// Last write wins
    Any,
    /// Stored version must equal this value (0 = key must be absent)
    Version(u64),
}

/// Result of a versioned write
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written {
        version: u64,
        created_at: String,
        /// Hash contents before the write (empty for a new key)
        previous: FieldMap,
    },
    Conflict {
        actual: u64,
    },
}

/// A message received on a pub/sub channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// One item of a subscription stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Message(ChannelMessage),
    /// The subscriber fell behind and this many messages were dropped
    Lagged(u64),
}

/// Infinite stream of deliveries; ends only if the backend shuts down
pub type MessageStream = BoxStream<'static, Delivery>;

/// Stream of key pages produced by a scan
pub type KeyPageStream = BoxStream<'static, Result<Vec<String>>>;

#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Backend name (for logging)
    fn name(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    /// Read the whole hash at `key`; `None` when absent
    async fn read(&self, key: &str) -> Result<Option<FieldMap>>;

    /// Atomically replace the hash at `key` with `fields` plus bookkeeping.
    ///
    /// The stored version is incremented by one (absent keys count as version 0),
    /// `created_at` is preserved across writes and `updated_at` is set to `now`.
    /// When `condition` does not hold nothing is written.
    async fn write_versioned(
        &self,
        key: &str,
        fields: &FieldMap,
        condition: WriteCondition,
        now: &str,
    ) -> Result<WriteOutcome>;

    /// Atomically delete `key`, returning the version it held (`None` when
    /// absent, 0 when it carried no readable version)
    async fn delete(&self, key: &str) -> Result<Option<u64>>;

    /// Lazily scan keys matching a `*` pattern, one page at a time
    fn scan(&self, pattern: &str) -> KeyPageStream;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Messages published on `channel` after this call returns
    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;

    /// Messages published on any channel matching `pattern` after this call returns
    async fn psubscribe(&self, pattern: &str) -> Result<MessageStream>;
}

/// Turn a broadcast receiver into a message stream.
///
/// Lag is reported as `Delivery::Lagged` so consumers can reconcile. `guard`
/// lives as long as the stream does.
pub(crate) fn broadcast_stream<T, G, F>(rx: broadcast::Receiver<T>, guard: G, map: F) -> MessageStream
where
    T: Clone + Send + 'static,
    G: Send + 'static,
    F: FnMut(T) -> Option<ChannelMessage> + Send + 'static,
{
    futures::stream::unfold((rx, guard, map), |(mut rx, guard, mut map)| async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    if let Some(message) = map(item) {
                        return Some((Delivery::Message(message), (rx, guard, map)));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Subscriber lagged, {} messages dropped", skipped);
                    return Some((Delivery::Lagged(skipped), (rx, guard, map)));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// Live stream count per channel or pattern.
///
/// The server-side subscription is made when the first stream appears and
/// dropped when the last one goes away.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionCounts {
    counts: tokio::sync::Mutex<HashMap<String, usize>>,
}

impl SubscriptionCounts {
    /// Count one more stream on `name`, running `subscribe` if it is the first
    pub async fn retain<F, Fut>(&self, name: &str, subscribe: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut counts = self.counts.lock().await;
        let current = counts.get(name).copied().unwrap_or(0);
        if current == 0 {
            subscribe().await?;
        }
        counts.insert(name.to_string(), current + 1);
        Ok(())
    }

    /// Count one stream less on `name`, running `unsubscribe` if none remain
    pub async fn release<F, Fut>(&self, name: &str, unsubscribe: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut counts = self.counts.lock().await;
        let Some(count) = counts.get_mut(name) else {
            return Ok(());
        };
        *count = count.saturating_sub(1);
        if *count > 0 {
            return Ok(());
        }
        counts.remove(name);
        unsubscribe().await
    }

    #[cfg(test)]
    pub async fn live(&self, name: &str) -> usize {
        self.counts.lock().await.get(name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn message(payload: &str) -> ChannelMessage {
        ChannelMessage {
            channel: "c".into(),
            payload: payload.into(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_stream_reports_lag() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = broadcast_stream(rx, (), Some);
        for i in 0..5 {
            tx.send(message(&i.to_string())).expect("send");
        }

        assert_eq!(stream.next().await, Some(Delivery::Lagged(3)));
        assert_eq!(stream.next().await, Some(Delivery::Message(message("3"))));
        assert_eq!(stream.next().await, Some(Delivery::Message(message("4"))));
    }

    #[tokio::test]
    async fn test_guard_dropped_with_stream() {
        let (_tx, rx) = broadcast::channel::<ChannelMessage>(2);
        let guard = Arc::new(());
        let stream = broadcast_stream(rx, guard.clone(), Some);
        assert_eq!(Arc::strong_count(&guard), 2);
        drop(stream);
        assert_eq!(Arc::strong_count(&guard), 1);
    }

    #[tokio::test]
    async fn test_subscription_counts() {
        let counts = SubscriptionCounts::default();
        let subscribes = AtomicU32::new(0);
        let unsubscribes = AtomicU32::new(0);
        let subscribe = || async {
            subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        let unsubscribe = || async {
            unsubscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };

        counts.retain("a", subscribe).await.expect("retain");
        counts.retain("a", subscribe).await.expect("retain");
        assert_eq!(subscribes.load(Ordering::SeqCst), 1);
        assert_eq!(counts.live("a").await, 2);

        counts.release("a", unsubscribe).await.expect("release");
        assert_eq!(unsubscribes.load(Ordering::SeqCst), 0);
        counts.release("a", unsubscribe).await.expect("release");
        assert_eq!(unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(counts.live("a").await, 0);

        // A release without a matching retain is ignored
        counts.release("a", unsubscribe).await.expect("release");
        assert_eq!(unsubscribes.load(Ordering::SeqCst), 1);

        counts.retain("a", subscribe).await.expect("retain");
        assert_eq!(subscribes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_subscribe_is_not_counted() {
        let counts = SubscriptionCounts::default();
        let err = counts
            .retain("a", || async { Err(crate::Error::connection("down")) })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(counts.live("a").await, 0);
    }
}
