//! In-Memory Backend
//!
//! A `StoreBackend` held entirely in process memory. Used by tests and local
//! development; supports outage injection to exercise reconnect paths.

use super::backend::*;
use crate::constants::{CHANNEL_CAPACITY, SCAN_PAGE_SIZE};
use crate::error::{Error, Result};
use crate::helpers::glob_match;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::broadcast;

pub struct MemoryBackend {
    data: Mutex<HashMap<String, FieldMap>>,
    bus: broadcast::Sender<ChannelMessage>,
    available: AtomicBool,
    failures_pending: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            data: Mutex::new(HashMap::new()),
            bus,
            available: AtomicBool::new(true),
            failures_pending: AtomicU32::new(0),
        }
    }

    /// Simulate a store outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `count` operations fail with a connection error
    pub fn fail_next(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Overwrite a raw hash, bypassing versioning (simulates foreign or corrupt writers)
    pub fn put_raw(&self, key: &str, fields: FieldMap) {
        self.data.lock().insert(key.to_string(), fields);
    }

    /// Read a raw hash
    pub fn get_raw(&self, key: &str) -> Option<FieldMap> {
        self.data.lock().get(key).cloned()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    fn check(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::connection("memory backend unavailable"));
        }
        let consumed = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(Error::connection("injected failure"));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("keys", &self.len())
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn read(&self, key: &str) -> Result<Option<FieldMap>> {
        self.check()?;
        Ok(self.data.lock().get(key).cloned())
    }

    async fn write_versioned(
        &self,
        key: &str,
        fields: &FieldMap,
        condition: WriteCondition,
        now: &str,
    ) -> Result<WriteOutcome> {
        self.check()?;
        let mut data = self.data.lock();
        let previous = data.get(key).cloned().unwrap_or_default();

        let current = match previous.get(FIELD_VERSION) {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                Error::serialization(key, format!("stored version is not an integer: {raw}"))
            })?,
            None => 0,
        };

        if let WriteCondition::Version(expected) = condition {
            if expected != current {
                return Ok(WriteOutcome::Conflict { actual: current });
            }
        }

        let version = current + 1;
        let created_at = previous
            .get(FIELD_CREATED_AT)
            .cloned()
            .unwrap_or_else(|| now.to_string());

        let mut stored = fields.clone();
        stored.insert(FIELD_VERSION.to_string(), version.to_string());
        stored.insert(FIELD_CREATED_AT.to_string(), created_at.clone());
        stored.insert(FIELD_UPDATED_AT.to_string(), now.to_string());
        data.insert(key.to_string(), stored);

        Ok(WriteOutcome::Written {
            version,
            created_at,
            previous,
        })
    }

    async fn delete(&self, key: &str) -> Result<Option<u64>> {
        self.check()?;
        Ok(self.data.lock().remove(key).map(|fields| {
            fields
                .get(FIELD_VERSION)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        }))
    }

    fn scan(&self, pattern: &str) -> KeyPageStream {
        if let Err(e) = self.check() {
            return futures::stream::iter(vec![Err(e)]).boxed();
        }

        let mut keys: Vec<String> = self
            .data
            .lock()
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();

        let pages: Vec<Result<Vec<String>>> = keys
            .chunks(SCAN_PAGE_SIZE as usize)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        futures::stream::iter(pages).boxed()
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.check()?;
        // No receivers is not an error
        let _ = self.bus.send(ChannelMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        self.check()?;
        let channel = channel.to_string();
        Ok(broadcast_stream(self.bus.subscribe(), (), move |msg: ChannelMessage| {
            (msg.channel == channel).then_some(msg)
        }))
    }

    async fn psubscribe(&self, pattern: &str) -> Result<MessageStream> {
        self.check()?;
        let pattern = pattern.to_string();
        Ok(broadcast_stream(self.bus.subscribe(), (), move |msg: ChannelMessage| {
            glob_match(&pattern, &msg.channel).then_some(msg)
        }))
    }
}
