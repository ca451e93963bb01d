//! Record Store
//!
//! Generic save/load/delete/list of `Persistable` records.
//!
//! ## Write policy
//!
//! Every save overwrites the whole set of declared fields in one atomic store
//! operation and bumps the version. `save` is last-write-wins;
//! `save_if_version` only writes when the stored version still matches, and
//! `save_if_version(record, 0)` only creates. Concurrent writers of disjoint
//! fields are not merged: use `save_if_version` and reload on conflict.

use super::record::*;
use crate::bus::{StateBus, StateEvent};
use crate::connection::{ConnectionManager, FieldMap, WriteCondition, WriteOutcome};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Lazy, restartable sequence of records
pub type RecordStream<T> = BoxStream<'static, Result<T>>;

#[derive(Clone)]
pub struct RecordStore {
    conn: ConnectionManager,
    bus: StateBus,
    namespace: Arc<str>,
    timeout: Option<Duration>,
    registered: Arc<Mutex<HashSet<&'static str>>>,
}

impl RecordStore {
    pub fn new(conn: ConnectionManager, bus: StateBus) -> Self {
        let namespace: Arc<str> = bus.namespace().into();
        Self {
            conn,
            bus,
            namespace,
            timeout: None,
            registered: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// A view of this store whose operations are abandoned after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self.clone()
        }
    }

    pub fn bus(&self) -> &StateBus {
        &self.bus
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.conn
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `{namespace}:{type}:{id}`
    pub fn key(&self, record_type: &str, id: &str) -> String {
        format!("{}:{}:{}", self.namespace, record_type, id)
    }

    /// Validate the static schema of `T`; done implicitly on first use
    pub fn register<T: Persistable>(&self) -> Result<RecordSchema> {
        let schema = RecordSchema::of::<T>();
        if self.registered.lock().contains(T::TYPE_NAME) {
            return Ok(schema);
        }
        schema.validate()?;
        self.registered.lock().insert(T::TYPE_NAME);
        tracing::debug!(
            "Registered record type {} ({} persisted fields, publish={})",
            schema.type_name,
            schema.fields.len(),
            schema.publish_changes
        );
        Ok(schema)
    }

    /// Last-write-wins save. Returns the new version and updates `record.meta()`.
    pub async fn save<T: Persistable>(&self, record: &mut T) -> Result<u64> {
        self.write(record, WriteCondition::Any).await
    }

    /// Save only if the stored version equals `expected_version`.
    ///
    /// Fails with `Conflict` otherwise, leaving stored state untouched.
    pub async fn save_if_version<T: Persistable>(
        &self,
        record: &mut T,
        expected_version: u64,
    ) -> Result<u64> {
        self.write(record, WriteCondition::Version(expected_version))
            .await
    }

    async fn write<T: Persistable>(&self, record: &mut T, condition: WriteCondition) -> Result<u64> {
        self.register::<T>()?;
        validate_segment("record id", record.id())?;

        let key = self.key(T::TYPE_NAME, record.id());
        let fields = encode_record(&key, record)?;
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let outcome = {
            let key = key.clone();
            let fields = fields.clone();
            self.conn
                .execute(self.timeout, move |backend| {
                    let key = key.clone();
                    let fields = fields.clone();
                    let now = now_str.clone();
                    async move { backend.write_versioned(&key, &fields, condition, &now).await }
                })
                .await?
        };

        match outcome {
            WriteOutcome::Conflict { actual } => {
                let expected = match condition {
                    WriteCondition::Version(v) => v,
                    WriteCondition::Any => actual,
                };
                tracing::debug!("Conflict on {}: expected v{}, found v{}", key, expected, actual);
                Err(Error::Conflict {
                    key,
                    expected,
                    actual,
                })
            }
            WriteOutcome::Written {
                version,
                created_at,
                previous,
            } => {
                let created_at = parse_timestamp(&key, Some(created_at))?;
                let meta = record.meta_mut();
                meta.version = version;
                meta.created_at = created_at;
                meta.updated_at = Some(now);
                tracing::debug!("Saved {} v{}", key, version);

                if T::PUBLISH_CHANGES {
                    let changed = changed_fields(&previous, &fields);
                    self.notify(T::TYPE_NAME, record.id(), changed, version, now, false)
                        .await;
                }
                Ok(version)
            }
        }
    }

    /// Reload-modify-CAS loop.
    ///
    /// `apply` mutates a freshly loaded record and returns whether it needs to
    /// be written. On `Conflict` the record is reloaded and `apply` runs again,
    /// up to `attempts` times, after which the conflict is returned.
    pub async fn update<T, F>(&self, id: &str, attempts: u32, mut apply: F) -> Result<T>
    where
        T: Persistable,
        F: FnMut(&mut T) -> Result<bool> + Send,
    {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut record: T = self.load(id).await?;
            if !apply(&mut record)? {
                return Ok(record);
            }
            let expected = record.version();
            match self.save_if_version(&mut record, expected).await {
                Ok(_) => return Ok(record),
                Err(e) if e.is_conflict() && attempt < attempts => {
                    tracing::debug!(
                        "Retrying update of {}:{} after conflict (attempt {}/{})",
                        T::TYPE_NAME,
                        id,
                        attempt,
                        attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Load a record; `NotFound` when absent, `Serialization` when corrupt
    pub async fn load<T: Persistable>(&self, id: &str) -> Result<T> {
        self.register::<T>()?;
        validate_segment("record id", id)?;

        let key = self.key(T::TYPE_NAME, id);
        let stored = {
            let key = key.clone();
            self.conn
                .execute(self.timeout, move |backend| {
                    let key = key.clone();
                    async move { backend.read(&key).await }
                })
                .await?
        };

        match stored {
            Some(fields) => decode_record(&key, id, fields),
            None => Err(Error::not_found(T::TYPE_NAME, id)),
        }
    }

    pub async fn exists<T: Persistable>(&self, id: &str) -> Result<bool> {
        match self.load::<T>(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete a record; `NotFound` when absent
    pub async fn delete<T: Persistable>(&self, id: &str) -> Result<()> {
        self.register::<T>()?;
        validate_segment("record id", id)?;

        let key = self.key(T::TYPE_NAME, id);
        let removed = {
            let key = key.clone();
            self.conn
                .execute(self.timeout, move |backend| {
                    let key = key.clone();
                    async move { backend.delete(&key).await }
                })
                .await?
        };

        let Some(last_version) = removed else {
            return Err(Error::not_found(T::TYPE_NAME, id));
        };
        tracing::debug!("Deleted {} at v{}", key, last_version);

        if T::PUBLISH_CHANGES {
            self.notify(T::TYPE_NAME, id, Vec::new(), last_version, Utc::now(), true)
                .await;
        }
        Ok(())
    }

    /// Lazily list records of `T` matching `filter`.
    ///
    /// Keys are scanned page by page and records loaded on demand; calling
    /// `list` again starts a fresh scan. Records deleted mid-scan are skipped.
    pub fn list<T, F>(&self, filter: F) -> RecordStream<T>
    where
        T: Persistable,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        if let Err(e) = self.register::<T>() {
            return futures::stream::iter(vec![Err(e)]).boxed();
        }

        let prefix = format!("{}:{}:", self.namespace, T::TYPE_NAME);
        let pattern = format!("{prefix}*");
        let store = self.clone();
        let filter = Arc::new(filter);

        self.conn
            .scan(&pattern, self.timeout)
            .map_ok(|keys| futures::stream::iter(keys.into_iter().map(Ok::<_, Error>)))
            .try_flatten()
            .try_filter_map(move |key| {
                let store = store.clone();
                let filter = filter.clone();
                let id = key
                    .strip_prefix(&prefix)
                    .filter(|id| !id.is_empty() && !id.contains(':'))
                    .map(str::to_string);
                async move {
                    let Some(id) = id else {
                        return Ok(None);
                    };
                    match store.load::<T>(&id).await {
                        Ok(record) => Ok(filter(&record).then_some(record)),
                        Err(e) if e.is_not_found() => Ok(None),
                        Err(e) => Err(e),
                    }
                }
            })
            .boxed()
    }

    /// Publish a change event after a durable write. A failed publish is logged;
    /// the write itself has already succeeded.
    async fn notify(
        &self,
        record_type: &str,
        id: &str,
        changed_field_names: Vec<String>,
        version: u64,
        timestamp: DateTime<Utc>,
        deleted: bool,
    ) {
        let channel = self.bus.channel_for(record_type, id);
        let event = StateEvent {
            channel: channel.clone(),
            record_type: record_type.to_string(),
            record_id: id.to_string(),
            changed_field_names,
            new_version: version,
            timestamp,
            deleted,
        };
        if let Err(e) = self.bus.publish(&channel, &event).await {
            tracing::error!("Failed to publish change of {} v{}: {}", channel, version, e);
        }
    }
}

/// Declared fields whose stored value differs from the previous write
fn changed_fields(previous: &FieldMap, current: &FieldMap) -> Vec<String> {
    current
        .iter()
        .filter(|(name, value)| previous.get(*name) != Some(*value))
        .map(|(name, _)| name.clone())
        .collect()
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .finish()
    }
}
