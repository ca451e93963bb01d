//! Persistable Records
//!
//! Entities opt into persistence by implementing [`Persistable`]: a static
//! schema naming the fields that are written to the store, plus encode/decode
//! through [`FieldWriter`] and [`FieldReader`]. Anything not listed in
//! `PERSISTED_FIELDS` never reaches the store.
//!
//! ```ignore
//! impl Persistable for Job {
//!     const TYPE_NAME: &'static str = "job";
//!     const PERSISTED_FIELDS: &'static [&'static str] = &["state", "attempts"];
//!     const PUBLISH_CHANGES: bool = true;
//!
//!     fn id(&self) -> &str { &self.id }
//!     fn meta(&self) -> &RecordMeta { &self.meta }
//!     fn meta_mut(&mut self) -> &mut RecordMeta { &mut self.meta }
//!
//!     fn encode(&self, out: &mut FieldWriter) -> Result<()> {
//!         out.put("state", &self.state)?;
//!         out.put("attempts", &self.attempts)
//!     }
//!
//!     fn decode(id: &str, meta: RecordMeta, fields: &FieldReader<'_>) -> Result<Self> {
//!         Ok(Job { id: id.into(), meta, state: fields.get("state")?, attempts: fields.get("attempts")?, scratch: None })
//!     }
//! }
//! ```

use crate::connection::{FieldMap, RESERVED_FIELDS};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Store-managed bookkeeping carried by every record
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordMeta {
    /// 0 until the first successful save, then strictly increasing
    pub version: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RecordMeta {
    pub fn is_new(&self) -> bool {
        self.version == 0
    }
}

/// Capability of being saved to and loaded from the record store
pub trait Persistable: Sized + Send + Sync + 'static {
    /// Type discriminator; namespaces ids in keys and channels
    const TYPE_NAME: &'static str;

    /// Fields written to the store, in declaration order
    const PERSISTED_FIELDS: &'static [&'static str];

    /// Whether every successful save publishes a `StateEvent`
    const PUBLISH_CHANGES: bool = false;

    fn id(&self) -> &str;

    fn meta(&self) -> &RecordMeta;

    fn meta_mut(&mut self) -> &mut RecordMeta;

    /// Write exactly the persisted fields
    fn encode(&self, out: &mut FieldWriter) -> Result<()>;

    /// Rebuild a record from its persisted fields
    fn decode(id: &str, meta: RecordMeta, fields: &FieldReader<'_>) -> Result<Self>;

    fn version(&self) -> u64 {
        self.meta().version
    }
}

/// Static description of a record type, checked once at registration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordSchema {
    pub type_name: &'static str,
    pub fields: &'static [&'static str],
    pub publish_changes: bool,
}

impl RecordSchema {
    pub fn of<T: Persistable>() -> Self {
        Self {
            type_name: T::TYPE_NAME,
            fields: T::PERSISTED_FIELDS,
            publish_changes: T::PUBLISH_CHANGES,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_segment("record type", self.type_name)?;

        let mut seen = std::collections::HashSet::new();
        for field in self.fields {
            if field.is_empty() {
                return Err(Error::invalid(format!(
                    "{}: empty persisted field name",
                    self.type_name
                )));
            }
            if RESERVED_FIELDS.contains(field) {
                return Err(Error::invalid(format!(
                    "{}: field name '{}' is reserved",
                    self.type_name, field
                )));
            }
            if !seen.insert(*field) {
                return Err(Error::invalid(format!(
                    "{}: field '{}' declared twice",
                    self.type_name, field
                )));
            }
        }
        Ok(())
    }

    pub fn declares(&self, field: &str) -> bool {
        self.fields.contains(&field)
    }
}

/// Ids and type names become key segments, so they may not contain separators
pub fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains(':') || value.contains('*') {
        return Err(Error::invalid(format!(
            "{what} must be non-empty and free of ':' and '*': {value:?}"
        )));
    }
    Ok(())
}

/// Collects encoded field values during `Persistable::encode`
pub struct FieldWriter {
    key: String,
    fields: FieldMap,
}

impl FieldWriter {
    pub(crate) fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: FieldMap::new(),
        }
    }

    /// Encode `value` as JSON under `name`
    pub fn put<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value).map_err(|e| {
            Error::serialization(&self.key, format!("cannot encode field '{name}': {e}"))
        })?;
        self.fields.insert(name.to_string(), encoded);
        Ok(())
    }

    pub(crate) fn into_fields(self) -> FieldMap {
        self.fields
    }
}

/// Read access to stored field values during `Persistable::decode`
pub struct FieldReader<'a> {
    key: &'a str,
    fields: &'a FieldMap,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(key: &'a str, fields: &'a FieldMap) -> Self {
        Self { key, fields }
    }

    /// Decode the JSON value stored under `name`
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let raw = self.fields.get(name).ok_or_else(|| {
            Error::serialization(self.key, format!("missing field '{name}'"))
        })?;
        serde_json::from_str(raw).map_err(|e| {
            Error::serialization(self.key, format!("corrupt field '{name}': {e}"))
        })
    }
}

/// Encode `record`, enforcing that exactly the declared fields were written
pub(crate) fn encode_record<T: Persistable>(key: &str, record: &T) -> Result<FieldMap> {
    let mut writer = FieldWriter::new(key);
    record.encode(&mut writer)?;
    let fields = writer.into_fields();

    if let Some(extra) = fields.keys().find(|f| !T::PERSISTED_FIELDS.contains(&f.as_str())) {
        return Err(Error::serialization(
            key,
            format!("field '{extra}' is not declared persistent"),
        ));
    }
    if let Some(missing) = T::PERSISTED_FIELDS.iter().find(|f| !fields.contains_key(**f)) {
        return Err(Error::serialization(
            key,
            format!("persisted field '{missing}' was not encoded"),
        ));
    }
    Ok(fields)
}

/// Decode a stored hash into `T`, rejecting unknown or corrupt data
pub(crate) fn decode_record<T: Persistable>(key: &str, id: &str, mut stored: FieldMap) -> Result<T> {
    use crate::connection::{FIELD_CREATED_AT, FIELD_UPDATED_AT, FIELD_VERSION};

    let version = stored
        .remove(FIELD_VERSION)
        .ok_or_else(|| Error::serialization(key, "missing version"))?
        .parse::<u64>()
        .map_err(|e| Error::serialization(key, format!("corrupt version: {e}")))?;
    let created_at = parse_timestamp(key, stored.remove(FIELD_CREATED_AT))?;
    let updated_at = parse_timestamp(key, stored.remove(FIELD_UPDATED_AT))?;

    if let Some(unknown) = stored.keys().find(|f| !T::PERSISTED_FIELDS.contains(&f.as_str())) {
        return Err(Error::serialization(
            key,
            format!("unknown stored field '{unknown}'"),
        ));
    }

    let meta = RecordMeta {
        version,
        created_at,
        updated_at,
    };
    T::decode(id, meta, &FieldReader::new(key, &stored))
}

pub(crate) fn parse_timestamp(key: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|value| {
        DateTime::parse_from_rfc3339(&value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::serialization(key, format!("corrupt timestamp '{value}': {e}")))
    })
    .transpose()
}
