//! State Events
//!
//! Ephemeral notifications describing a record mutation. Events are never
//! persisted; the channel name carries the record identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const EVENTS_SUFFIX: &str = "events";

/// A record mutation observed on the bus
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateEvent {
    /// Channel the event was published on
    pub channel: String,
    /// Record type discriminator
    pub record_type: String,
    /// Record id
    pub record_id: String,
    /// Persisted fields whose stored value changed
    pub changed_field_names: Vec<String>,
    /// Version after the write (the last version for deletions)
    pub new_version: u64,
    pub timestamp: DateTime<Utc>,
    /// The record was deleted rather than written
    pub deleted: bool,
}

/// Item of a gap-aware subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusSignal {
    Event(StateEvent),
    /// Events were dropped because the subscriber fell behind; state derived
    /// from the stream must be reloaded
    Lagged(u64),
}

/// Wire payload; record identity travels in the channel name
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventPayload {
    pub changed_field_names: Vec<String>,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl StateEvent {
    pub fn payload(&self) -> EventPayload {
        EventPayload {
            changed_field_names: self.changed_field_names.clone(),
            version: self.new_version,
            timestamp: self.timestamp,
            deleted: self.deleted,
        }
    }

    /// Rebuild an event from a channel name and its payload
    pub fn from_payload(namespace: &str, channel: &str, payload: EventPayload) -> Option<Self> {
        let (record_type, record_id) = parse_channel(namespace, channel)?;
        Some(Self {
            channel: channel.to_string(),
            record_type: record_type.to_string(),
            record_id: record_id.to_string(),
            changed_field_names: payload.changed_field_names,
            new_version: payload.version,
            timestamp: payload.timestamp,
            deleted: payload.deleted,
        })
    }

    pub fn touches(&self, field: &str) -> bool {
        self.deleted || self.changed_field_names.iter().any(|f| f == field)
    }
}

/// `{namespace}:{type}:{id}:events`
pub fn record_channel(namespace: &str, record_type: &str, id: &str) -> String {
    format!("{namespace}:{record_type}:{id}:{EVENTS_SUFFIX}")
}

/// Pattern matching the channels of every record of `record_type`
pub fn type_channel_pattern(namespace: &str, record_type: &str) -> String {
    format!("{namespace}:{record_type}:*:{EVENTS_SUFFIX}")
}

/// Split a record channel into `(type, id)`
pub fn parse_channel<'a>(namespace: &str, channel: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = channel.strip_prefix(namespace)?.strip_prefix(':')?;
    let rest = rest.strip_suffix(EVENTS_SUFFIX)?.strip_suffix(':')?;
    let (record_type, id) = rest.split_once(':')?;
    if record_type.is_empty() || id.is_empty() || id.contains(':') {
        return None;
    }
    Some((record_type, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_naming() {
        let channel = record_channel("suite", "service", "jira");
        assert_eq!(channel, "suite:service:jira:events");
        assert_eq!(parse_channel("suite", &channel), Some(("service", "jira")));
        assert_eq!(parse_channel("other", &channel), None);
        assert_eq!(parse_channel("suite", "suite:service:events"), None);
        assert_eq!(
            type_channel_pattern("suite", "account"),
            "suite:account:*:events"
        );
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = EventPayload {
            changed_field_names: vec!["status".into()],
            version: 3,
            timestamp: DateTime::parse_from_rfc3339("2026-10-15T08:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            deleted: false,
        };
        let json = serde_json::to_value(&payload).expect("json");
        assert_eq!(json["version"], 3);
        assert_eq!(json["changed_field_names"][0], "status");
        assert!(json.get("deleted").is_none());

        let event =
            StateEvent::from_payload("suite", "suite:service:jira:events", payload).expect("event");
        assert_eq!(event.record_id, "jira");
        assert!(event.touches("status"));
        assert!(!event.touches("accounts"));
    }
}
