//! Service Descriptors
//!
//! The persisted identity of a service: its lifecycle status, the accounts it
//! owns and which of them is the default.

use crate::error::{Error, Result};
use crate::store::{FieldReader, FieldWriter, Persistable, RecordMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a registered service
///
/// ```text
/// Uninitialized → Initializing → Ready ⇄ Degraded
///                                  ↓        ↓
///                 (any) ──────→ ShuttingDown → Terminated
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Degraded,
    ShuttingDown,
    Terminated,
}

impl ServiceStatus {
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        match (self, next) {
            (Uninitialized | Ready | Degraded, Initializing) => true,
            (Initializing, Ready | Degraded) => true,
            (Ready, Degraded) | (Degraded, Ready) => true,
            (Terminated, ShuttingDown) => false,
            (_, ShuttingDown) => true,
            (ShuttingDown, Terminated) => true,
            // Re-registration
            (Terminated, Uninitialized) => true,
            _ => false,
        }
    }

    /// Ready or Degraded
    pub fn is_running(self) -> bool {
        matches!(self, ServiceStatus::Ready | ServiceStatus::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Uninitialized => "uninitialized",
            ServiceStatus::Initializing => "initializing",
            ServiceStatus::Ready => "ready",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::ShuttingDown => "shutting_down",
            ServiceStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceDescriptor {
    pub service_id: String,
    pub meta: RecordMeta,
    pub service_name: String,
    pub status: ServiceStatus,
    /// Owned account ids, in insertion order
    pub accounts: Vec<String>,
    /// Always a member of `accounts` when set
    pub default_account_id: Option<String>,
    pub is_enabled: bool,
    /// Last warning recorded by a lifecycle transition
    pub status_detail: Option<String>,
    pub last_active: Option<DateTime<Utc>>,
}

impl ServiceDescriptor {
    pub fn new(service_id: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            meta: RecordMeta::default(),
            service_name: service_name.into(),
            status: ServiceStatus::Uninitialized,
            accounts: Vec::new(),
            default_account_id: None,
            is_enabled: true,
            status_detail: None,
            last_active: None,
        }
    }

    pub fn has_account(&self, account_id: &str) -> bool {
        self.accounts.iter().any(|a| a == account_id)
    }

    pub fn is_default(&self, account_id: &str) -> bool {
        self.default_account_id.as_deref() == Some(account_id)
    }

    /// Move to `next`, enforcing the lifecycle state machine
    pub fn transition(&mut self, next: ServiceStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                service_id: self.service_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Drop `account_id` from the owned set, clearing the default if it pointed there
    pub(crate) fn detach_account(&mut self, account_id: &str) -> bool {
        let before = self.accounts.len();
        self.accounts.retain(|a| a != account_id);
        if self.is_default(account_id) {
            self.default_account_id = None;
        }
        self.accounts.len() != before
    }
}

impl Persistable for ServiceDescriptor {
    const TYPE_NAME: &'static str = "service";
    const PERSISTED_FIELDS: &'static [&'static str] = &[
        "service_name",
        "status",
        "accounts",
        "default_account_id",
        "is_enabled",
        "status_detail",
        "last_active",
    ];
    const PUBLISH_CHANGES: bool = true;

    fn id(&self) -> &str {
        &self.service_id
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn encode(&self, out: &mut FieldWriter) -> Result<()> {
        out.put("service_name", &self.service_name)?;
        out.put("status", &self.status)?;
        out.put("accounts", &self.accounts)?;
        out.put("default_account_id", &self.default_account_id)?;
        out.put("is_enabled", &self.is_enabled)?;
        out.put("status_detail", &self.status_detail)?;
        out.put("last_active", &self.last_active)
    }

    fn decode(id: &str, meta: RecordMeta, fields: &FieldReader<'_>) -> Result<Self> {
        let descriptor = Self {
            service_id: id.to_string(),
            meta,
            service_name: fields.get("service_name")?,
            status: fields.get("status")?,
            accounts: fields.get("accounts")?,
            default_account_id: fields.get("default_account_id")?,
            is_enabled: fields.get("is_enabled")?,
            status_detail: fields.get("status_detail")?,
            last_active: fields.get("last_active")?,
        };
        if let Some(default) = &descriptor.default_account_id
            && !descriptor.has_account(default)
        {
            return Err(Error::serialization(
                format!("service {id}"),
                format!("default account {default} is not owned by the service"),
            ));
        }
        Ok(descriptor)
    }
}

/// Criteria for `ServiceRegistry::discover`; empty matches everything
#[derive(Clone, Debug, Default)]
pub struct ServiceFilter {
    pub status: Option<ServiceStatus>,
    pub enabled: Option<bool>,
    pub name_contains: Option<String>,
}

impl ServiceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn name_contains(mut self, needle: impl Into<String>) -> Self {
        self.name_contains = Some(needle.into().to_lowercase());
        self
    }

    pub fn matches(&self, descriptor: &ServiceDescriptor) -> bool {
        if self.status.is_some_and(|s| s != descriptor.status) {
            return false;
        }
        if self.enabled.is_some_and(|e| e != descriptor.is_enabled) {
            return false;
        }
        if let Some(needle) = &self.name_contains {
            return descriptor.service_name.to_lowercase().contains(needle)
                || descriptor.service_id.to_lowercase().contains(needle);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordSchema;

    #[test]
    fn test_lifecycle_transitions() {
        use ServiceStatus::*;
        assert!(Uninitialized.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Degraded));
        assert!(Ready.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Ready));
        assert!(Ready.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Terminated));
        assert!(Terminated.can_transition_to(Uninitialized));

        assert!(!Uninitialized.can_transition_to(Ready));
        assert!(!Terminated.can_transition_to(Initializing));
        assert!(!Terminated.can_transition_to(ShuttingDown));
        assert!(!ShuttingDown.can_transition_to(Ready));

        let mut descriptor = ServiceDescriptor::new("jira", "Jira");
        let err = descriptor.transition(Ready).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(descriptor.status, Uninitialized);
    }

    #[test]
    fn test_detach_clears_default() {
        let mut descriptor = ServiceDescriptor::new("jira", "Jira");
        descriptor.accounts = vec!["a1".into(), "a2".into()];
        descriptor.default_account_id = Some("a1".into());

        assert!(descriptor.detach_account("a1"));
        assert_eq!(descriptor.accounts, vec!["a2"]);
        assert_eq!(descriptor.default_account_id, None);
        assert!(!descriptor.detach_account("a1"));
    }

    #[test]
    fn test_filter() {
        let mut descriptor = ServiceDescriptor::new("jira", "Jira Cloud");
        descriptor.status = ServiceStatus::Ready;

        assert!(ServiceFilter::all().matches(&descriptor));
        assert!(ServiceFilter::all().name_contains("CLOUD").matches(&descriptor));
        assert!(!ServiceFilter::all()
            .with_status(ServiceStatus::Degraded)
            .matches(&descriptor));
        assert!(!ServiceFilter::all().enabled(false).matches(&descriptor));
    }

    #[test]
    fn test_schema_and_status_wire_names() {
        assert!(RecordSchema::of::<ServiceDescriptor>().validate().is_ok());
        assert_eq!(
            serde_json::to_string(&ServiceStatus::ShuttingDown).expect("json"),
            "\"shutting_down\""
        );
    }
}
