//! Account Records
//!
//! One set of credentials for a service. Credential values are stored only as
//! envelope ciphertext; everything else on the record is plain metadata.

use crate::error::Result;
use crate::store::{FieldReader, FieldWriter, Persistable, RecordMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of the most recent credential validation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    Unknown,
    Valid,
    Invalid,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStatus::Unknown => write!(f, "unknown"),
            ValidationStatus::Valid => write!(f, "valid"),
            ValidationStatus::Invalid => write!(f, "invalid"),
        }
    }
}

/// What kind of secret an account holds
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    EmailPassword,
    #[default]
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
    Custom(String),
}

impl CredentialKind {
    /// Credential names an account of this kind cannot be validated without
    pub fn required_credentials(&self) -> &'static [&'static str] {
        match self {
            CredentialKind::EmailPassword => &["email"],
            CredentialKind::ApiKey => &["api_key"],
            CredentialKind::OAuth => &["oauth_token"],
            CredentialKind::Custom(_) => &[],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccountRecord {
    pub account_id: String,
    pub meta: RecordMeta,
    /// Owning service (back-reference)
    pub service_id: String,
    pub name: String,
    pub description: String,
    pub credential_kind: CredentialKind,
    /// Credential name → sealed ciphertext
    pub credentials: BTreeMap<String, String>,
    pub is_active: bool,
    pub validation_status: ValidationStatus,
    pub consecutive_failures: u32,
    /// `validate` returns the cached status until this instant
    pub next_validation_allowed_at: Option<DateTime<Utc>>,
    pub last_validated_at: Option<DateTime<Utc>>,
    /// Last successful connection test
    pub last_used_at: Option<DateTime<Utc>>,
}

impl AccountRecord {
    pub fn new(account_id: impl Into<String>, service_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            meta: RecordMeta::default(),
            service_id: service_id.into(),
            name: name.into(),
            description: String::new(),
            credential_kind: CredentialKind::default(),
            credentials: BTreeMap::new(),
            is_active: true,
            validation_status: ValidationStatus::Unknown,
            consecutive_failures: 0,
            next_validation_allowed_at: None,
            last_validated_at: None,
            last_used_at: None,
        }
    }

    pub fn has_credential(&self, name: &str) -> bool {
        self.credentials.contains_key(name)
    }

    /// Required credentials not stored yet. An account with no credentials
    /// at all is always missing something.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let required = self.credential_kind.required_credentials();
        if required.is_empty() && self.credentials.is_empty() {
            return vec!["credentials"];
        }
        required
            .iter()
            .copied()
            .filter(|name| !self.has_credential(name))
            .collect()
    }

    /// Whether `validate` may probe at `now`
    pub fn validation_due(&self, now: DateTime<Utc>) -> bool {
        self.next_validation_allowed_at
            .is_none_or(|allowed_at| now >= allowed_at)
    }
}

impl Persistable for AccountRecord {
    const TYPE_NAME: &'static str = "account";
    const PERSISTED_FIELDS: &'static [&'static str] = &[
        "service_id",
        "name",
        "description",
        "credential_kind",
        "credentials",
        "is_active",
        "validation_status",
        "consecutive_failures",
        "next_validation_allowed_at",
        "last_validated_at",
        "last_used_at",
    ];
    const PUBLISH_CHANGES: bool = true;

    fn id(&self) -> &str {
        &self.account_id
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn encode(&self, out: &mut FieldWriter) -> Result<()> {
        out.put("service_id", &self.service_id)?;
        out.put("name", &self.name)?;
        out.put("description", &self.description)?;
        out.put("credential_kind", &self.credential_kind)?;
        out.put("credentials", &self.credentials)?;
        out.put("is_active", &self.is_active)?;
        out.put("validation_status", &self.validation_status)?;
        out.put("consecutive_failures", &self.consecutive_failures)?;
        out.put("next_validation_allowed_at", &self.next_validation_allowed_at)?;
        out.put("last_validated_at", &self.last_validated_at)?;
        out.put("last_used_at", &self.last_used_at)
    }

    fn decode(id: &str, meta: RecordMeta, fields: &FieldReader<'_>) -> Result<Self> {
        Ok(Self {
            account_id: id.to_string(),
            meta,
            service_id: fields.get("service_id")?,
            name: fields.get("name")?,
            description: fields.get("description")?,
            credential_kind: fields.get("credential_kind")?,
            credentials: fields.get("credentials")?,
            is_active: fields.get("is_active")?,
            validation_status: fields.get("validation_status")?,
            consecutive_failures: fields.get("consecutive_failures")?,
            next_validation_allowed_at: fields.get("next_validation_allowed_at")?,
            last_validated_at: fields.get("last_validated_at")?,
            last_used_at: fields.get("last_used_at")?,
        })
    }
}

/// Secret-free view of an account, for listings
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccountSummary {
    pub account_id: String,
    pub name: String,
    pub description: String,
    pub credential_kind: CredentialKind,
    /// Names of the stored credentials (values are never included)
    pub credential_names: Vec<String>,
    pub is_active: bool,
    pub validation_status: ValidationStatus,
    pub is_default: bool,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl AccountSummary {
    pub fn of(account: &AccountRecord, is_default: bool) -> Self {
        Self {
            account_id: account.account_id.clone(),
            name: account.name.clone(),
            description: account.description.clone(),
            credential_kind: account.credential_kind.clone(),
            credential_names: account.credentials.keys().cloned().collect(),
            is_active: account.is_active,
            validation_status: account.validation_status,
            is_default,
            last_validated_at: account.last_validated_at,
            last_used_at: account.last_used_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordSchema;

    #[test]
    fn test_schema_is_valid() {
        assert!(RecordSchema::of::<AccountRecord>().validate().is_ok());
    }

    #[test]
    fn test_validation_due() {
        let now = Utc::now();
        let mut account = AccountRecord::new("a1", "jira", "work");
        assert!(account.validation_due(now));

        account.next_validation_allowed_at = Some(now + chrono::Duration::seconds(5));
        assert!(!account.validation_due(now));
        assert!(account.validation_due(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_missing_credentials_by_kind() {
        let mut account = AccountRecord::new("a1", "jira", "work");
        assert_eq!(account.missing_credentials(), vec!["api_key"]);
        account.credentials.insert("api_secret".into(), "sealed".into());
        assert_eq!(account.missing_credentials(), vec!["api_key"]);
        account.credentials.insert("api_key".into(), "sealed".into());
        assert!(account.missing_credentials().is_empty());

        account.credential_kind = CredentialKind::EmailPassword;
        assert_eq!(account.missing_credentials(), vec!["email"]);
        account.credential_kind = CredentialKind::OAuth;
        assert_eq!(account.missing_credentials(), vec!["oauth_token"]);

        account.credential_kind = CredentialKind::Custom("ldap".into());
        assert!(account.missing_credentials().is_empty());
        account.credentials.clear();
        assert_eq!(account.missing_credentials(), vec!["credentials"]);
    }

    #[test]
    fn test_summary_has_no_secret_material() {
        let mut account = AccountRecord::new("a1", "jira", "work");
        account
            .credentials
            .insert("api_key".into(), "v1:nonce:ciphertext".into());
        let summary = AccountSummary::of(&account, true);
        assert_eq!(summary.credential_names, vec!["api_key"]);
        let json = serde_json::to_string(&summary).expect("json");
        assert!(!json.contains("ciphertext"));
    }

    #[test]
    fn test_credential_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&CredentialKind::EmailPassword).expect("json"),
            "\"email_password\""
        );
        assert_eq!(
            serde_json::to_string(&CredentialKind::OAuth).expect("json"),
            "\"oauth\""
        );
    }
}
