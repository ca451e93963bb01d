//! Credential Vault
//!
//! Multi-account credential storage for services. Credential values are sealed
//! with envelope encryption before they reach the record store and are only
//! opened inside [`CredentialVault::get_credential`] and the validation probe.
//!
//! Validation follows a backoff schedule stored on each account, and every
//! outcome is broadcast in-process so the registry can move services between
//! Ready and Degraded without polling.

use super::account::*;
use super::schedule::ValidationSchedule;
use super::validator::{Credentials, ProbeContext, Validator};
use crate::config::VaultConfig;
use crate::constants::CHANNEL_CAPACITY;
use crate::error::{Error, Result};
use crate::helpers::{MasterKey, open, seal};
use crate::registry::ServiceDescriptor;
use crate::store::{Persistable, RecordStore};
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Source of "now" for validation scheduling
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Result of one validation probe (or of a decryption failure)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub service_id: String,
    pub account_id: String,
    pub status: ValidationStatus,
    pub consecutive_failures: u32,
    pub at: DateTime<Utc>,
}

impl ValidationOutcome {
    /// The validation state currently stored on `account`
    pub fn of(account: &AccountRecord) -> Self {
        Self {
            service_id: account.service_id.clone(),
            account_id: account.account_id.clone(),
            status: account.validation_status,
            consecutive_failures: account.consecutive_failures,
            at: account.last_validated_at.unwrap_or_else(Utc::now),
        }
    }
}

struct VaultInner {
    store: RecordStore,
    master_key: Option<MasterKey>,
    config: VaultConfig,
    schedule: ValidationSchedule,
    validators: RwLock<AHashMap<String, Arc<dyn Validator>>>,
    outcomes: broadcast::Sender<ValidationOutcome>,
    clock: Clock,
}

#[derive(Clone)]
pub struct CredentialVault {
    inner: Arc<VaultInner>,
}

impl CredentialVault {
    /// Create a vault. Without a master key every credential read or write
    /// fails with an encryption error; metadata operations still work.
    pub fn new(store: RecordStore, master_key: Option<MasterKey>, config: VaultConfig) -> Self {
        Self::with_clock(store, master_key, config, Arc::new(Utc::now))
    }

    pub fn with_clock(
        store: RecordStore,
        master_key: Option<MasterKey>,
        config: VaultConfig,
        clock: Clock,
    ) -> Self {
        if master_key.is_none() {
            warn!("Credential vault started without a master key");
        }
        let (outcomes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(VaultInner {
                store,
                master_key,
                schedule: ValidationSchedule::from_config(&config),
                config,
                validators: RwLock::new(AHashMap::new()),
                outcomes,
                clock,
            }),
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }

    pub fn schedule(&self) -> &ValidationSchedule {
        &self.inner.schedule
    }

    /// Install the connectivity probe used for every account of `service_id`
    pub fn register_validator(&self, service_id: &str, validator: Arc<dyn Validator>) {
        self.inner
            .validators
            .write()
            .insert(service_id.to_string(), validator);
        debug!("Registered validator for {}", service_id);
    }

    /// Validation outcomes from now on
    pub fn outcomes(&self) -> broadcast::Receiver<ValidationOutcome> {
        self.inner.outcomes.subscribe()
    }

    pub async fn account(&self, account_id: &str) -> Result<AccountRecord> {
        self.inner.store.load(account_id).await
    }

    /// Add an API-key account to `service_id`; returns the new account id
    pub async fn add_account(&self, service_id: &str, account_name: &str) -> Result<String> {
        self.add_account_with_kind(service_id, account_name, CredentialKind::default())
            .await
    }

    /// Add an account; the first account of a service becomes its default
    pub async fn add_account_with_kind(
        &self,
        service_id: &str,
        account_name: &str,
        kind: CredentialKind,
    ) -> Result<String> {
        let store = &self.inner.store;
        // The owning service must exist before anything is written
        store.load::<ServiceDescriptor>(service_id).await?;

        let account_id = Uuid::now_v7().simple().to_string();
        let mut account = AccountRecord::new(&account_id, service_id, account_name);
        account.credential_kind = kind;
        store.save_if_version(&mut account, 0).await?;

        let now = self.now();
        let attached = store
            .update::<ServiceDescriptor, _>(service_id, self.cas_attempts(), |descriptor| {
                if !descriptor.has_account(&account_id) {
                    descriptor.accounts.push(account_id.clone());
                }
                if descriptor.default_account_id.is_none() {
                    descriptor.default_account_id = Some(account_id.clone());
                }
                descriptor.last_active = Some(now);
                Ok(true)
            })
            .await;

        if let Err(e) = attached {
            if let Err(cleanup) = store.delete::<AccountRecord>(&account_id).await {
                warn!("Failed to remove orphaned account {}: {}", account_id, cleanup);
            }
            return Err(e);
        }

        info!("Added account '{}' ({}) to {}", account_name, account_id, service_id);
        Ok(account_id)
    }

    pub async fn set_description(&self, account_id: &str, description: &str) -> Result<()> {
        self.inner
            .store
            .update::<AccountRecord, _>(account_id, self.cas_attempts(), |account| {
                if account.description == description {
                    return Ok(false);
                }
                account.description = description.to_string();
                Ok(true)
            })
            .await?;
        Ok(())
    }

    /// Detach the account from its service, then delete it
    pub async fn remove_account(&self, account_id: &str) -> Result<()> {
        let store = &self.inner.store;
        let account: AccountRecord = store.load(account_id).await?;

        let detached = store
            .update::<ServiceDescriptor, _>(&account.service_id, self.cas_attempts(), |descriptor| {
                Ok(descriptor.detach_account(account_id))
            })
            .await;
        match detached {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!("Service {} already gone, deleting account {}", account.service_id, account_id);
            }
            Err(e) => return Err(e),
        }

        store.delete::<AccountRecord>(account_id).await?;
        info!("Removed account {} from {}", account_id, account.service_id);
        Ok(())
    }

    /// Seal and store a credential value.
    ///
    /// The account's validation state is reset so the new value gets probed on
    /// the next `validate`.
    pub async fn set_credential(&self, account_id: &str, name: &str, plaintext: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid("credential name must not be empty"));
        }
        let master = self.master_key()?;
        let aad = credential_aad(account_id, name);

        self.inner
            .store
            .update::<AccountRecord, _>(account_id, self.cas_attempts(), |account| {
                let sealed = seal(master, plaintext, aad.as_bytes())?;
                account.credentials.insert(name.to_string(), sealed);
                account.validation_status = ValidationStatus::Unknown;
                account.consecutive_failures = 0;
                account.next_validation_allowed_at = None;
                Ok(true)
            })
            .await?;

        info!("Stored credential '{}' for account {}", name, account_id);
        Ok(())
    }

    /// Open a stored credential.
    ///
    /// A decryption failure marks the account Invalid before the error is returned.
    pub async fn get_credential(&self, account_id: &str, name: &str) -> Result<String> {
        let account: AccountRecord = self.inner.store.load(account_id).await?;
        let sealed = account
            .credentials
            .get(name)
            .ok_or_else(|| Error::not_found("Credential", format!("{account_id}/{name}")))?;

        let opened = self
            .master_key()
            .and_then(|master| open(master, sealed, credential_aad(account_id, name).as_bytes()));
        match opened {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                self.mark_undecryptable(&account, &e).await;
                Err(e)
            }
        }
    }

    /// Make `account_id` the single default account of its service
    pub async fn set_default(&self, account_id: &str) -> Result<()> {
        let account: AccountRecord = self.inner.store.load(account_id).await?;
        self.inner
            .store
            .update::<ServiceDescriptor, _>(&account.service_id, self.cas_attempts(), |descriptor| {
                if !descriptor.has_account(account_id) {
                    return Err(Error::not_found("Account", account_id));
                }
                if descriptor.is_default(account_id) {
                    return Ok(false);
                }
                descriptor.default_account_id = Some(account_id.to_string());
                Ok(true)
            })
            .await?;
        info!("Default account of {} is now {}", account.service_id, account_id);
        Ok(())
    }

    pub async fn activate(&self, account_id: &str) -> Result<()> {
        self.set_active(account_id, true).await
    }

    pub async fn deactivate(&self, account_id: &str) -> Result<()> {
        self.set_active(account_id, false).await
    }

    async fn set_active(&self, account_id: &str, active: bool) -> Result<()> {
        self.inner
            .store
            .update::<AccountRecord, _>(account_id, self.cas_attempts(), |account| {
                if account.is_active == active {
                    return Ok(false);
                }
                account.is_active = active;
                Ok(true)
            })
            .await?;
        debug!("Account {} active={}", account_id, active);
        Ok(())
    }

    /// Validate an account, honouring its backoff schedule.
    ///
    /// Inactive accounts and accounts whose next validation is not yet due
    /// return their cached status without probing.
    pub async fn validate(&self, account_id: &str) -> Result<ValidationStatus> {
        let account: AccountRecord = self.inner.store.load(account_id).await?;
        if !account.is_active {
            debug!("Account {} is inactive, not probing", account_id);
            return Ok(account.validation_status);
        }
        if !account.validation_due(self.now()) {
            debug!(
                "Account {} not due for validation, cached status {}",
                account_id, account.validation_status
            );
            return Ok(account.validation_status);
        }
        self.probe(account).await
    }

    /// Probe an account now, ignoring its schedule
    pub async fn test_connection(&self, account_id: &str) -> Result<ValidationStatus> {
        let account: AccountRecord = self.inner.store.load(account_id).await?;
        self.probe(account).await
    }

    /// Secret-free summaries of every account owned by `service_id`, in order
    pub async fn list_accounts(&self, service_id: &str) -> Result<Vec<AccountSummary>> {
        let store = &self.inner.store;
        let descriptor: ServiceDescriptor = store.load(service_id).await?;

        let mut summaries = Vec::with_capacity(descriptor.accounts.len());
        for account_id in &descriptor.accounts {
            match store.load::<AccountRecord>(account_id).await {
                Ok(account) => {
                    summaries.push(AccountSummary::of(&account, descriptor.is_default(account_id)))
                }
                Err(e) if e.is_not_found() => {
                    warn!("Service {} references missing account {}", service_id, account_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summaries)
    }

    async fn probe(&self, account: AccountRecord) -> Result<ValidationStatus> {
        let validator = self.validator_for(&account.service_id)?;
        let missing = account.missing_credentials();
        if !missing.is_empty() {
            warn!(
                "Account {} of {} is missing {}, not probing",
                account.account_id,
                account.service_id,
                missing.join(", ")
            );
            return self.record_outcome(account, false).await;
        }
        let credentials = match self.open_all(&account) {
            Ok(credentials) => credentials,
            Err(e) => {
                self.mark_undecryptable(&account, &e).await;
                return Err(e);
            }
        };

        let ctx = ProbeContext {
            service_id: account.service_id.clone(),
            account_id: account.account_id.clone(),
            credentials,
        };
        let timeout = self.inner.config.probe_timeout();
        // Spawned so that giving up on the wait leaves the probe running
        let task = tokio::spawn(async move { validator.probe(ctx).await });

        let passed = match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                warn!(
                    "Validation of {} timed out after {:?}, status unchanged",
                    account.account_id, timeout
                );
                return Err(Error::Timeout {
                    message: format!("validation of account {}", account.account_id),
                });
            }
            Ok(Err(join_error)) => {
                error!("Validation probe for {} aborted: {}", account.account_id, join_error);
                false
            }
            Ok(Ok(Err(e))) => {
                warn!("Validation probe for {} failed: {}", account.account_id, e);
                false
            }
            Ok(Ok(Ok(passed))) => passed,
        };

        self.record_outcome(account, passed).await
    }

    /// Store the result of probing `account` as it was loaded.
    ///
    /// If the account changed in the meantime (e.g. a credential was rotated)
    /// the result no longer describes it: it is dropped, nothing is broadcast
    /// and the stored status is returned.
    async fn record_outcome(
        &self,
        mut account: AccountRecord,
        passed: bool,
    ) -> Result<ValidationStatus> {
        let probed_version = account.version();
        let now = self.now();
        let schedule = &self.inner.schedule;

        account.last_validated_at = Some(now);
        if passed {
            account.validation_status = ValidationStatus::Valid;
            account.consecutive_failures = 0;
            account.next_validation_allowed_at = Some(schedule.next_after_success(now));
            account.last_used_at = Some(now);
        } else {
            account.validation_status = ValidationStatus::Invalid;
            account.consecutive_failures = account.consecutive_failures.saturating_add(1);
            account.next_validation_allowed_at =
                Some(schedule.next_after_failure(now, account.consecutive_failures));
        }

        match self
            .inner
            .store
            .save_if_version(&mut account, probed_version)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                info!(
                    "Account {} changed while it was validated, discarding the result",
                    account.account_id
                );
                let current: AccountRecord = self.inner.store.load(&account.account_id).await?;
                return Ok(current.validation_status);
            }
            Err(e) => return Err(e),
        }

        if passed {
            info!("Account {} of {} validated", account.account_id, account.service_id);
        } else {
            warn!(
                "Account {} of {} failed validation ({} in a row, next attempt after {:?})",
                account.account_id,
                account.service_id,
                account.consecutive_failures,
                account.next_validation_allowed_at
            );
        }
        self.broadcast(&account, now);
        Ok(account.validation_status)
    }

    /// Record that an account's credentials cannot be opened
    async fn mark_undecryptable(&self, account: &AccountRecord, cause: &Error) {
        error!(
            "Credentials of account {} ({}) cannot be decrypted: {}",
            account.account_id, account.service_id, cause
        );
        let marked = self
            .inner
            .store
            .update::<AccountRecord, _>(&account.account_id, self.cas_attempts(), |account| {
                if account.validation_status == ValidationStatus::Invalid {
                    return Ok(false);
                }
                account.validation_status = ValidationStatus::Invalid;
                Ok(true)
            })
            .await;
        match marked {
            Ok(account) => self.broadcast(&account, self.now()),
            Err(e) => warn!("Failed to mark account {} invalid: {}", account.account_id, e),
        }
    }

    fn open_all(&self, account: &AccountRecord) -> Result<Credentials> {
        let master = self.master_key()?;
        let mut values = BTreeMap::new();
        for (name, sealed) in &account.credentials {
            let aad = credential_aad(&account.account_id, name);
            values.insert(name.clone(), open(master, sealed, aad.as_bytes())?);
        }
        Ok(Credentials::new(values))
    }

    fn broadcast(&self, account: &AccountRecord, at: DateTime<Utc>) {
        // No receivers is fine
        let _ = self.inner.outcomes.send(ValidationOutcome {
            at,
            ..ValidationOutcome::of(account)
        });
    }

    fn validator_for(&self, service_id: &str) -> Result<Arc<dyn Validator>> {
        self.inner
            .validators
            .read()
            .get(service_id)
            .cloned()
            .ok_or_else(|| Error::invalid(format!("no validator registered for service {service_id}")))
    }

    fn master_key(&self) -> Result<&MasterKey> {
        self.inner
            .master_key
            .as_ref()
            .ok_or_else(|| Error::encryption("master key unavailable"))
    }

    fn cas_attempts(&self) -> u32 {
        self.inner.config.cas_attempts
    }

    fn now(&self) -> DateTime<Utc> {
        (self.inner.clock)()
    }
}

/// Binds a ciphertext to its account and credential name
fn credential_aad(account_id: &str, name: &str) -> String {
    format!("{account_id}:{name}")
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("has_master_key", &self.inner.master_key.is_some())
            .field("validators", &self.inner.validators.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::StateBus;
    use crate::config::{RetryConfig, StoreConfig};
    use crate::connection::{ConnectionManager, MemoryBackend};
    use crate::vault::validator_fn;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    /// Manually advanced clock
    #[derive(Clone)]
    pub(crate) struct TestClock(Arc<parking_lot::Mutex<DateTime<Utc>>>);

    impl TestClock {
        pub fn new() -> Self {
            Self(Arc::new(parking_lot::Mutex::new(Utc::now())))
        }

        pub fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }

        pub fn advance(&self, by: chrono::Duration) {
            *self.0.lock() += by;
        }

        pub fn clock(&self) -> Clock {
            let inner = self.0.clone();
            Arc::new(move || *inner.lock())
        }
    }

    pub(crate) fn fixture() -> (CredentialVault, Arc<MemoryBackend>, TestClock) {
        let (conn, backend) =
            ConnectionManager::in_memory(&StoreConfig::default(), RetryConfig::default());
        let store = RecordStore::new(conn.clone(), StateBus::new(conn, "suite"));
        let clock = TestClock::new();
        let vault = CredentialVault::with_clock(
            store,
            Some(MasterKey::generate()),
            VaultConfig {
                probe_timeout_ms: 200,
                ..VaultConfig::default()
            },
            clock.clock(),
        );
        (vault, backend, clock)
    }

    async fn service(vault: &CredentialVault, id: &str) {
        let mut descriptor = ServiceDescriptor::new(id, id);
        vault
            .store()
            .save_if_version(&mut descriptor, 0)
            .await
            .expect("service");
    }

    #[tokio::test]
    async fn test_credentials_are_sealed_at_rest() {
        let (vault, backend, _) = fixture();
        service(&vault, "jira").await;
        let account = vault.add_account("jira", "work").await.expect("add");

        vault
            .set_credential(&account, "api_key", "abc123")
            .await
            .expect("set");

        let raw = backend
            .get_raw(&format!("suite:account:{account}"))
            .expect("stored");
        let stored = raw.get("credentials").expect("credentials field");
        assert!(!stored.contains("abc123"));
        assert!(stored.contains("v1:"));

        assert_eq!(
            vault.get_credential(&account, "api_key").await.expect("get"),
            "abc123"
        );
        assert!(vault
            .get_credential(&account, "password")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_add_account_requires_service_and_sets_first_default() {
        let (vault, _, _) = fixture();
        assert!(vault.add_account("nope", "x").await.unwrap_err().is_not_found());

        service(&vault, "jira").await;
        let first = vault.add_account("jira", "first").await.expect("add");
        let second = vault.add_account("jira", "second").await.expect("add");

        let summaries = vault.list_accounts("jira").await.expect("list");
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].account_id, first);
        assert!(summaries[0].is_default);
        assert!(!summaries[1].is_default);

        vault.set_default(&second).await.expect("default");
        let summaries = vault.list_accounts("jira").await.expect("list");
        let defaults: Vec<&str> = summaries
            .iter()
            .filter(|s| s.is_default)
            .map(|s| s.account_id.as_str())
            .collect();
        assert_eq!(defaults, vec![second.as_str()]);
    }

    #[tokio::test]
    async fn test_remove_account_detaches_and_clears_default() {
        let (vault, _, _) = fixture();
        service(&vault, "jira").await;
        let account = vault.add_account("jira", "only").await.expect("add");

        vault.remove_account(&account).await.expect("remove");
        assert!(vault.account(&account).await.unwrap_err().is_not_found());

        let descriptor: ServiceDescriptor = vault.store().load("jira").await.expect("load");
        assert!(descriptor.accounts.is_empty());
        assert_eq!(descriptor.default_account_id, None);
    }

    #[tokio::test]
    async fn test_validation_backoff_and_reset() {
        let (vault, _, clock) = fixture();
        service(&vault, "jira").await;
        let account = vault.add_account("jira", "work").await.expect("add");
        vault.set_credential(&account, "api_key", "k").await.expect("set");

        let healthy = Arc::new(AtomicBool::new(false));
        let probes = Arc::new(AtomicU32::new(0));
        {
            let healthy = healthy.clone();
            let probes = probes.clone();
            vault.register_validator(
                "jira",
                validator_fn(move |_| {
                    probes.fetch_add(1, Ordering::SeqCst);
                    let ok = healthy.load(Ordering::SeqCst);
                    async move { Ok(ok) }
                }),
            );
        }

        let mut expected = Vec::new();
        for _ in 0..3 {
            let status = vault.validate(&account).await.expect("validate");
            assert_eq!(status, ValidationStatus::Invalid);
            let record = vault.account(&account).await.expect("load");
            let delay = record.next_validation_allowed_at.expect("scheduled")
                - record.last_validated_at.expect("validated");
            expected.push(delay.num_seconds());

            // Not due yet: cached status, no probe
            let before = probes.load(Ordering::SeqCst);
            assert_eq!(
                vault.validate(&account).await.expect("cached"),
                ValidationStatus::Invalid
            );
            assert_eq!(probes.load(Ordering::SeqCst), before);

            clock.advance(delay);
        }
        assert_eq!(expected, vec![1, 2, 4]);

        healthy.store(true, Ordering::SeqCst);
        assert_eq!(
            vault.validate(&account).await.expect("validate"),
            ValidationStatus::Valid
        );
        let record = vault.account(&account).await.expect("load");
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_connection_ignores_schedule() {
        let (vault, _, _) = fixture();
        service(&vault, "jira").await;
        let account = vault.add_account("jira", "work").await.expect("add");
        vault.set_credential(&account, "api_key", "k").await.expect("set");
        vault.register_validator("jira", validator_fn(|_| async { Ok(false) }));

        vault.validate(&account).await.expect("validate");
        vault.test_connection(&account).await.expect("test");
        let record = vault.account(&account).await.expect("load");
        assert_eq!(record.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_probe_timeout_leaves_status_unchanged() {
        let (vault, _, _) = fixture();
        service(&vault, "jira").await;
        let account = vault.add_account("jira", "work").await.expect("add");
        vault.set_credential(&account, "api_key", "k").await.expect("set");
        let finished = Arc::new(AtomicBool::new(false));
        {
            let finished = finished.clone();
            vault.register_validator(
                "jira",
                validator_fn(move |_| {
                    let finished = finished.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(400)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok(true)
                    }
                }),
            );
        }

        let err = vault.validate(&account).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        let record = vault.account(&account).await.expect("load");
        assert_eq!(record.validation_status, ValidationStatus::Unknown);
        assert_eq!(record.consecutive_failures, 0);

        // The probe itself was not cancelled
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_rotation_during_validation_discards_stale_result() {
        let (vault, _, _) = fixture();
        service(&vault, "jira").await;
        let account = vault.add_account("jira", "work").await.expect("add");
        vault.set_credential(&account, "api_key", "old-bad").await.expect("set");
        vault.register_validator(
            "jira",
            validator_fn(|ctx: ProbeContext| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(ctx.credentials.get("api_key") == Some("new-good"))
            }),
        );
        let mut outcomes = vault.outcomes();

        let (status, rotated) = tokio::join!(vault.validate(&account), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            vault.set_credential(&account, "api_key", "new-good").await
        });
        rotated.expect("rotate");
        assert_eq!(status.expect("validate"), ValidationStatus::Unknown);

        let record = vault.account(&account).await.expect("load");
        assert_eq!(record.validation_status, ValidationStatus::Unknown);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.next_validation_allowed_at, None);
        assert!(outcomes.try_recv().is_err());

        assert_eq!(
            vault.validate(&account).await.expect("validate"),
            ValidationStatus::Valid
        );
    }

    #[tokio::test]
    async fn test_missing_required_credential_is_invalid_without_probing() {
        let (vault, _, _) = fixture();
        service(&vault, "jira").await;
        let account = vault.add_account("jira", "work").await.expect("add");
        let probes = Arc::new(AtomicU32::new(0));
        {
            let probes = probes.clone();
            vault.register_validator(
                "jira",
                validator_fn(move |_| {
                    probes.fetch_add(1, Ordering::SeqCst);
                    async { Ok(true) }
                }),
            );
        }

        assert_eq!(
            vault.test_connection(&account).await.expect("test"),
            ValidationStatus::Invalid
        );
        vault.set_credential(&account, "api_secret", "s").await.expect("set");
        assert_eq!(
            vault.test_connection(&account).await.expect("test"),
            ValidationStatus::Invalid
        );
        assert_eq!(probes.load(Ordering::SeqCst), 0);

        vault.set_credential(&account, "api_key", "k").await.expect("set");
        assert_eq!(
            vault.test_connection(&account).await.expect("test"),
            ValidationStatus::Valid
        );
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_master_key_marks_account_invalid() {
        let (vault, _, _) = fixture();
        service(&vault, "jira").await;
        let account = vault.add_account("jira", "work").await.expect("add");
        vault.set_credential(&account, "api_key", "abc123").await.expect("set");

        let other = CredentialVault::new(
            vault.store().clone(),
            Some(MasterKey::generate()),
            VaultConfig::default(),
        );
        let mut outcomes = other.outcomes();
        let err = other.get_credential(&account, "api_key").await.unwrap_err();
        assert!(matches!(err, Error::Encryption { .. }));

        let outcome = outcomes.recv().await.expect("outcome");
        assert_eq!(outcome.status, ValidationStatus::Invalid);
        assert_eq!(
            vault.account(&account).await.expect("load").validation_status,
            ValidationStatus::Invalid
        );
    }

    #[tokio::test]
    async fn test_missing_master_key_is_an_encryption_error() {
        let (vault, _, _) = fixture();
        service(&vault, "jira").await;
        let account = vault.add_account("jira", "work").await.expect("add");

        let keyless = CredentialVault::new(vault.store().clone(), None, VaultConfig::default());
        let err = keyless
            .set_credential(&account, "api_key", "abc123")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Encryption { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_rotation_keeps_both_credentials() {
        let (vault, _, _) = fixture();
        service(&vault, "jira").await;
        let account = vault.add_account("jira", "work").await.expect("add");

        let (a, b) = tokio::join!(
            vault.set_credential(&account, "api_key", "k"),
            vault.set_credential(&account, "api_secret", "s"),
        );
        a.expect("first");
        b.expect("second");

        assert_eq!(vault.get_credential(&account, "api_key").await.expect("key"), "k");
        assert_eq!(vault.get_credential(&account, "api_secret").await.expect("secret"), "s");
    }
}
