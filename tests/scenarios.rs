//! End-to-end scenarios over the in-memory store

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use suite_core::bus::StateBus;
use suite_core::config::{RetryConfig, StoreConfig, VaultConfig};
use suite_core::connection::{ConnectionManager, MemoryBackend};
use suite_core::helpers::MasterKey;
use suite_core::registry::{
    NO_CREDENTIALS_DETAIL, ServiceDescriptor, ServiceFilter, ServiceRegistry, ServiceStatus,
};
use suite_core::store::RecordStore;
use suite_core::vault::{AccountRecord, Clock, CredentialVault, ValidationStatus, validator_fn};
use suite_core::Error;

struct Suite {
    backend: Arc<MemoryBackend>,
    store: RecordStore,
    registry: ServiceRegistry,
}

impl Suite {
    fn new() -> Self {
        Self::with_vault(VaultConfig::default(), Arc::new(Utc::now))
    }

    fn with_vault(vault_config: VaultConfig, clock: Clock) -> Self {
        let (conn, backend) =
            ConnectionManager::in_memory(&StoreConfig::default(), RetryConfig::default());
        let store = RecordStore::new(conn.clone(), StateBus::new(conn, "suite"));
        let vault = CredentialVault::with_clock(
            store.clone(),
            Some(MasterKey::generate()),
            vault_config,
            clock,
        );
        let registry = ServiceRegistry::new(store.clone(), vault);
        Self {
            backend,
            store,
            registry,
        }
    }

    fn vault(&self) -> &CredentialVault {
        self.registry.vault()
    }
}

#[tokio::test]
async fn service_without_accounts_initializes_degraded() {
    let suite = Suite::new();
    suite
        .registry
        .register(ServiceDescriptor::new("jira", "Jira"))
        .await
        .expect("register");

    let mut events = suite
        .store
        .bus()
        .subscribe_record("service", "jira")
        .await
        .expect("subscribe");

    let status = suite.registry.initialize("jira").await.expect("initialize");
    assert_eq!(status, ServiceStatus::Degraded);

    let descriptor = suite.registry.get("jira").await.expect("get");
    assert_eq!(descriptor.status, ServiceStatus::Degraded);
    assert_eq!(descriptor.status_detail.as_deref(), Some(NO_CREDENTIALS_DETAIL));

    // Initializing, then Degraded
    let first = events.next().await.expect("initializing event");
    assert!(first.touches("status"));
    let second = events.next().await.expect("settled event");
    assert_eq!(second.new_version, descriptor.meta.version);
}

#[tokio::test]
async fn credential_is_stored_as_ciphertext() {
    let suite = Suite::new();
    suite
        .registry
        .register(ServiceDescriptor::new("jira", "Jira"))
        .await
        .expect("register");
    let account = suite.vault().add_account("jira", "work").await.expect("add");

    suite
        .vault()
        .set_credential(&account, "api_key", "abc123")
        .await
        .expect("set");

    let raw = suite
        .backend
        .get_raw(&format!("suite:account:{account}"))
        .expect("stored");
    assert!(raw.values().all(|v| !v.contains("abc123")));

    assert_eq!(
        suite
            .vault()
            .get_credential(&account, "api_key")
            .await
            .expect("get"),
        "abc123"
    );
}

#[tokio::test]
async fn concurrent_cas_saves_have_one_winner() {
    let suite = Suite::new();
    suite
        .registry
        .register(ServiceDescriptor::new("jira", "Jira"))
        .await
        .expect("register");
    let account = suite.vault().add_account("jira", "work").await.expect("add");
    suite.vault().deactivate(&account).await.expect("deactivate");
    suite.vault().activate(&account).await.expect("activate");

    let mut first: AccountRecord = suite.store.load(&account).await.expect("load");
    let mut second: AccountRecord = suite.store.load(&account).await.expect("load");
    assert_eq!(first.meta.version, 3);

    first.description = "first".into();
    second.description = "second".into();
    let (a, b) = tokio::join!(
        suite.store.save_if_version(&mut first, 3),
        suite.store.save_if_version(&mut second, 3),
    );

    let outcomes = [a, b];
    let winners: Vec<u64> = outcomes.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(winners, vec![4]);
    assert!(outcomes.iter().any(|r| matches!(
        r,
        Err(Error::Conflict {
            expected: 3,
            actual: 4,
            ..
        })
    )));
}

#[tokio::test]
async fn failing_validation_backs_off() {
    let now = Arc::new(Mutex::new(Utc::now()));
    let clock: Clock = {
        let now = now.clone();
        Arc::new(move || *now.lock())
    };
    let suite = Suite::with_vault(
        VaultConfig {
            validation_base_ms: 1_000,
            validation_multiplier: 2.0,
            validation_cap_ms: 60_000,
            ..VaultConfig::default()
        },
        clock,
    );
    suite
        .registry
        .register(ServiceDescriptor::new("jira", "Jira"))
        .await
        .expect("register");
    let account = suite.vault().add_account("jira", "work").await.expect("add");
    suite
        .vault()
        .set_credential(&account, "api_key", "expired")
        .await
        .expect("set");

    let probes = Arc::new(AtomicU32::new(0));
    {
        let probes = probes.clone();
        suite.vault().register_validator(
            "jira",
            validator_fn(move |_| {
                probes.fetch_add(1, Ordering::SeqCst);
                async { Ok(false) }
            }),
        );
    }

    let mut delays = Vec::new();
    for attempt in 1..=3 {
        assert_eq!(
            suite.vault().validate(&account).await.expect("validate"),
            ValidationStatus::Invalid
        );
        let record = suite.vault().account(&account).await.expect("load");
        assert_eq!(record.consecutive_failures, attempt);
        let delay = record.next_validation_allowed_at.expect("scheduled")
            - record.last_validated_at.expect("validated");
        delays.push(delay.to_std().expect("positive"));

        // Just inside the window: cached status, no probe
        *now.lock() += delay - chrono::Duration::milliseconds(1);
        assert_eq!(
            suite.vault().validate(&account).await.expect("cached"),
            ValidationStatus::Invalid
        );
        assert_eq!(probes.load(Ordering::SeqCst), attempt);

        *now.lock() += chrono::Duration::milliseconds(1);
    }
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
}

#[tokio::test]
async fn deleted_descriptor_is_not_found() {
    let suite = Suite::new();
    suite
        .registry
        .register(ServiceDescriptor::new("jira", "Jira"))
        .await
        .expect("register");
    suite.registry.start().await.expect("start");

    suite
        .store
        .delete::<ServiceDescriptor>("jira")
        .await
        .expect("delete");

    let mut gone = false;
    for _ in 0..200 {
        match suite.registry.get("jira").await {
            Err(e) if e.is_not_found() => {
                gone = true;
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    assert!(gone);
    assert!(suite
        .registry
        .discover(&ServiceFilter::all())
        .await
        .expect("discover")
        .is_empty());
    suite.registry.stop();
}
