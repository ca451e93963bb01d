//! Service Registry
//!
//! Process-wide catalog of service descriptors. The registry owns lifecycle
//! transitions, answers discovery from an in-process cache and reacts to
//! credential validation outcomes.
//!
//! ## Cache
//!
//! One async mutex per service id guards the cached descriptor. Local writes
//! hold the bucket for the whole store round trip, so a concurrent refresh
//! driven by a `StateEvent` can never overwrite them with older data. The
//! cache is refreshed from descriptor events and rebuilt wholesale whenever
//! the store connection recovers.

use super::descriptor::*;
use crate::bus::{BusSignal, StateEvent};
use crate::constants::CAS_RETRY_ATTEMPTS;
use crate::error::{Error, Result};
use crate::store::{Persistable, RecordMeta, RecordStore, validate_segment};
use crate::vault::{AccountRecord, CredentialVault, ValidationOutcome, ValidationStatus};
use ahash::{AHashMap, AHashSet};
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Warning recorded when a service has nothing to validate
pub const NO_CREDENTIALS_DETAIL: &str = "no credentials configured";

type Bucket = Arc<tokio::sync::Mutex<Option<ServiceDescriptor>>>;

struct RegistryInner {
    store: RecordStore,
    vault: CredentialVault,
    buckets: Mutex<AHashMap<String, Bucket>>,
    synced: AtomicBool,
    cas_attempts: u32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    pub fn new(store: RecordStore, vault: CredentialVault) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                vault,
                buckets: Mutex::new(AHashMap::new()),
                synced: AtomicBool::new(false),
                cas_attempts: CAS_RETRY_ATTEMPTS,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.inner.vault
    }

    /// Build the cache and start following descriptor events, validation
    /// outcomes and connection health.
    pub async fn start(&self) -> Result<usize> {
        let count = self.rebuild_cache().await?;

        let mut events = self
            .inner
            .store
            .bus()
            .subscribe_type_signals(ServiceDescriptor::TYPE_NAME)
            .await?;
        let mut outcomes = self.inner.vault.outcomes();
        let mut health = self.inner.store.connection().health_watch();

        let registry = self.clone();
        let event_task = tokio::spawn(async move {
            while let Some(signal) = events.next().await {
                registry.apply_signal(signal).await;
            }
            debug!("Service event stream ended");
        });

        let registry = self.clone();
        let outcome_task = tokio::spawn(async move {
            loop {
                match outcomes.recv().await {
                    Ok(outcome) => {
                        if let Err(e) = registry.on_validation_outcome(&outcome).await {
                            warn!(
                                "Failed to apply validation outcome of {} to {}: {}",
                                outcome.account_id, outcome.service_id, e
                            );
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} validation outcomes, reconciling", skipped);
                        if let Err(e) = registry.reconcile_statuses().await {
                            warn!("Failed to reconcile service statuses: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let registry = self.clone();
        let health_task = tokio::spawn(async move {
            health.borrow_and_update();
            // Only real transitions notify, so a change that ends healthy
            // means we went through unhealthy, even if that value was coalesced
            while health.changed().await.is_ok() {
                if *health.borrow_and_update() {
                    info!("Store connection recovered, rebuilding service cache");
                    if let Err(e) = registry.rebuild_cache().await {
                        warn!("Service cache rebuild failed: {}", e);
                    }
                }
            }
        });

        self.inner
            .tasks
            .lock()
            .extend([event_task, outcome_task, health_task]);
        info!("Service registry started with {} services", count);
        Ok(count)
    }

    /// Stop the background tasks spawned by `start`
    pub fn stop(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Register a service.
    ///
    /// A new id is created in `Uninitialized`. An id whose stored descriptor is
    /// `Terminated` is re-registered and keeps its accounts. Any other stored
    /// status fails with `DuplicateService`.
    pub async fn register(&self, descriptor: ServiceDescriptor) -> Result<ServiceDescriptor> {
        validate_segment("service id", &descriptor.service_id)?;
        let service_id = descriptor.service_id.clone();
        let bucket = self.bucket(&service_id);
        let mut slot = bucket.lock().await;
        let store = &self.inner.store;

        let mut fresh = ServiceDescriptor {
            meta: RecordMeta::default(),
            status: ServiceStatus::Uninitialized,
            accounts: Vec::new(),
            default_account_id: None,
            status_detail: None,
            ..descriptor
        };
        match store.save_if_version(&mut fresh, 0).await {
            Ok(_) => {
                info!("Registered service {} ({})", service_id, fresh.service_name);
                *slot = Some(fresh.clone());
                return Ok(fresh);
            }
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e),
        }

        let mut existing: ServiceDescriptor = store.load(&service_id).await?;
        if existing.status != ServiceStatus::Terminated {
            warn!(
                "Rejected registration of {}: already registered ({})",
                service_id, existing.status
            );
            *slot = Some(existing);
            return Err(Error::DuplicateService { service_id });
        }

        existing.transition(ServiceStatus::Uninitialized)?;
        existing.service_name = fresh.service_name;
        existing.is_enabled = fresh.is_enabled;
        existing.status_detail = None;
        let expected = existing.version();
        match store.save_if_version(&mut existing, expected).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                warn!("Concurrent registration of {} won the race", service_id);
                return Err(Error::DuplicateService { service_id });
            }
            Err(e) => return Err(e),
        }

        info!(
            "Re-registered service {} with {} existing accounts",
            service_id,
            existing.accounts.len()
        );
        *slot = Some(existing.clone());
        Ok(existing)
    }

    /// Descriptor of `service_id`, from the cache when present
    pub async fn get(&self, service_id: &str) -> Result<ServiceDescriptor> {
        let bucket = self.bucket(service_id);
        let mut slot = bucket.lock().await;
        if let Some(descriptor) = slot.as_ref() {
            return Ok(descriptor.clone());
        }
        let descriptor: ServiceDescriptor = self.inner.store.load(service_id).await?;
        *slot = Some(descriptor.clone());
        Ok(descriptor)
    }

    /// Cached descriptors matching `filter`, ordered by service id
    pub async fn discover(&self, filter: &ServiceFilter) -> Result<Vec<ServiceDescriptor>> {
        if !self.inner.synced.load(Ordering::SeqCst) {
            self.rebuild_cache().await?;
        }

        let buckets: Vec<Bucket> = self.inner.buckets.lock().values().cloned().collect();
        let mut found = Vec::new();
        for bucket in buckets {
            if let Some(descriptor) = bucket.lock().await.as_ref()
                && filter.matches(descriptor)
            {
                found.push(descriptor.clone());
            }
        }
        found.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        Ok(found)
    }

    /// Load prior state, validate every active account and settle on Ready or
    /// Degraded. Returns the resulting status.
    pub async fn initialize(&self, service_id: &str) -> Result<ServiceStatus> {
        let descriptor = self
            .transition_with(service_id, |d| {
                d.transition(ServiceStatus::Initializing)?;
                d.status_detail = None;
                Ok(true)
            })
            .await?;
        info!(
            "Initializing {} ({} accounts)",
            service_id,
            descriptor.accounts.len()
        );

        let vault = &self.inner.vault;
        let mut configured = 0usize;
        let mut valid = 0usize;
        for account_id in &descriptor.accounts {
            let account = match vault.account(account_id).await {
                Ok(account) => account,
                Err(e) => {
                    warn!("Skipping account {} of {}: {}", account_id, service_id, e);
                    continue;
                }
            };
            if !account.is_active {
                continue;
            }
            configured += 1;
            match vault.validate(account_id).await {
                Ok(ValidationStatus::Valid) => valid += 1,
                Ok(status) => debug!("Account {} of {} is {}", account_id, service_id, status),
                Err(e) => warn!("Validation of account {} of {} failed: {}", account_id, service_id, e),
            }
        }

        let (target, detail) = if configured == 0 {
            (ServiceStatus::Degraded, Some(NO_CREDENTIALS_DETAIL.to_string()))
        } else if valid == 0 {
            (
                ServiceStatus::Degraded,
                Some(format!("none of {configured} configured accounts is valid")),
            )
        } else {
            (ServiceStatus::Ready, None)
        };

        let now = Utc::now();
        let settled = self
            .transition_with(service_id, |d| {
                // Shut down while we were validating
                if d.status != ServiceStatus::Initializing {
                    return Ok(false);
                }
                d.transition(target)?;
                d.status_detail = detail.clone();
                d.last_active = Some(now);
                Ok(true)
            })
            .await?;

        match (&settled.status, &settled.status_detail) {
            (ServiceStatus::Degraded, Some(detail)) => {
                warn!("Service {} is degraded: {}", service_id, detail)
            }
            (status, _) => info!("Service {} is {}", service_id, status),
        }
        Ok(settled.status)
    }

    /// Move the service through ShuttingDown to Terminated.
    ///
    /// Succeeds from any state; shutting down a terminated service is a no-op.
    pub async fn shutdown(&self, service_id: &str) -> Result<()> {
        let descriptor = self
            .transition_with(service_id, |d| {
                if matches!(d.status, ServiceStatus::ShuttingDown | ServiceStatus::Terminated) {
                    return Ok(false);
                }
                d.transition(ServiceStatus::ShuttingDown)?;
                Ok(true)
            })
            .await?;
        if descriptor.status == ServiceStatus::Terminated {
            debug!("Service {} already terminated", service_id);
            return Ok(());
        }
        info!("Shutting down {}", service_id);

        self.transition_with(service_id, |d| {
            if d.status == ServiceStatus::Terminated {
                return Ok(false);
            }
            d.transition(ServiceStatus::ShuttingDown)?;
            d.transition(ServiceStatus::Terminated)?;
            d.status_detail = None;
            Ok(true)
        })
        .await?;
        info!("Service {} terminated", service_id);
        Ok(())
    }

    /// Delete a terminated service together with every account it owns
    pub async fn deregister(&self, service_id: &str) -> Result<()> {
        let bucket = self.bucket(service_id);
        let mut slot = bucket.lock().await;
        let store = &self.inner.store;

        let descriptor: ServiceDescriptor = store.load(service_id).await?;
        if descriptor.status != ServiceStatus::Terminated {
            return Err(Error::InvalidTransition {
                service_id: service_id.to_string(),
                from: descriptor.status.to_string(),
                to: "deregistered".to_string(),
            });
        }

        for account_id in &descriptor.accounts {
            match store.delete::<AccountRecord>(account_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        store.delete::<ServiceDescriptor>(service_id).await?;
        *slot = None;
        info!(
            "Deregistered {} and {} accounts",
            service_id,
            descriptor.accounts.len()
        );
        Ok(())
    }

    pub async fn set_enabled(&self, service_id: &str, enabled: bool) -> Result<()> {
        self.transition_with(service_id, |d| {
            if d.is_enabled == enabled {
                return Ok(false);
            }
            d.is_enabled = enabled;
            Ok(true)
        })
        .await?;
        info!(
            "Service {} {}",
            service_id,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Ready ⇄ Degraded driven by account validation results.
    ///
    /// A failure degrades a Ready service only when no other active account of
    /// that service is still valid; a success restores a Degraded one.
    pub async fn on_validation_outcome(&self, outcome: &ValidationOutcome) -> Result<()> {
        let service_id = outcome.service_id.as_str();
        let account_id = outcome.account_id.as_str();
        match outcome.status {
            ValidationStatus::Unknown => Ok(()),
            ValidationStatus::Valid => {
                let result = self
                    .transition_with(service_id, |d| {
                        if d.status != ServiceStatus::Degraded || !d.has_account(account_id) {
                            return Ok(false);
                        }
                        d.transition(ServiceStatus::Ready)?;
                        d.status_detail = None;
                        Ok(true)
                    })
                    .await;
                ignore_missing(result)
            }
            ValidationStatus::Invalid => {
                let descriptor = match self.get(service_id).await {
                    Ok(d) => d,
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => return Err(e),
                };
                if descriptor.status != ServiceStatus::Ready {
                    return Ok(());
                }
                for other in descriptor.accounts.iter().filter(|a| *a != account_id) {
                    if let Ok(account) = self.inner.vault.account(other).await
                        && account.is_active
                        && account.validation_status == ValidationStatus::Valid
                    {
                        return Ok(());
                    }
                }

                let detail = format!("account {account_id} failed validation");
                let result = self
                    .transition_with(service_id, |d| {
                        if d.status != ServiceStatus::Ready || !d.has_account(account_id) {
                            return Ok(false);
                        }
                        d.transition(ServiceStatus::Degraded)?;
                        d.status_detail = Some(detail.clone());
                        Ok(true)
                    })
                    .await;
                if let Ok(d) = &result
                    && d.status == ServiceStatus::Degraded
                {
                    warn!("Service {} is degraded: {}", service_id, detail);
                }
                ignore_missing(result)
            }
        }
    }

    /// Re-derive Ready/Degraded of every running service from the stored
    /// validation state of its accounts
    pub async fn reconcile_statuses(&self) -> Result<()> {
        let running: Vec<ServiceDescriptor> = self
            .discover(&ServiceFilter::all())
            .await?
            .into_iter()
            .filter(|d| d.status.is_running())
            .collect();

        for descriptor in running {
            let mut deciding: Option<ValidationOutcome> = None;
            for account_id in &descriptor.accounts {
                let Ok(account) = self.inner.vault.account(account_id).await else {
                    continue;
                };
                if !account.is_active {
                    continue;
                }
                match account.validation_status {
                    ValidationStatus::Valid => {
                        deciding = Some(ValidationOutcome::of(&account));
                        break;
                    }
                    ValidationStatus::Invalid if deciding.is_none() => {
                        deciding = Some(ValidationOutcome::of(&account));
                    }
                    _ => {}
                }
            }
            if let Some(outcome) = deciding {
                self.on_validation_outcome(&outcome).await?;
            }
        }
        Ok(())
    }

    /// Replace the whole cache with what the store holds now
    pub async fn rebuild_cache(&self) -> Result<usize> {
        let mut listing = self
            .inner
            .store
            .list::<ServiceDescriptor, _>(|_| true);
        let mut loaded = Vec::new();
        while let Some(item) = listing.next().await {
            match item {
                Ok(descriptor) => loaded.push(descriptor),
                Err(e @ Error::Serialization { .. }) => {
                    error!("Skipping corrupt service descriptor: {}", e)
                }
                Err(e) => return Err(e),
            }
        }

        let seen: AHashSet<String> = loaded.iter().map(|d| d.service_id.clone()).collect();
        let count = loaded.len();
        for descriptor in loaded {
            let bucket = self.bucket(&descriptor.service_id);
            let mut slot = bucket.lock().await;
            keep_newest(&mut slot, descriptor);
        }

        let vanished: Vec<Bucket> = self
            .inner
            .buckets
            .lock()
            .iter()
            .filter(|(id, _)| !seen.contains(*id))
            .map(|(_, bucket)| bucket.clone())
            .collect();
        for bucket in vanished {
            // Cleared slots fall back to the store on the next `get`
            *bucket.lock().await = None;
        }

        self.inner.synced.store(true, Ordering::SeqCst);
        debug!("Service cache rebuilt with {} descriptors", count);
        Ok(count)
    }

    async fn apply_signal(&self, signal: BusSignal) {
        match signal {
            BusSignal::Event(event) => self.refresh(&event).await,
            BusSignal::Lagged(skipped) => {
                warn!("Missed {} service events, rebuilding service cache", skipped);
                if let Err(e) = self.rebuild_cache().await {
                    warn!("Service cache rebuild failed: {}", e);
                }
            }
        }
    }

    /// Apply a descriptor event to the cache
    async fn refresh(&self, event: &StateEvent) {
        let bucket = self.bucket(&event.record_id);
        let mut slot = bucket.lock().await;
        if event.deleted {
            debug!("Service {} removed from cache", event.record_id);
            *slot = None;
            return;
        }
        if slot
            .as_ref()
            .is_some_and(|d| d.version() >= event.new_version)
        {
            return;
        }
        match self
            .inner
            .store
            .load::<ServiceDescriptor>(&event.record_id)
            .await
        {
            Ok(descriptor) => keep_newest(&mut slot, descriptor),
            Err(e) if e.is_not_found() => *slot = None,
            Err(e) => warn!("Failed to refresh service {}: {}", event.record_id, e),
        }
    }

    /// CAS-update the stored descriptor under its cache bucket
    async fn transition_with<F>(&self, service_id: &str, apply: F) -> Result<ServiceDescriptor>
    where
        F: FnMut(&mut ServiceDescriptor) -> Result<bool> + Send,
    {
        let bucket = self.bucket(service_id);
        let mut slot = bucket.lock().await;
        let descriptor = self
            .inner
            .store
            .update::<ServiceDescriptor, _>(service_id, self.inner.cas_attempts, apply)
            .await?;
        keep_newest(&mut slot, descriptor.clone());
        Ok(descriptor)
    }

    fn bucket(&self, service_id: &str) -> Bucket {
        self.inner
            .buckets
            .lock()
            .entry(service_id.to_string())
            .or_default()
            .clone()
    }
}

fn keep_newest(slot: &mut Option<ServiceDescriptor>, descriptor: ServiceDescriptor) {
    if slot
        .as_ref()
        .is_none_or(|cached| cached.version() <= descriptor.version())
    {
        *slot = Some(descriptor);
    }
}

fn ignore_missing(result: Result<ServiceDescriptor>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("cached", &self.inner.buckets.lock().len())
            .field("synced", &self.inner.synced.load(Ordering::SeqCst))
            .finish()
    }
}
