//! suite-core - Service Substrate Daemon
//!
//! Connects to the store, starts the service registry and logs service and
//! account changes until interrupted.

use anyhow::Context;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use suite_core::bus::StateBus;
use suite_core::config::SuiteConfig;
use suite_core::connection::{ConnectionManager, StoreUrl};
use suite_core::constants::HEALTH_CHECK_INTERVAL_SECS;
use suite_core::helpers::MasterKey;
use suite_core::registry::{ServiceDescriptor, ServiceFilter, ServiceRegistry};
use suite_core::store::{Persistable, RecordStore};
use suite_core::vault::{AccountRecord, CredentialVault};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = SuiteConfig::load(config_path.as_deref()).context("loading configuration")?;
    let _guard = init_tracing(config.log_dir.as_deref())?;

    info!("Starting suite-core...");
    let url = StoreUrl::parse(&config.store.url).context("parsing store url")?;
    let conn = ConnectionManager::connect(&config.store, config.retry.clone())
        .await
        .with_context(|| format!("connecting to {url}"))?;

    let bus = StateBus::new(conn.clone(), config.store.namespace.as_str());
    let store = RecordStore::new(conn.clone(), bus.clone());
    let master_key = match MasterKey::resolve(&config.vault.master_key) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!("{}; credential values will be unavailable", e);
            None
        }
    };
    let vault = CredentialVault::new(store.clone(), master_key, config.vault.clone());
    let registry = ServiceRegistry::new(store, vault);

    registry.start().await.context("starting service registry")?;
    for service in registry.discover(&ServiceFilter::all()).await? {
        info!(
            "Service {} ({}): {}{}",
            service.service_id,
            service.service_name,
            service.status,
            service
                .status_detail
                .as_deref()
                .map(|d| format!(" - {d}"))
                .unwrap_or_default()
        );
    }

    let monitor = conn.spawn_monitor(Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS));
    let mut services = bus.subscribe_type(ServiceDescriptor::TYPE_NAME).await?;
    let mut accounts = bus.subscribe_type(AccountRecord::TYPE_NAME).await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            Some(event) = services.next() => {
                info!("Service {} v{} changed: {:?}", event.record_id, event.new_version, event.changed_field_names);
            }
            Some(event) = accounts.next() => {
                info!("Account {} v{} changed: {:?}", event.record_id, event.new_version, event.changed_field_names);
            }
            _ = &mut shutdown => {
                info!("Ctrl+C detected");
                break;
            }
        }
    }

    registry.stop();
    monitor.abort();
    info!("suite-core stopped");
    Ok(())
}

/// Console logging, plus a daily rolling file when `log_dir` is set
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer()
        .with_timer(LocalTime::rfc_3339())
        .with_filter(filter());

    let Some(dir) = log_dir else {
        tracing_subscriber::registry().with(console).init();
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "suite-core.log"));
    let file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(filter());
    tracing_subscriber::registry().with(console).with(file).init();
    Ok(Some(guard))
}
