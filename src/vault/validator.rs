//! Connectivity probes supplied by service adapters.
//!
//! The vault knows nothing about external APIs. Each service registers a
//! [`Validator`] that receives the decrypted credentials of one account and
//! reports whether they work.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Decrypted credentials handed to a probe; `Debug` prints names only
#[derive(Clone, Default)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    pub(crate) fn new(values: BTreeMap<String, String>) -> Self {
        Self(values)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|name| (name, "<redacted>")))
            .finish()
    }
}

/// Everything a probe needs to test one account
#[derive(Clone, Debug)]
pub struct ProbeContext {
    pub service_id: String,
    pub account_id: String,
    pub credentials: Credentials,
}

/// Service-specific connectivity check.
///
/// `Ok(true)` marks the account valid, `Ok(false)` or an error marks it
/// invalid. The probe runs on its own task and is not cancelled when the vault
/// stops waiting for it.
#[async_trait]
pub trait Validator: Send + Sync + 'static {
    async fn probe(&self, ctx: ProbeContext) -> Result<bool>;
}

/// Adapter turning an async closure into a [`Validator`]
pub struct FnValidator<F>(F);

#[async_trait]
impl<F, Fut> Validator for FnValidator<F>
where
    F: Fn(ProbeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    async fn probe(&self, ctx: ProbeContext) -> Result<bool> {
        (self.0)(ctx).await
    }
}

pub fn validator_fn<F, Fut>(probe: F) -> Arc<dyn Validator>
where
    F: Fn(ProbeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    Arc::new(FnValidator(probe))
}
