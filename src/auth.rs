//! Credential lifecycle for the remote store.
//!
//! The coordinator drives a provider through: `initialize` (bounded by the
//! init timeout), one silent attempt, then explicit consent on user request.
//! An unauthorized response from the remote calls `invalidate`; the silent
//! path is not retried after that.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{InitError, Result};

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Bring up whatever the provider depends on.
    async fn initialize(&self) -> std::result::Result<(), InitError>;

    /// Attempt to obtain a credential without user interaction.
    async fn try_silent(&self) -> Result<bool>;

    /// Interactive consent, triggered by the user.
    async fn request_consent(&self) -> Result<bool>;

    fn is_authorized(&self) -> bool;

    /// Bearer token for remote requests, when one applies.
    fn access_token(&self) -> Option<String>;

    /// Drop the current credential after the remote rejected it.
    fn invalidate(&self);
}

/// Provider backed by a fixed token (or none, for remotes that need no
/// credential).
#[derive(Debug)]
pub struct StaticCredentials {
    token: Option<String>,
    silent: bool,
    init_failure: Option<InitError>,
    init_delay: Option<Duration>,
    authorized: AtomicBool,
    consents: AtomicUsize,
}

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token,
            silent: true,
            init_failure: None,
            init_delay: None,
            authorized: AtomicBool::new(false),
            consents: AtomicUsize::new(0),
        }
    }

    /// Always authorizes, never supplies a token.
    pub fn anonymous() -> Self {
        Self::new(None)
    }

    /// Require explicit consent; the silent attempt is declined.
    pub fn consent_only(mut self) -> Self {
        self.silent = false;
        self
    }

    pub fn failing_init(mut self, err: InitError) -> Self {
        self.init_failure = Some(err);
        self
    }

    pub fn slow_init(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    /// Number of consent prompts shown so far.
    pub fn consent_count(&self) -> usize {
        self.consents.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn initialize(&self) -> std::result::Result<(), InitError> {
        if let Some(delay) = self.init_delay {
            tokio::time::sleep(delay).await;
        }
        match &self.init_failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn try_silent(&self) -> Result<bool> {
        if self.silent {
            self.authorized.store(true, Ordering::SeqCst);
        }
        debug!(granted = self.silent, "Silent credential attempt");
        Ok(self.silent)
    }

    async fn request_consent(&self) -> Result<bool> {
        self.consents.fetch_add(1, Ordering::SeqCst);
        self.authorized.store(true, Ordering::SeqCst);
        Ok(true)
    }

    fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    fn access_token(&self) -> Option<String> {
        if self.is_authorized() {
            self.token.clone()
        } else {
            None
        }
    }

    fn invalidate(&self) {
        self.authorized.store(false, Ordering::SeqCst);
    }
}
