//! Peer-pod secret fetching.
//!
//! Secrets are requested by resource name (e.g. `pp-sid/privateKey`) and
//! retried with capped exponential backoff until every registered name has
//! resolved to non-empty bytes.

use async_trait::async_trait;
use securecomms_core::{Backoff, CommsError, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Source of named secrets.
#[async_trait]
pub trait GetSecret: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<Vec<u8>>;
}

/// Named secrets resolved through a [`GetSecret`] source.
pub struct PpSecrets {
    keys: Vec<(String, Option<Vec<u8>>)>,
    source: Arc<dyn GetSecret>,
}

impl PpSecrets {
    pub fn new(source: Arc<dyn GetSecret>) -> Self {
        Self {
            keys: Vec::new(),
            source,
        }
    }

    /// Register a name. Re-adding is a no-op.
    pub fn add_key(&mut self, name: &str) {
        if !self.keys.iter().any(|(k, _)| k == name) {
            self.keys.push((name.to_string(), None));
        }
    }

    pub fn get_key(&self, name: &str) -> Option<&[u8]> {
        self.keys
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Store a value for a registered, unresolved name.
    ///
    /// Empty values and already resolved names are left untouched; returns
    /// whether the value was stored.
    pub fn set_key(&mut self, name: &str, value: Vec<u8>) -> bool {
        if value.is_empty() {
            return false;
        }
        match self.keys.iter_mut().find(|(k, _)| k == name) {
            Some((_, slot @ None)) => {
                *slot = Some(value);
                true
            }
            _ => false,
        }
    }

    /// Resolve every registered name, retrying failures and empty answers.
    ///
    /// Only returns an error when `cancel` fires.
    pub async fn go(&mut self, cancel: &CancellationToken) -> Result<()> {
        let source = self.source.clone();
        // One sequence for the whole walk; a later key never restarts at 1s.
        let mut backoff = Backoff::default();
        for (name, slot) in self.keys.iter_mut().filter(|(_, v)| v.is_none()) {
            loop {
                if cancel.is_cancelled() {
                    return Err(CommsError::Cancelled(format!("fetching secret '{}'", name)));
                }
                match source.get_secret(name).await {
                    Ok(value) if !value.is_empty() => {
                        tracing::info!(%name, "Fetched secret");
                        *slot = Some(value);
                        break;
                    }
                    Ok(_) => tracing::warn!(%name, "Secret is empty, retrying"),
                    Err(e) => tracing::warn!(%name, error = %e, "Failed to fetch secret, retrying"),
                }
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(CommsError::Cancelled(format!("fetching secret '{}'", name)));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        Ok(())
    }
}
