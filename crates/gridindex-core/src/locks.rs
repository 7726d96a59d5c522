//! Per-provider serialization of ledger-touching work.
//!
//! The engine and the sweeper both read and rewrite a provider's profit
//! ledger. Each holds the provider's lock for the duration of one unit of
//! work so concurrent handlers for the same provider never interleave.
//! Different providers proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::entity::normalize_address;

/// A map of lazily created async mutexes, one per provider address.
#[derive(Default, Clone)]
pub struct ProviderLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ProviderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock of `provider`.
    pub async fn lock(&self, provider: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = match self.inner.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.entry(normalize_address(provider))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Number of providers that have ever been locked.
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_provider_is_serialized() {
        let locks = ProviderLocks::new();
        let guard = locks.lock("0xAA").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("0xaa").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn different_providers_do_not_block() {
        let locks = ProviderLocks::new();
        let _a = locks.lock("0xaa").await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.lock("0xbb"))
            .await
            .expect("second provider must not wait");
        assert_eq!(locks.len(), 2);
    }
}
