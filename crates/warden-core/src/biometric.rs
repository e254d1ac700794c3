//! Biometric prompt capability
//!
//! The platform prompt (Face ID, fingerprint, ...) is an alternate way into
//! the same `Authenticated` transition as a PIN. The core only needs to know
//! whether it is available and whether the user passed it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

/// Platform biometric prompt
#[async_trait]
pub trait BiometricProvider: Send + Sync {
    /// Whether the device can prompt at all
    fn is_available(&self) -> bool;

    /// Show the prompt and wait for the outcome
    async fn prompt(&self, reason: &str) -> bool;
}

/// Scripted provider for tests and headless use
pub struct StaticBiometric {
    available: AtomicBool,
    accept: AtomicBool,
    prompts: AtomicU32,
}

impl StaticBiometric {
    pub fn new(available: bool, accept: bool) -> Self {
        Self {
            available: AtomicBool::new(available),
            accept: AtomicBool::new(accept),
            prompts: AtomicU32::new(0),
        }
    }

    /// Provider that is present and always passes
    pub fn accepting() -> Self {
        Self::new(true, true)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    /// Number of prompts shown so far
    pub fn prompts(&self) -> u32 {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BiometricProvider for StaticBiometric {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn prompt(&self, _reason: &str) -> bool {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.is_available() && self.accept.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_biometric() {
        let provider = StaticBiometric::accepting();
        assert!(provider.is_available());
        assert!(provider.prompt("unlock").await);

        provider.set_accept(false);
        assert!(!provider.prompt("unlock").await);

        provider.set_accept(true);
        provider.set_available(false);
        assert!(!provider.prompt("unlock").await);
        assert_eq!(provider.prompts(), 3);
    }
}
