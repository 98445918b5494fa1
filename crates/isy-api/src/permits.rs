// Concurrency permits for the REST transport.
//
// The controller tolerates only a handful of parallel requests, and the
// ceiling differs between secure and plaintext listeners and between
// hardware generations. Two counting semaphores bound the in-flight
// request count per class; the probe raises the ceilings exactly once
// when it identifies current-generation firmware.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

/// Ceilings before the platform class is known (legacy hardware).
pub const LEGACY_SECURE_LIMIT: usize = 2;
pub const LEGACY_PLAINTEXT_LIMIT: usize = 5;

/// Ceilings for current-generation firmware.
pub const CURRENT_SECURE_LIMIT: usize = 20;
pub const CURRENT_PLAINTEXT_LIMIT: usize = 50;

/// Which transport class a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionClass {
    /// HTTPS listener.
    Secure,
    /// Plain HTTP listener.
    Plaintext,
}

impl ConnectionClass {
    /// Classify a request URL by scheme. Anything that is not `https`
    /// goes through the plaintext permits.
    pub fn from_url(url: &Url) -> Self {
        if url.scheme() == "https" {
            Self::Secure
        } else {
            Self::Plaintext
        }
    }
}

/// Counting concurrency limiters for the two transport classes.
///
/// Permits start at the conservative legacy ceilings. [`upgrade`](Self::upgrade)
/// adds permits to the existing semaphores rather than replacing them, so
/// callers already queued on `acquire` are released by the upgrade instead
/// of being stranded on a dead semaphore.
#[derive(Debug)]
pub struct PermitPool {
    secure: Arc<Semaphore>,
    plaintext: Arc<Semaphore>,
    upgraded: AtomicBool,
}

impl PermitPool {
    /// Create a pool at the legacy ceilings (2 secure / 5 plaintext).
    pub fn new() -> Self {
        Self {
            secure: Arc::new(Semaphore::new(LEGACY_SECURE_LIMIT)),
            plaintext: Arc::new(Semaphore::new(LEGACY_PLAINTEXT_LIMIT)),
            upgraded: AtomicBool::new(false),
        }
    }

    /// Acquire one permit for the given class, waiting if the ceiling is
    /// reached. The permit is released when the returned guard drops,
    /// on every exit path including cancellation.
    pub async fn acquire(&self, class: ConnectionClass) -> OwnedSemaphorePermit {
        let semaphore = match class {
            ConnectionClass::Secure => Arc::clone(&self.secure),
            ConnectionClass::Plaintext => Arc::clone(&self.plaintext),
        };
        // The semaphores are never closed while the pool is alive.
        match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("permit semaphore closed"),
        }
    }

    /// Raise the ceilings to the current-generation limits (20/50).
    ///
    /// Applied at most once; later calls are no-ops. Never downgrades.
    pub fn upgrade(&self) {
        if self.upgraded.swap(true, Ordering::SeqCst) {
            return;
        }
        self.secure
            .add_permits(CURRENT_SECURE_LIMIT - LEGACY_SECURE_LIMIT);
        self.plaintext
            .add_permits(CURRENT_PLAINTEXT_LIMIT - LEGACY_PLAINTEXT_LIMIT);
        tracing::debug!(
            secure = CURRENT_SECURE_LIMIT,
            plaintext = CURRENT_PLAINTEXT_LIMIT,
            "transport concurrency ceilings upgraded"
        );
    }

    /// Whether the one-time upgrade has been applied.
    pub fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::SeqCst)
    }

    /// Currently available permits for a class (mainly for diagnostics).
    pub fn available(&self, class: ConnectionClass) -> usize {
        match class {
            ConnectionClass::Secure => self.secure.available_permits(),
            ConnectionClass::Plaintext => self.plaintext.available_permits(),
        }
    }
}

impl Default for PermitPool {
    fn default() -> Self {
        Self::new()
    }
}
