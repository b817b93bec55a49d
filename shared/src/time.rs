use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    /// Milliseconds elapsed from `earlier` to `self`, zero if `earlier` is in the future.
    #[must_use]
    pub fn since(self, earlier: UnixTimeMs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Source of wall-clock time for services.
///
/// Services never read the system clock directly so tests can drive lease
/// expiry and grace periods with a [`ManualClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start.0)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, at: UnixTimeMs) {
        self.now_ms.store(at.0, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(UnixTimeMs(1_700_000_000_000))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> UnixTimeMs {
        (**self).now()
    }
}
