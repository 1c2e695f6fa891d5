//! Time sources for dead-reckoning.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{SpaceId, Timestamp};

/// Source of the current time as seen by a space.
///
/// Spaces may run their own clocks, so the space is part of the query.
pub trait Clock: Send + Sync {
    fn now(&self, space: &SpaceId) -> Timestamp;
}

/// Wall-clock time shared by all spaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self, _space: &SpaceId) -> Timestamp {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Timestamp::from_secs(secs)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            bits: AtomicU64::new(start.as_secs().to_bits()),
        }
    }

    pub fn set(&self, time: Timestamp) {
        self.bits.store(time.as_secs().to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, secs: f64) {
        let now = f64::from_bits(self.bits.load(Ordering::SeqCst));
        self.set(Timestamp::from_secs(now + secs));
    }

    #[must_use]
    pub fn get(&self) -> Timestamp {
        Timestamp::from_secs(f64::from_bits(self.bits.load(Ordering::SeqCst)))
    }
}

impl Clock for ManualClock {
    fn now(&self, _space: &SpaceId) -> Timestamp {
        self.get()
    }
}
