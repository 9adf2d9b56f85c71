//! Injected time, randomness and UUID generation.
//!
//! Engines and the monitor take a [`Runtime`] instead of reaching for the
//! wall clock or a process-wide RNG, so tests control both.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::persistence::models::PLACEHOLDER_PREFIX;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at a settable instant, for tests.
pub struct FrozenClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl FrozenClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(at),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().expect("clock lock") = at;
    }
}

impl Clock for FrozenClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

/// Runtime services shared by the engines: the clock, candidate shuffling
/// and placeholder-UUID generation.
#[derive(Clone)]
pub struct Runtime {
    clock: Arc<dyn Clock>,
    shuffle: bool,
    placeholder_base: u64,
    placeholder_seq: Arc<AtomicU64>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            shuffle: true,
            placeholder_base: rand::thread_rng().gen(),
            placeholder_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A runtime that keeps candidate lists in their stored order, for
    /// reproducible tests.
    pub fn deterministic(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            shuffle: false,
            placeholder_base: 0,
            placeholder_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Randomizes candidate order to spread load across controllers.
    pub fn shuffle<T>(&self, items: &mut [T]) {
        if self.shuffle {
            items.shuffle(&mut rand::thread_rng());
        }
    }

    pub fn pick_index(&self, len: usize) -> usize {
        if !self.shuffle || len <= 1 {
            return 0;
        }
        rand::thread_rng().gen_range(0..len)
    }

    /// A process-unique placeholder UUID reserving a model path until the
    /// remote create returns the real one.
    pub fn placeholder_uuid(&self) -> String {
        let seq = self.placeholder_seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "{PLACEHOLDER_PREFIX}{:016x}{:08x}",
            self.placeholder_base, seq
        )
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
