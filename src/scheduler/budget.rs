//! Admission control for file bytes held in memory.
//!
//! Admission blocks while the loaded total is at or above the limit, so one
//! file may overshoot it: the loaded total never exceeds `limit + largest file`.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::constants::DEFAULT_MEMORY_BUDGET_BYTES;
use crate::error::Result;

use super::control::CancellationToken;

#[derive(Debug, Default)]
struct BudgetState {
    loaded: u64,
    peak: u64,
    waits: u64,
}

/// Snapshot of a budget's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetStats {
    pub limit: u64,
    pub loaded: u64,
    pub peak: u64,
    pub waits: u64,
}

#[derive(Debug)]
pub struct MemoryBudget {
    limit: u64,
    state: Mutex<BudgetState>,
    released: Condvar,
}

static GLOBAL_BUDGET: Lazy<Arc<MemoryBudget>> =
    Lazy::new(|| Arc::new(MemoryBudget::new(DEFAULT_MEMORY_BUDGET_BYTES)));

impl MemoryBudget {
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            state: Mutex::new(BudgetState::default()),
            released: Condvar::new(),
        }
    }

    /// Process-wide budget shared by schedulers that are not given their own.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_BUDGET)
    }

    fn state(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub fn loaded(&self) -> u64 {
        self.state().loaded
    }

    #[must_use]
    pub fn stats(&self) -> BudgetStats {
        let state = self.state();
        BudgetStats {
            limit: self.limit,
            loaded: state.loaded,
            peak: state.peak,
            waits: state.waits,
        }
    }

    /// Reserves `bytes`, waiting in `wait_interval` slices while the budget is
    /// exhausted and re-checking `cancel` between slices.
    pub fn acquire(
        self: &Arc<Self>,
        bytes: u64,
        wait_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<MemoryPermit> {
        let mut state = self.state();
        while state.loaded >= self.limit {
            cancel.check()?;
            state.waits += 1;
            state = self
                .released
                .wait_timeout(state, wait_interval)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.loaded += bytes;
        state.peak = state.peak.max(state.loaded);
        Ok(MemoryPermit {
            budget: Arc::clone(self),
            bytes,
        })
    }

    fn release(&self, bytes: u64) {
        let mut state = self.state();
        debug_assert!(state.loaded >= bytes, "releasing more than was admitted");
        state.loaded = state.loaded.saturating_sub(bytes);
        if state.loaded < self.limit {
            self.released.notify_all();
        }
    }
}

/// Bytes admitted against a [`MemoryBudget`]; released on drop.
#[derive(Debug)]
pub struct MemoryPermit {
    budget: Arc<MemoryBudget>,
    bytes: u64,
}

impl MemoryPermit {
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryPermit {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn permit_releases_on_drop() {
        let budget = Arc::new(MemoryBudget::new(100));
        let token = CancellationToken::new();
        let permit = budget
            .acquire(60, Duration::from_millis(5), &token)
            .expect("admit");
        assert_eq!(budget.loaded(), 60);
        drop(permit);
        assert_eq!(budget.loaded(), 0);
        assert_eq!(budget.stats().peak, 60);
    }

    #[test]
    fn exhausted_budget_observes_cancellation() {
        let budget = Arc::new(MemoryBudget::new(10));
        let token = CancellationToken::new();
        let _held = budget
            .acquire(10, Duration::from_millis(5), &token)
            .expect("admit");
        token.cancel();
        let err = budget
            .acquire(1, Duration::from_millis(5), &token)
            .expect_err("must not admit");
        assert!(err.is_cancellation());
    }

    #[test]
    fn waiter_is_admitted_after_release() {
        let budget = Arc::new(MemoryBudget::new(10));
        let token = CancellationToken::new();
        let held = budget
            .acquire(15, Duration::from_millis(5), &token)
            .expect("oversized first admission");
        let waiter = {
            let budget = Arc::clone(&budget);
            let token = token.clone();
            thread::spawn(move || {
                budget
                    .acquire(4, Duration::from_millis(5), &token)
                    .map(|permit| permit.bytes())
            })
        };
        thread::sleep(Duration::from_millis(30));
        drop(held);
        assert_eq!(waiter.join().expect("join").expect("admitted"), 4);
        assert!(budget.stats().peak <= 15);
    }
}
