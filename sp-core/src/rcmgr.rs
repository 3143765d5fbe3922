//! Scope/span admission control. A service opens a named scope whose limit
//! comes from configuration; every task execution reserves its estimated
//! resources through a span and releases them on all exit paths. Task
//! priorities have independent counters so high-priority work cannot be
//! starved by low-priority bulk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScopeStat {
    pub memory: i64,
    pub num_tasks_high: i64,
    pub num_tasks_medium: i64,
    pub num_tasks_low: i64,
    pub num_tasks_total: i64,
}

impl ScopeStat {
    /// Stat of a single task reservation at the given priority.
    pub fn task(priority: crate::task::TaskPriority, memory: i64) -> Self {
        let mut stat = ScopeStat {
            memory,
            num_tasks_total: 1,
            ..Default::default()
        };
        match priority {
            crate::task::TaskPriority::High => stat.num_tasks_high = 1,
            crate::task::TaskPriority::Medium => stat.num_tasks_medium = 1,
            crate::task::TaskPriority::Low => stat.num_tasks_low = 1,
        }
        stat
    }

    /// Component-wise `self <= limit`.
    pub fn fits_in(&self, limit: &ScopeStat) -> bool {
        self.memory <= limit.memory
            && self.num_tasks_high <= limit.num_tasks_high
            && self.num_tasks_medium <= limit.num_tasks_medium
            && self.num_tasks_low <= limit.num_tasks_low
            && self.num_tasks_total <= limit.num_tasks_total
    }

    fn add(&self, other: &ScopeStat) -> ScopeStat {
        ScopeStat {
            memory: self.memory + other.memory,
            num_tasks_high: self.num_tasks_high + other.num_tasks_high,
            num_tasks_medium: self.num_tasks_medium + other.num_tasks_medium,
            num_tasks_low: self.num_tasks_low + other.num_tasks_low,
            num_tasks_total: self.num_tasks_total + other.num_tasks_total,
        }
    }

    fn sub(&self, other: &ScopeStat) -> ScopeStat {
        ScopeStat {
            memory: self.memory - other.memory,
            num_tasks_high: self.num_tasks_high - other.num_tasks_high,
            num_tasks_medium: self.num_tasks_medium - other.num_tasks_medium,
            num_tasks_low: self.num_tasks_low - other.num_tasks_low,
            num_tasks_total: self.num_tasks_total - other.num_tasks_total,
        }
    }
}

#[derive(Debug)]
struct ScopeState {
    limit: ScopeStat,
    used: ScopeStat,
}

/// Per-service resource scope. Cloning shares the underlying accounting.
#[derive(Debug, Clone)]
pub struct ResourceScope {
    name: String,
    state: Arc<Mutex<ScopeState>>,
}

impl ResourceScope {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn begin_span(&self) -> ResourceSpan {
        ResourceSpan {
            state: self.state.clone(),
            reserved: ScopeStat::default(),
        }
    }

    pub fn remaining_resource(&self) -> ScopeStat {
        let state = self.state.lock().unwrap();
        state.limit.sub(&state.used)
    }
}

/// A live reservation inside a scope. The reservation is returned when the
/// span is dropped or `done()` is called, whichever comes first.
#[derive(Debug)]
pub struct ResourceSpan {
    state: Arc<Mutex<ScopeState>>,
    reserved: ScopeStat,
}

impl ResourceSpan {
    /// Reserves `delta` on top of any prior reservation held by this span.
    /// The reservation is all-or-nothing.
    pub fn reserve_resources(&mut self, delta: &ScopeStat) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let next = state.used.add(delta);
        if !next.fits_in(&state.limit) {
            return Err(Error::ResourceLimitExceeded);
        }
        state.used = next;
        self.reserved = self.reserved.add(delta);
        Ok(())
    }

    pub fn done(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.reserved != ScopeStat::default() {
            let mut state = self.state.lock().unwrap();
            state.used = state.used.sub(&self.reserved);
            self.reserved = ScopeStat::default();
        }
    }
}

impl Drop for ResourceSpan {
    fn drop(&mut self) {
        self.release();
    }
}

/// Process-wide resource manager holding per-service limits.
#[derive(Debug)]
pub struct ResourceManager {
    service_limits: Mutex<HashMap<String, ScopeStat>>,
    default_limit: ScopeStat,
}

impl ResourceManager {
    pub fn new(default_limit: ScopeStat) -> Self {
        ResourceManager {
            service_limits: Mutex::new(HashMap::new()),
            default_limit,
        }
    }

    pub fn set_service_limit(&self, name: &str, limit: ScopeStat) {
        self.service_limits
            .lock()
            .unwrap()
            .insert(name.to_string(), limit);
    }

    pub fn open_service(&self, name: &str) -> ResourceScope {
        let limit = self
            .service_limits
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(self.default_limit);
        ResourceScope {
            name: name.to_string(),
            state: Arc::new(Mutex::new(ScopeState {
                limit,
                used: ScopeStat::default(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;

    fn small_limit() -> ScopeStat {
        ScopeStat {
            memory: 100,
            num_tasks_high: 2,
            num_tasks_medium: 2,
            num_tasks_low: 1,
            num_tasks_total: 4,
        }
    }

    #[test]
    fn test_reserve_and_release() {
        let mgr = ResourceManager::new(small_limit());
        let scope = mgr.open_service("executor");
        let mut span = scope.begin_span();
        span.reserve_resources(&ScopeStat::task(TaskPriority::High, 60))
            .unwrap();
        assert_eq!(scope.remaining_resource().memory, 40);
        assert_eq!(scope.remaining_resource().num_tasks_high, 1);
        span.done();
        assert_eq!(scope.remaining_resource(), small_limit());
    }

    #[test]
    fn test_reservation_is_all_or_nothing() {
        let mgr = ResourceManager::new(small_limit());
        let scope = mgr.open_service("executor");
        let mut span = scope.begin_span();
        // memory fits but the low-priority slot is exhausted by the first call
        span.reserve_resources(&ScopeStat::task(TaskPriority::Low, 10))
            .unwrap();
        let before = scope.remaining_resource();
        let err = span
            .reserve_resources(&ScopeStat::task(TaskPriority::Low, 10))
            .unwrap_err();
        assert_eq!(err, Error::ResourceLimitExceeded);
        assert_eq!(scope.remaining_resource(), before);
    }

    #[test]
    fn test_span_released_on_drop() {
        let mgr = ResourceManager::new(small_limit());
        let scope = mgr.open_service("executor");
        {
            let mut span = scope.begin_span();
            span.reserve_resources(&ScopeStat::task(TaskPriority::Medium, 30))
                .unwrap();
        }
        assert_eq!(scope.remaining_resource(), small_limit());
    }

    #[test]
    fn test_live_reservations_never_exceed_limit() {
        let mgr = ResourceManager::new(small_limit());
        let scope = mgr.open_service("executor");
        let mut spans = Vec::new();
        let mut reserved_total = 0;
        for _ in 0..10 {
            let mut span = scope.begin_span();
            if span
                .reserve_resources(&ScopeStat::task(TaskPriority::High, 30))
                .is_ok()
            {
                reserved_total += 30;
                spans.push(span);
            }
            assert!(reserved_total <= small_limit().memory);
        }
        // two high slots despite memory for three
        assert_eq!(spans.len(), 2);
    }
}
