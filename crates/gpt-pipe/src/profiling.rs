//! Scope-based layer profiler.
//!
//! Compiled out unless the `profiler` feature is enabled; the guards then
//! cost one atomic map update per scope. Stage forwards open a scope with
//! [`layer_scope`] and the aggregate is available through [`report`].

#[cfg(feature = "profiler")]
use std::collections::HashMap;
#[cfg(feature = "profiler")]
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
#[cfg(feature = "profiler")]
use std::time::Instant;

/// Accumulated timings for one named scope.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopeStat {
    pub calls: u64,
    pub total: Duration,
}

#[cfg(feature = "profiler")]
static STATS: OnceLock<Mutex<HashMap<&'static str, ScopeStat>>> = OnceLock::new();

#[cfg(feature = "profiler")]
fn stats() -> &'static Mutex<HashMap<&'static str, ScopeStat>> {
    STATS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// RAII guard that records elapsed time for its scope on drop.
pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    name: &'static str,
    #[cfg(feature = "profiler")]
    started: Instant,
}

/// Opens a timing scope for one layer forward pass.
#[inline(always)]
pub fn layer_scope(name: &'static str) -> ScopeGuard {
    #[cfg(not(feature = "profiler"))]
    let _ = name;
    ScopeGuard {
        #[cfg(feature = "profiler")]
        name,
        #[cfg(feature = "profiler")]
        started: Instant::now(),
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        #[cfg(feature = "profiler")]
        {
            let elapsed = self.started.elapsed();
            if let Ok(mut map) = stats().lock() {
                let stat = map.entry(self.name).or_default();
                stat.calls += 1;
                stat.total += elapsed;
            }
        }
    }
}

/// Snapshot of all recorded scopes, hottest first.
pub fn report() -> Vec<(&'static str, ScopeStat)> {
    #[cfg(feature = "profiler")]
    {
        let mut entries: Vec<_> = stats()
            .lock()
            .map(|map| map.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| b.1.total.cmp(&a.1.total));
        entries
    }
    #[cfg(not(feature = "profiler"))]
    Vec::new()
}

/// Clears all recorded scopes.
pub fn reset() {
    #[cfg(feature = "profiler")]
    if let Ok(mut map) = stats().lock() {
        map.clear();
    }
}
