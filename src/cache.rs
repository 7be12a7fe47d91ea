//! Process-wide cache of the live (index, identifier-list) pair.
//!
//! State machine: `Unloaded -> Loading -> Ready`, back to `Unloaded` on
//! `reset()`. The load happens at most once per cycle: concurrent callers
//! that observe `Loading` block on a condvar until the in-flight load
//! publishes, then all receive the same `Arc`. Once published the pair is
//! immutable; rebuilds replace it wholesale via `adopt`, never patch it in
//! place.

use std::sync::{Arc, Condvar, Mutex};

use crate::index::VectorIndex;

/// The immutable pair served to query paths.
///
/// `identifiers[i]` names the `i`-th vector in `index` and `labels[i]` is
/// its display label; the cache refuses (or loudly reports, depending on
/// strictness) any pair where the identifier alignment is broken. Labels are
/// captured at build time so query paths never touch the store.
pub struct IndexedSet {
    pub index: VectorIndex,
    pub identifiers: Vec<String>,
    pub labels: Vec<Option<String>>,
}

/// Supplies a freshly loaded pair on cold start or after a reset.
pub trait IndexSource: Send + Sync {
    fn load(&self) -> Result<IndexedSet, CacheError>;
}

/// Errors surfaced by cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Index load failed: {0}")]
    LoadFailed(String),

    #[error("Corrupt index pair: index holds {vectors} vectors but identifier list has {names} entries")]
    Misaligned { vectors: usize, names: usize },
}

enum CacheState {
    Unloaded,
    Loading,
    Ready(Arc<IndexedSet>),
}

/// Holder of the one live pair per engine instance.
///
/// Injected into the matcher rather than hidden behind a module-level
/// global, so tests can run independent caches side by side.
pub struct IndexCache {
    state: Mutex<CacheState>,
    ready: Condvar,
    source: Arc<dyn IndexSource>,
    /// Strict mode fails a misaligned load; lenient mode logs at error
    /// severity and serves the pair anyway.
    strict: bool,
}

impl IndexCache {
    pub fn new(source: Arc<dyn IndexSource>, strict: bool) -> Self {
        Self {
            state: Mutex::new(CacheState::Unloaded),
            ready: Condvar::new(),
            source,
            strict,
        }
    }

    /// Get the current pair, loading it first if necessary.
    ///
    /// Exactly one caller performs the load; the rest block until it
    /// completes. A failed load returns the cache to `Unloaded` so the next
    /// caller retries.
    pub fn get(&self) -> Result<Arc<IndexedSet>, CacheError> {
        let mut guard = self.state.lock().expect("cache state lock");

        loop {
            match &*guard {
                CacheState::Ready(set) => return Ok(set.clone()),
                CacheState::Loading => {
                    guard = self.ready.wait(guard).expect("cache state lock");
                }
                CacheState::Unloaded => {
                    *guard = CacheState::Loading;
                    drop(guard);

                    // A panicking source must not strand the waiters: the
                    // guard puts the state back to Unloaded on unwind.
                    let mut reset = LoadReset { cache: self, armed: true };
                    let loaded = self.source.load().and_then(|set| self.check(set));
                    reset.armed = false;
                    drop(reset);

                    guard = self.state.lock().expect("cache state lock");
                    match loaded {
                        Ok(set) => {
                            let set = Arc::new(set);
                            *guard = CacheState::Ready(set.clone());
                            self.ready.notify_all();
                            return Ok(set);
                        }
                        Err(e) => {
                            *guard = CacheState::Unloaded;
                            self.ready.notify_all();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Discard the current pair; the next `get()` loads from scratch.
    ///
    /// Used after the store changed out from under the cache, e.g. bulk
    /// enrollment without an explicit rebuild-adopt.
    pub fn reset(&self) {
        let mut guard = self.state.lock().expect("cache state lock");
        *guard = CacheState::Unloaded;
        self.ready.notify_all();
    }

    /// Atomically publish a freshly built pair, replacing whatever was live.
    ///
    /// Readers that obtained the old `Arc` keep a consistent (old) pair;
    /// every `get()` that starts after `adopt` returns sees the new one.
    pub fn adopt(&self, set: IndexedSet) -> Result<Arc<IndexedSet>, CacheError> {
        let set = Arc::new(self.check(set)?);
        let mut guard = self.state.lock().expect("cache state lock");
        *guard = CacheState::Ready(set.clone());
        self.ready.notify_all();
        Ok(set)
    }

    /// True once a pair is published.
    pub fn is_ready(&self) -> bool {
        matches!(
            &*self.state.lock().expect("cache state lock"),
            CacheState::Ready(_)
        )
    }

    /// Alignment check applied to every pair before it is served.
    fn check(&self, set: IndexedSet) -> Result<IndexedSet, CacheError> {
        let vectors = set.index.vector_count();
        let names = set.identifiers.len();
        if vectors == names {
            return Ok(set);
        }

        // Divergence means search results would be attributed to the wrong
        // identifier, so this is always logged as a correctness bug.
        log::error!(
            "index/identifier misalignment: {vectors} vectors vs {names} identifiers"
        );
        if self.strict {
            Err(CacheError::Misaligned { vectors, names })
        } else {
            Ok(set)
        }
    }
}

/// Restores `Unloaded` and wakes waiters if the in-flight load unwinds.
struct LoadReset<'a> {
    cache: &'a IndexCache,
    armed: bool,
}

impl Drop for LoadReset<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Must not panic inside a drop during unwind; a poisoned lock is
        // left alone.
        if let Ok(mut guard) = self.cache.state.lock() {
            *guard = CacheState::Unloaded;
            self.cache.ready.notify_all();
        }
    }
}
