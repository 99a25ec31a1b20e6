//! Lightweight symbolization cache (spec §4.1: "symbol lookup dominates
//! post-processing time for contiguous stacks"), grounded on the
//! cache-over-external-lookup shape of `samply-symbols/src/cache.rs`.

use crate::platform::{SymbolInfo, Symbolizer};
use rustc_hash::FxHashMap;
use std::sync::Arc;

const DEFAULT_CAPACITY: usize = 4096;

pub type SymbolizedFrame = Option<SymbolInfo>;

/// Caches `Symbolizer::symbolize` results by call-site address. Bounded:
/// once `capacity` is reached the cache is cleared and restarted rather
/// than implementing a full LRU, since symbol addresses cluster heavily
/// within a single stall/CPU-spike dump and a clear-and-refill is cheap
/// relative to the lookups it saves.
pub struct SymbolCache {
    symbolizer: Arc<dyn Symbolizer>,
    capacity: usize,
    cache: FxHashMap<u64, SymbolizedFrame>,
}

impl SymbolCache {
    pub fn new(symbolizer: Arc<dyn Symbolizer>) -> Self {
        Self::with_capacity(symbolizer, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(symbolizer: Arc<dyn Symbolizer>, capacity: usize) -> Self {
        SymbolCache {
            symbolizer,
            capacity,
            cache: FxHashMap::default(),
        }
    }

    pub fn symbolize(&mut self, call_site_address: u64) -> SymbolizedFrame {
        if let Some(cached) = self.cache.get(&call_site_address) {
            return cached.clone();
        }
        if self.cache.len() >= self.capacity {
            self.cache.clear();
        }
        let result = self.symbolizer.symbolize(call_site_address);
        self.cache.insert(call_site_address, result.clone());
        result
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSymbolizer {
        calls: AtomicUsize,
    }

    impl Symbolizer for CountingSymbolizer {
        fn symbolize(&self, address: u64) -> Option<SymbolInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(SymbolInfo {
                symbol_name: Some(format!("fn_{address:x}")),
                ..Default::default()
            })
        }
    }

    #[test]
    fn repeated_lookups_hit_cache() {
        let sym = Arc::new(CountingSymbolizer {
            calls: AtomicUsize::new(0),
        });
        let mut cache = SymbolCache::new(sym.clone());
        for _ in 0..10 {
            cache.symbolize(0x1234);
        }
        assert_eq!(sym.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_overflow_clears_cache() {
        let sym = Arc::new(CountingSymbolizer {
            calls: AtomicUsize::new(0),
        });
        let mut cache = SymbolCache::with_capacity(sym, 2);
        cache.symbolize(1);
        cache.symbolize(2);
        assert_eq!(cache.len(), 2);
        cache.symbolize(3);
        assert_eq!(cache.len(), 1);
    }
}
