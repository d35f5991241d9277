//! Process-wide memoization of assembled modules.
//!
//! Rebuilding and re-rendering the same module for every launch
//! configuration is wasted work when the configuration has not changed.
//! The cache stores the durable part of a build result (source text and
//! ordering metadata, not the fragment instances) under a key derived from
//! the serialized build parameters, with explicit invalidation.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::AsmError;
use crate::module::PtxModule;

/// The cacheable part of a [`PtxModule`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedModule {
    pub source: String,
    /// Fragment kinds in global dependency order.
    pub fragment_order: Vec<String>,
    /// Entry names in emission order, self-tests included.
    pub entry_names: Vec<String>,
    /// Names of the self-test entries.
    pub tests: Vec<String>,
    /// Lifecycle passes the build took to stabilize.
    pub compiles: usize,
}

impl CachedModule {
    pub fn from_module(module: &PtxModule) -> Self {
        Self {
            source: module.source.clone(),
            fragment_order: module
                .fragment_kinds()
                .iter()
                .map(ToString::to_string)
                .collect(),
            entry_names: module.entry_names(),
            tests: module.tests.clone(),
            compiles: module.compiles,
        }
    }
}

/// Memoized build results keyed by configuration.
#[derive(Default)]
pub struct ModuleCache {
    inner: Mutex<HashMap<String, CachedModule>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared process-wide cache.
    pub fn global() -> &'static ModuleCache {
        static CACHE: OnceLock<ModuleCache> = OnceLock::new();
        CACHE.get_or_init(ModuleCache::new)
    }

    /// Derive a cache key from any serializable configuration.
    pub fn key_for<T: Serialize>(params: &T) -> Result<String, AsmError> {
        Ok(serde_json::to_string(params)?)
    }

    pub fn get(&self, key: &str) -> Option<CachedModule> {
        self.lock().get(key).cloned()
    }

    /// Return the cached record for `key`, running `build` to fill it on a
    /// miss. A failed build caches nothing.
    pub fn get_or_build(
        &self,
        key: &str,
        build: impl FnOnce() -> Result<PtxModule, AsmError>,
    ) -> Result<CachedModule, AsmError> {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let module = build()?;
        let record = CachedModule::from_module(&module);
        self.lock().insert(key.to_string(), record.clone());
        Ok(record)
    }

    /// Drop one entry. Returns whether anything was cached under `key`.
    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedModule>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::BuildOptions;

    fn fake_module(source: &str) -> Result<PtxModule, AsmError> {
        Ok(PtxModule {
            source: source.to_string(),
            fragments: Vec::new(),
            entries: Vec::new(),
            tests: Vec::new(),
            compiles: 1,
        })
    }

    #[test]
    fn test_key_is_stable_for_equal_options() {
        let a = ModuleCache::key_for(&BuildOptions::default()).unwrap();
        let b = ModuleCache::key_for(&BuildOptions::default()).unwrap();
        assert_eq!(a, b);
        let other = ModuleCache::key_for(&BuildOptions {
            target: "sm_30".to_string(),
            ..BuildOptions::default()
        })
        .unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_hit_skips_rebuild() {
        let cache = ModuleCache::new();
        let first = cache.get_or_build("k", || fake_module("one")).unwrap();
        let second = cache
            .get_or_build("k", || panic!("cache hit must not rebuild"))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.source, "one");
    }

    #[test]
    fn test_invalidate_forces_rebuild() {
        let cache = ModuleCache::new();
        cache.get_or_build("k", || fake_module("one")).unwrap();
        assert!(cache.invalidate("k"));
        assert!(!cache.invalidate("k"));
        let rebuilt = cache.get_or_build("k", || fake_module("two")).unwrap();
        assert_eq!(rebuilt.source, "two");
    }

    #[test]
    fn test_failed_build_caches_nothing() {
        let cache = ModuleCache::new();
        let err = cache.get_or_build("k", || Err(AsmError::EmptyOp));
        assert!(err.is_err());
        assert!(cache.get("k").is_none());
    }
}
