//! Process-wide registry of live caches: backs the global shrinker and the
//! two bootstrap caches the engine itself depends on. Mirrors
//! `spl_kmem_cache_list`/`spl_kmem_cache_sem` and the `spl_slab_cache`/
//! `spl_obj_cache` bootstrap pair from the original SPL kmem cache.

use crate::cache::Cache;
use crate::error::Result;
use crate::platform::{AllocFlags, Platform, StdPlatform};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_REAP_DELAY: Duration = Duration::from_secs(15);

static GLOBAL_REGISTRY: OnceCell<Arc<Registry<StdPlatform>>> = OnceCell::new();

/// The process-wide registry backing [`GlobalShrinker`] and any cache
/// created without an explicit [`Registry`] of its own, mirroring the
/// original's single process-wide `spl_kmem_cache_list`. Initialized
/// lazily on first use with a default-CPU-count [`StdPlatform`].
pub fn global_registry() -> &'static Arc<Registry<StdPlatform>> {
    GLOBAL_REGISTRY.get_or_init(|| Registry::new(Arc::new(StdPlatform::new())))
}

pub struct Registry<P: Platform> {
    caches: RwLock<Vec<Arc<Cache<P>>>>,
    platform: Arc<P>,
}

impl<P: Platform> Registry<P> {
    pub fn new(platform: Arc<P>) -> Arc<Self> {
        Arc::new(Registry {
            caches: RwLock::new(Vec::new()),
            platform,
        })
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub fn create_cache(
        &self,
        name: impl Into<String>,
        object_size: usize,
        align: usize,
    ) -> Result<Arc<Cache<P>>> {
        let cache = Cache::create(
            name,
            object_size,
            align,
            None,
            None,
            None,
            Box::new(()),
            DEFAULT_REAP_DELAY,
            self.platform.clone(),
        )?;
        self.register(cache.clone());
        Ok(cache)
    }

    pub fn register(&self, cache: Arc<Cache<P>>) {
        self.caches.write().push(cache);
    }

    pub fn unregister(&self, cache: &Arc<Cache<P>>) {
        let mut caches = self.caches.write();
        if let Some(pos) = caches.iter().position(|c| Arc::ptr_eq(c, cache)) {
            caches.remove(pos);
        }
        cache.destroy();
    }

    /// Reap every registered cache and return how many passes actually ran.
    /// Unlike [`GlobalShrinker::invoke`], this reports the real count
    /// rather than carrying forward the legacy shrinker's constant `1`.
    pub fn reap(&self) -> usize {
        let caches = self.caches.read();
        for cache in caches.iter() {
            cache.reap_now();
        }
        caches.len()
    }

    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Two small internal caches the engine would use for its own
    /// bookkeeping allocations in a from-scratch port (`spl_slab_cache` for
    /// slab descriptors, `spl_obj_cache` for object descriptors). Kept here
    /// as a demonstrative, opt-in bootstrap rather than wired into every
    /// `Cache::grow` call, since this crate's `Slab`/`ObjectHeader` are
    /// ordinary Rust values rather than heap nodes the allocator must
    /// allocate through itself.
    pub fn bootstrap_caches(&self) -> Result<(Arc<Cache<P>>, Arc<Cache<P>>)> {
        let slab_cache = self.create_cache("spl_slab_cache", 56, 8)?;
        let obj_cache = self.create_cache("spl_obj_cache", 24, 8)?;
        Ok((slab_cache, obj_cache))
    }
}

/// Legacy shrinker entry point: reaps every registered cache and returns the
/// constant `1`, matching the upstream generic shrinker's `TODO` of not
/// reporting the real freeable-entry count. New call sites should prefer
/// [`Registry::reap`].
pub struct GlobalShrinker<P: Platform> {
    registry: Arc<Registry<P>>,
}

impl<P: Platform> GlobalShrinker<P> {
    pub fn new(registry: Arc<Registry<P>>) -> Self {
        GlobalShrinker { registry }
    }

    pub fn invoke(&self, _scan_target: usize, _flags: AllocFlags) -> i32 {
        self.registry.reap();
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::StdPlatform;

    #[test]
    fn register_and_reap_all() {
        let platform = Arc::new(StdPlatform::with_cpus(2));
        let registry = Registry::new(platform);
        let _a = registry.create_cache("a", 32, 8).unwrap();
        let _b = registry.create_cache("b", 64, 8).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.reap(), 2);
    }

    #[test]
    fn shrinker_returns_legacy_constant() {
        let platform = Arc::new(StdPlatform::with_cpus(2));
        let registry = Registry::new(platform);
        let _c = registry.create_cache("c", 32, 8).unwrap();
        let shrinker = GlobalShrinker::new(registry.clone());
        assert_eq!(shrinker.invoke(usize::MAX, AllocFlags::Sleep), 1);
    }

    #[test]
    fn bootstrap_caches_are_distinct() {
        let platform = Arc::new(StdPlatform::with_cpus(1));
        let registry = Registry::new(platform);
        let (slabs, objs) = registry.bootstrap_caches().unwrap();
        assert_ne!(slabs.object_size(), objs.object_size());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unregister_destroys_and_removes() {
        let platform = Arc::new(StdPlatform::with_cpus(1));
        let registry = Registry::new(platform);
        let cache = registry.create_cache("temp", 32, 8).unwrap();
        registry.unregister(&cache);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn global_registry_is_a_singleton() {
        let a = global_registry();
        let b = global_registry();
        assert!(Arc::ptr_eq(a, b));
    }
}
