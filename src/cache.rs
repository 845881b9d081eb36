//! The top-level cache: name, object size, callbacks, slab lists, in-use
//! hash, per-CPU magazines, and statistics, guarded by a single lock that
//! never spans a sleeping allocation.

use crate::callbacks::{Ctor, Dtor, PrivData, Reclaim};
use crate::error::{CacheError, Result};
use crate::hash::ObjectHash;
use crate::header::{CellState, ObjectRef, SlabId};
use crate::magazine::{magazine_capacity, Magazine};
use crate::platform::{AllocFlags, Platform, PAGE_SIZE};
use crate::slab::Slab;
use crate::stats::{CacheStats, Stats};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct Inner {
    pub slabs: HashMap<SlabId, Slab>,
    pub partial: VecDeque<SlabId>,
    pub complete: VecDeque<SlabId>,
    pub hash: ObjectHash,
    pub next_slab_id: SlabId,
}

/// Removes `id` from `list` wherever it currently sits. `list` is a small
/// per-cache collection (one entry per live slab), so the linear scan here
/// stands in for an intrusive O(1) unlink: cheap enough at this scale, and
/// simpler than threading prev/next pointers through `Slab`.
pub(crate) fn remove_from_list(list: &mut VecDeque<SlabId>, id: SlabId) {
    if let Some(pos) = list.iter().position(|&x| x == id) {
        list.remove(pos);
    }
}

pub struct Cache<P: Platform> {
    name: String,
    object_size: usize,
    align: usize,
    reap_delay_ticks: u64,
    platform: Arc<P>,
    ctor: Option<Ctor>,
    dtor: Option<Dtor>,
    reclaim: Option<Reclaim>,
    priv_data: Box<PrivData>,
    inner: Mutex<Inner>,
    magazines: Vec<Mutex<Magazine>>,
    stats: Stats,
}

impl<P: Platform> Cache<P> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        name: impl Into<String>,
        object_size: usize,
        align: usize,
        ctor: Option<Ctor>,
        dtor: Option<Dtor>,
        reclaim: Option<Reclaim>,
        priv_data: Box<PrivData>,
        reap_delay: Duration,
        platform: Arc<P>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        if object_size == 0 {
            return Err(CacheError::InvalidSize {
                cache: name,
                size: object_size,
            });
        }
        if !platform.is_sleep_safe() {
            return Err(CacheError::ContextViolation);
        }

        let mag_cap = magazine_capacity(object_size, PAGE_SIZE);
        let num_cpus = platform.num_cpus();
        let magazines = (0..num_cpus).map(|_| Mutex::new(Magazine::new(mag_cap))).collect();
        let reap_delay_ticks =
            (reap_delay.as_secs_f64() * platform.ticks_per_second() as f64) as u64;

        let cache = Cache {
            name,
            object_size,
            align: align.max(1),
            reap_delay_ticks,
            platform,
            ctor,
            dtor,
            reclaim,
            priv_data,
            inner: Mutex::new(Inner {
                slabs: HashMap::new(),
                partial: VecDeque::new(),
                complete: VecDeque::new(),
                hash: ObjectHash::new(),
                next_slab_id: 0,
            }),
            magazines,
            stats: Stats::new(),
        };
        tracing::debug!(cache = %cache.name, object_size, "cache created");
        Ok(Arc::new(cache))
    }

    /// Caller must ensure there are no concurrent `alloc`/`free` calls on
    /// this cache. Panics (invariant violation) if objects are still
    /// outstanding.
    pub fn destroy(&self) {
        for cpu in 0..self.magazines.len() {
            let avail = self.magazines[cpu].lock().avail;
            if avail > 0 {
                self.flush(cpu, avail);
            }
        }

        let mut inner = self.inner.lock();
        crate::invariant!(
            inner.complete.is_empty(),
            "cache '{}' destroyed with full slabs outstanding",
            self.name
        );
        crate::invariant!(
            inner.hash.count == 0,
            "cache '{}' destroyed with {} objects still allocated",
            self.name,
            inner.hash.count
        );

        let stale: Vec<SlabId> = inner.partial.drain(..).collect();
        drop(inner);
        for id in stale {
            let slab = {
                let mut inner = self.inner.lock();
                inner.slabs.remove(&id).expect("partial list referenced missing slab")
            };
            let n_cells = slab.n_cells();
            slab.teardown(&*self.platform, self.dtor.as_ref(), &*self.priv_data);
            self.record_slab_freed(n_cells);
        }
        tracing::debug!(cache = %self.name, "cache destroyed");
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            slabs_created: self.stats.slabs_created.load(Ordering::Relaxed),
            slabs_destroyed: self.stats.slabs_destroyed.load(Ordering::Relaxed),
            slab_total: self.stats.slab_total.load(Ordering::Relaxed),
            slab_alloc: self.stats.slab_alloc.load(Ordering::Relaxed),
            slab_max: self.stats.slab_max.load(Ordering::Relaxed),
            obj_alloc: self.stats.obj_alloc.load(Ordering::Relaxed),
            obj_total: self.stats.obj_total.load(Ordering::Relaxed),
            obj_max: self.stats.obj_max.load(Ordering::Relaxed),
            hash_count: inner.hash.count,
            hash_depth: inner.hash.depth_high_water,
        }
    }

    pub fn alloc(&self, flags: AllocFlags) -> Result<NonNull<u8>> {
        if flags != AllocFlags::Sleep {
            return Err(CacheError::ContextViolation);
        }
        loop {
            let cpu = self.platform.cpu_id();
            let popped = self.platform.no_preempt(|| {
                let mut mag = self.magazines[cpu].lock();
                if mag.avail > 0 {
                    Some(mag.pop(self.platform.now_ticks()))
                } else {
                    None
                }
            });
            if let Some(ptr) = popped {
                return Ok(ptr);
            }
            self.refill(cpu, flags)?;
        }
    }

    pub fn free(&self, body: NonNull<u8>) {
        let cpu = self.platform.cpu_id();
        let now = self.platform.now_ticks();
        // One locked, uninterrupted critical section: check-full, drain,
        // and push must not be observable as separate steps, or two
        // threads sharing a CPU slot could both see room and overflow
        // `objs` past `size`.
        let drained = self.platform.no_preempt(|| {
            let mut mag = self.magazines[cpu].lock();
            let drained = if mag.is_full() {
                let refill = mag.refill;
                mag.drain_oldest(refill)
            } else {
                Vec::new()
            };
            mag.push(body, now);
            drained
        });
        self.return_to_slabs(drained);
    }

    fn grow(&self, flags: AllocFlags) -> Result<SlabId> {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_slab_id;
            inner.next_slab_id += 1;
            id
        };
        let now = self.platform.now_ticks();
        let slab = Slab::grow(
            &*self.platform,
            id,
            &self.name,
            self.object_size,
            self.align,
            PAGE_SIZE,
            self.ctor.as_ref(),
            &*self.priv_data,
            now,
            flags,
        )?;

        let mut inner = self.inner.lock();
        inner.slabs.insert(id, slab);
        inner.partial.push_back(id);
        self.stats.slab_total.fetch_add(1, Ordering::Relaxed);
        self.stats
            .obj_total
            .fetch_add(crate::slab::N_CELLS as u64, Ordering::Relaxed);
        self.stats.slabs_created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(cache = %self.name, slab_id = id, "slab grown");
        Ok(id)
    }

    fn refill(&self, cpu_hint: usize, flags: AllocFlags) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut budget = {
            let mag = self.magazines[cpu_hint].lock();
            mag.refill.min(mag.size - mag.avail)
        };

        while budget > 0 {
            if inner.partial.is_empty() {
                drop(inner);
                self.grow(flags)?;
                if self.platform.cpu_id() != cpu_hint {
                    // Rescheduled elsewhere: let the alloc-path restart
                    // pick the right magazine back up.
                    return Ok(());
                }
                inner = self.inner.lock();
                let mag = self.magazines[cpu_hint].lock();
                budget = budget.min(mag.size - mag.avail);
                continue;
            }

            let slab_id = *inner.partial.front().expect("checked non-empty above");
            let now = self.platform.now_ticks();
            {
                let Inner { slabs, hash, .. } = &mut *inner;
                let slab = slabs.get_mut(&slab_id).expect("partial list referenced missing slab");
                while slab.ref_count < slab.n_cells() && budget > 0 {
                    if slab.ref_count == 0 {
                        self.stats.slab_alloc.fetch_add(1, Ordering::Relaxed);
                        self.stats.bump_slab_max();
                    }
                    let cell = slab.free_list.pop().expect("partial slab has no free cells");
                    slab.headers[cell].state = CellState::InUse;
                    slab.ref_count += 1;
                    slab.last_touch = now;
                    let body = slab.headers[cell].body;

                    hash.insert(body.as_ptr() as usize, ObjectRef { slab_id, cell });
                    self.magazines[cpu_hint].lock().push(body, now);
                    self.stats.obj_alloc.fetch_add(1, Ordering::Relaxed);
                    budget -= 1;
                }
            }
            self.stats.bump_obj_max();

            let slab = inner.slabs.get(&slab_id).expect("just inserted above");
            if slab.is_full() {
                remove_from_list(&mut inner.partial, slab_id);
                inner.complete.push_back(slab_id);
            }
        }
        Ok(())
    }

    /// Drain up to `count` entries from the bottom of CPU `cpu`'s magazine
    /// and return them to their owning slabs.
    pub(crate) fn flush(&self, cpu: usize, count: usize) {
        let drained = self.magazines[cpu].lock().drain_oldest(count);
        self.return_to_slabs(drained);
    }

    fn return_to_slabs(&self, drained: Vec<NonNull<u8>>) {
        if drained.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for body in drained {
            self.shrink_locked(&mut inner, body);
        }
    }

    fn shrink_locked(&self, inner: &mut Inner, body: NonNull<u8>) {
        let addr = body.as_ptr() as usize;
        let obj_ref = inner.hash.lookup(addr);
        inner.hash.remove(addr);
        let now = self.platform.now_ticks();

        let slab = inner
            .slabs
            .get_mut(&obj_ref.slab_id)
            .expect("in-use hash referenced a missing slab");
        slab.headers[obj_ref.cell].state = CellState::Free;
        slab.free_list.push(obj_ref.cell);
        slab.last_touch = now;
        slab.ref_count -= 1;
        self.stats.obj_alloc.fetch_sub(1, Ordering::Relaxed);

        let ref_count = slab.ref_count;
        let n_cells = slab.n_cells();

        if ref_count == n_cells - 1 {
            remove_from_list(&mut inner.complete, obj_ref.slab_id);
            inner.partial.push_front(obj_ref.slab_id);
        }
        if ref_count == 0 {
            self.stats.slab_alloc.fetch_sub(1, Ordering::Relaxed);
            remove_from_list(&mut inner.partial, obj_ref.slab_id);
            inner.partial.push_back(obj_ref.slab_id);
        }
    }

    pub(crate) fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub(crate) fn reclaim(&self) -> Option<&Reclaim> {
        self.reclaim.as_ref()
    }

    pub(crate) fn priv_data(&self) -> &PrivData {
        &*self.priv_data
    }

    pub(crate) fn dtor(&self) -> Option<&Dtor> {
        self.dtor.as_ref()
    }

    pub(crate) fn reap_delay_ticks(&self) -> u64 {
        self.reap_delay_ticks
    }

    pub(crate) fn num_cpus(&self) -> usize {
        self.magazines.len()
    }

    pub(crate) fn magazine_state(&self, cpu: usize) -> (u64, usize) {
        let mag = self.magazines[cpu].lock();
        (mag.last_touch, mag.refill)
    }

    pub(crate) fn inner_lock(&self) -> parking_lot::MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    pub(crate) fn record_slab_freed(&self, n_cells: usize) {
        self.stats.obj_total.fetch_sub(n_cells as u64, Ordering::Relaxed);
        self.stats.slab_total.fetch_sub(1, Ordering::Relaxed);
        self.stats.slabs_destroyed.fetch_add(1, Ordering::Relaxed);
    }
}
