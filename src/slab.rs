//! A slab: a backing region carved into `N_CELLS` equal-sized object cells,
//! plus their headers. Owned by exactly one cache, linked into exactly one
//! of that cache's two lists.

use crate::callbacks::{Ctor, PrivData};
use crate::error::{CacheError, Result};
use crate::header::{CellState, ObjectHeader, SlabId};
use crate::platform::{AllocFlags, Platform};
use std::mem::size_of;
use std::ptr::NonNull;

pub(crate) const SKS_MAGIC: u32 = 0x2ACE_2ACE;

/// Objects per slab. A fixed build-time constant, not computed from
/// object size — slab coloring and size-dependent packing are not
/// implemented.
pub(crate) const N_CELLS: usize = 32;

pub(crate) enum Backing {
    /// Each body is its own `kmem_alloc`; freed individually on teardown.
    Small { object_size: usize, align: usize },
    /// One `vmem_alloc` region backs the whole slab; bodies are offsets
    /// into it.
    Large {
        region: NonNull<u8>,
        region_size: usize,
        align: usize,
    },
}

pub(crate) struct Slab {
    pub magic: u32,
    pub id: SlabId,
    pub headers: Vec<ObjectHeader>,
    /// Stack of free cell indices.
    pub free_list: Vec<usize>,
    pub ref_count: usize,
    pub last_touch: u64,
    backing: Backing,
}

// SAFETY: a slab's region/bodies are only touched by the cache that owns
// it, under that cache's lock or during construction/teardown before the
// slab is published to other threads.
unsafe impl Send for Slab {}

impl Slab {
    pub fn n_cells(&self) -> usize {
        self.headers.len()
    }

    pub fn is_full(&self) -> bool {
        self.ref_count == self.n_cells()
    }

    pub fn is_empty(&self) -> bool {
        self.ref_count == 0
    }

    /// Allocate, initialize, and construct a new slab. Must be called
    /// without the cache lock held: the constructor may sleep and is run
    /// on every cell before the slab is published.
    #[allow(clippy::too_many_arguments)]
    pub fn grow<P: Platform>(
        platform: &P,
        id: SlabId,
        cache_name: &str,
        object_size: usize,
        align: usize,
        page_size: usize,
        ctor: Option<&Ctor>,
        priv_data: &PrivData,
        now: u64,
        flags: AllocFlags,
    ) -> Result<Slab> {
        if object_size <= page_size {
            Self::grow_small(platform, id, cache_name, object_size, align, ctor, priv_data, now, flags)
        } else {
            Self::grow_large(platform, id, cache_name, object_size, align, ctor, priv_data, now, flags)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn grow_small<P: Platform>(
        platform: &P,
        id: SlabId,
        cache_name: &str,
        object_size: usize,
        align: usize,
        ctor: Option<&Ctor>,
        priv_data: &PrivData,
        now: u64,
        flags: AllocFlags,
    ) -> Result<Slab> {
        let mut headers = Vec::with_capacity(N_CELLS);
        for _ in 0..N_CELLS {
            let Some(body) = platform.kmem_alloc(object_size, align, flags) else {
                // Unwind whatever this slab already allocated.
                for h in &headers {
                    unsafe { platform.kmem_free(h_body(h), object_size, align) };
                }
                return Err(CacheError::OutOfMemory {
                    cache: cache_name.to_string(),
                });
            };
            headers.push(ObjectHeader::new(body));
        }

        for h in &headers {
            if let Some(ctor) = ctor {
                ctor(h.body, priv_data, flags);
            }
        }

        Ok(Slab {
            magic: SKS_MAGIC,
            id,
            free_list: (0..N_CELLS).collect(),
            headers,
            ref_count: 0,
            last_touch: now,
            backing: Backing::Small { object_size, align },
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn grow_large<P: Platform>(
        platform: &P,
        id: SlabId,
        cache_name: &str,
        object_size: usize,
        align: usize,
        ctor: Option<&Ctor>,
        priv_data: &PrivData,
        now: u64,
        flags: AllocFlags,
    ) -> Result<Slab> {
        let per_cell_overhead = size_of::<ObjectHeader>();
        let region_size =
            size_of::<Self>() + N_CELLS * (per_cell_overhead + object_size);
        let region_align = align.max(std::mem::align_of::<Self>());

        let Some(region) = platform.vmem_alloc(region_size, region_align, flags) else {
            return Err(CacheError::OutOfMemory {
                cache: cache_name.to_string(),
            });
        };

        let bodies_start = size_of::<Self>() + N_CELLS * per_cell_overhead;
        let mut headers = Vec::with_capacity(N_CELLS);
        for i in 0..N_CELLS {
            let offset = bodies_start + i * object_size;
            let body = unsafe { NonNull::new_unchecked(region.as_ptr().add(offset)) };
            headers.push(ObjectHeader::new(body));
        }

        for h in &headers {
            if let Some(ctor) = ctor {
                ctor(h.body, priv_data, flags);
            }
        }

        Ok(Slab {
            magic: SKS_MAGIC,
            id,
            free_list: (0..N_CELLS).collect(),
            headers,
            ref_count: 0,
            last_touch: now,
            backing: Backing::Large {
                region,
                region_size,
                align: region_align,
            },
        })
    }

    /// Run the destructor on every (free) cell and release the backing
    /// memory. The caller must ensure `ref_count == 0` first and must hold
    /// the cache lock across this call.
    pub fn teardown<P: Platform>(
        self,
        platform: &P,
        dtor: Option<&crate::callbacks::Dtor>,
        priv_data: &PrivData,
    ) {
        debug_assert_eq!(self.ref_count, 0, "tearing down a slab with live objects");
        for h in &self.headers {
            debug_assert_eq!(h.state, CellState::Free);
            if let Some(dtor) = dtor {
                dtor(h.body, priv_data);
            }
        }

        match self.backing {
            Backing::Small { object_size, align } => {
                for h in &self.headers {
                    unsafe { platform.kmem_free(h.body, object_size, align) };
                }
            }
            Backing::Large {
                region,
                region_size,
                align,
            } => unsafe { platform.vmem_free(region, region_size, align) },
        }
    }
}

fn h_body(h: &ObjectHeader) -> NonNull<u8> {
    h.body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::StdPlatform;

    #[test]
    fn small_slab_grows_and_tears_down() {
        let platform = StdPlatform::new();
        let priv_data: Box<PrivData> = Box::new(());
        let slab = Slab::grow(
            &platform,
            1,
            "test",
            64,
            8,
            4096,
            None,
            &*priv_data,
            0,
            AllocFlags::Sleep,
        )
        .unwrap();
        assert_eq!(slab.n_cells(), N_CELLS);
        assert_eq!(slab.free_list.len(), N_CELLS);
        slab.teardown(&platform, None, &*priv_data);
    }

    #[test]
    fn large_slab_uses_single_region() {
        let platform = StdPlatform::new();
        let priv_data: Box<PrivData> = Box::new(());
        let object_size = 3 * 4096;
        let slab = Slab::grow(
            &platform,
            1,
            "test",
            object_size,
            8,
            4096,
            None,
            &*priv_data,
            0,
            AllocFlags::Sleep,
        )
        .unwrap();
        match &slab.backing {
            Backing::Large { region_size, .. } => {
                assert_eq!(
                    *region_size,
                    size_of::<Slab>() + N_CELLS * (size_of::<ObjectHeader>() + object_size)
                );
            }
            Backing::Small { .. } => panic!("expected large backing"),
        }
        slab.teardown(&platform, None, &*priv_data);
    }

    #[test]
    fn ctor_runs_once_per_cell() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let platform = StdPlatform::new();
        let counter = AtomicUsize::new(0);
        let ctor: Ctor = Box::new(move |_body, priv_data, _flags| {
            let counter = priv_data.downcast_ref::<AtomicUsize>().unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let slab = Slab::grow(
            &platform,
            1,
            "test",
            64,
            8,
            4096,
            Some(&ctor),
            &counter,
            0,
            AllocFlags::Sleep,
        )
        .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), N_CELLS);
        slab.teardown(&platform, None, &counter);
    }
}
