//! The in-use object hash: maps a live object-body address back to the
//! `(slab, cell)` that owns it, so `free` can work from a bare pointer.
//!
//! Mirrors `spl_hash_ptr`/`spl_hash_obj` in the original SPL kmem cache:
//! the body address is first shifted right by the page-size exponent
//! (bodies are usually at least page-aligned, so the low bits carry no
//! entropy) before being folded down to `hash_bits`.

use crate::header::ObjectRef;
use crate::platform::PAGE_SHIFT;

/// Fixed hash table size; the table is never resized at runtime.
const HASH_BITS: u32 = 10;
const HASH_SIZE: usize = 1 << HASH_BITS;

fn hash_ptr(addr: usize, bits: u32) -> usize {
    let folded = addr >> PAGE_SHIFT;
    // A cheap multiplicative integer hash (Fibonacci hashing), standing in
    // for the kernel's `hash_long`.
    let mixed = folded.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed >> (usize::BITS - bits)) as usize
}

pub(crate) struct ObjectHash {
    chains: Vec<Vec<(usize, ObjectRef)>>,
    pub count: usize,
    pub depth_high_water: usize,
}

impl ObjectHash {
    pub fn new() -> Self {
        ObjectHash {
            chains: (0..HASH_SIZE).map(|_| Vec::new()).collect(),
            count: 0,
            depth_high_water: 0,
        }
    }

    pub fn insert(&mut self, addr: usize, obj: ObjectRef) {
        let key = hash_ptr(addr, HASH_BITS);
        self.chains[key].push((addr, obj));
        self.count += 1;
    }

    /// Fatal if not found: the pointer must have come from this cache.
    pub fn lookup(&mut self, addr: usize) -> ObjectRef {
        let key = hash_ptr(addr, HASH_BITS);
        let chain = &self.chains[key];
        if chain.len() > self.depth_high_water {
            self.depth_high_water = chain.len();
        }
        let found = chain.iter().find(|(a, _)| *a == addr).map(|(_, obj)| *obj);
        crate::invariant!(
            found.is_some(),
            "in-use hash miss for address {:#x} (hash_count={}, depth={})",
            addr,
            self.count,
            self.depth_high_water
        );
        found.unwrap()
    }

    pub fn remove(&mut self, addr: usize) {
        let key = hash_ptr(addr, HASH_BITS);
        let chain = &mut self.chains[key];
        let pos = chain
            .iter()
            .position(|(a, _)| *a == addr)
            .expect("removing address not present in in-use hash");
        chain.swap_remove(pos);
        self.count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_remove_roundtrip() {
        let mut hash = ObjectHash::new();
        let addr = 0x1000usize;
        hash.insert(addr, ObjectRef { slab_id: 1, cell: 3 });
        assert_eq!(hash.count, 1);
        let found = hash.lookup(addr);
        assert_eq!(found, ObjectRef { slab_id: 1, cell: 3 });
        hash.remove(addr);
        assert_eq!(hash.count, 0);
    }

    #[test]
    #[should_panic(expected = "in-use hash miss")]
    fn lookup_miss_is_fatal() {
        let mut hash = ObjectHash::new();
        hash.lookup(0xdead_beef);
    }

    #[test]
    fn page_aligned_addresses_spread_across_chains() {
        let mut hash = ObjectHash::new();
        for i in 0..64usize {
            hash.insert(i * PAGE_SIZE_FOR_TEST, ObjectRef { slab_id: 0, cell: i });
        }
        assert_eq!(hash.count, 64);
        // not all entries collided into a single chain
        assert!(hash.depth_high_water < 64);
    }

    const PAGE_SIZE_FOR_TEST: usize = 4096;
}
