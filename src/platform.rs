//! Platform primitives the cache engine treats as external collaborators:
//! byte allocation, per-CPU identity, a monotonic tick source, and a
//! preemption/interrupt-disable scope. None of this module's job is to be
//! a real kernel — [`StdPlatform`] is a userspace stand-in good enough to
//! exercise the cache engine's behavior end to end under `cargo test`.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Page size assumed by size-class and magazine-capacity decisions.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = PAGE_SIZE.trailing_zeros();

/// Whether the calling context permits the allocator to sleep.
///
/// Only [`AllocFlags::Sleep`] is implemented on the hot path. A no-sleep
/// allocation always fails fast with a context-violation error rather
/// than attempting a best-effort non-blocking refill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFlags {
    Sleep,
    NoSleep,
}

/// External collaborators the cache engine consumes but does not implement.
pub trait Platform: Send + Sync {
    /// Small allocation, used for slab/header/body pieces of "small" slabs.
    /// `flags` carries the caller's sleep/no-sleep context through to the
    /// allocator and, from there, to the constructor callback.
    fn kmem_alloc(&self, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>>;
    /// # Safety
    /// `ptr`/`size`/`align` must match a prior `kmem_alloc` call.
    unsafe fn kmem_free(&self, ptr: NonNull<u8>, size: usize, align: usize);

    /// Large/virtual allocation, used for the single backing region of a
    /// "large" slab.
    fn vmem_alloc(&self, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>>;
    /// # Safety
    /// `ptr`/`size`/`align` must match a prior `vmem_alloc` call.
    unsafe fn vmem_free(&self, ptr: NonNull<u8>, size: usize, align: usize);

    /// Logical id of the CPU executing the current thread, in `0..num_cpus()`.
    fn cpu_id(&self) -> usize;
    fn num_cpus(&self) -> usize;

    /// Monotonic tick count, compared against `reap_delay * ticks_per_second()`.
    fn now_ticks(&self) -> u64;
    fn ticks_per_second(&self) -> u64;

    /// True if the calling context may sleep (no preemption disabled, no
    /// interrupts disabled). Queried once at cache-creation time.
    fn is_sleep_safe(&self) -> bool;

    /// Scoped preemption/interrupt-disable region. `f` must not sleep.
    /// The per-CPU magazine is only dereferenced inside this scope so that
    /// the CPU cannot migrate mid-access.
    fn no_preempt<R>(&self, f: impl FnOnce() -> R) -> R {
        f()
    }
}

/// Userspace [`Platform`]: maps OS threads onto a fixed pool of logical CPU
/// slots, backs small/large allocation with [`std::alloc::System`], and
/// derives ticks from a process-wide [`Instant`].
///
/// The CPU-slot mapping is "first thread to touch it claims it for its
/// lifetime" — adequate for tests and for embedding in a single process,
/// not a real scheduler-aware placement.
pub struct StdPlatform {
    start: Instant,
    tick_hz: u64,
    num_cpus: usize,
    thread_slots: Mutex<HashMap<std::thread::ThreadId, usize>>,
    next_slot: AtomicUsize,
}

impl StdPlatform {
    pub fn new() -> Self {
        Self::with_cpus(num_cpus::get().max(1))
    }

    pub fn with_cpus(num_cpus: usize) -> Self {
        StdPlatform {
            start: Instant::now(),
            tick_hz: 1000,
            num_cpus: num_cpus.max(1),
            thread_slots: Mutex::new(HashMap::new()),
            next_slot: AtomicUsize::new(0),
        }
    }
}

impl Default for StdPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for StdPlatform {
    fn kmem_alloc(&self, size: usize, align: usize, _flags: AllocFlags) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1), align.max(1)).ok()?;
        let raw = unsafe { alloc::alloc(layout) };
        NonNull::new(raw)
    }

    unsafe fn kmem_free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = Layout::from_size_align_unchecked(size.max(1), align.max(1));
        alloc::dealloc(ptr.as_ptr(), layout);
    }

    fn vmem_alloc(&self, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        self.kmem_alloc(size, align, flags)
    }

    unsafe fn vmem_free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        self.kmem_free(ptr, size, align)
    }

    fn cpu_id(&self) -> usize {
        let id = std::thread::current().id();
        let mut slots = self.thread_slots.lock().unwrap();
        if let Some(&slot) = slots.get(&id) {
            return slot;
        }
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.num_cpus;
        slots.insert(id, slot);
        slot
    }

    fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    fn now_ticks(&self) -> u64 {
        (self.start.elapsed().as_secs_f64() * self.tick_hz as f64) as u64
    }

    fn ticks_per_second(&self) -> u64 {
        self.tick_hz
    }

    fn is_sleep_safe(&self) -> bool {
        true
    }
}

/// Deterministic [`Platform`] for driving timing- and CPU-affinity-sensitive
/// scenarios from a test: the clock only advances when told to, and a
/// thread's logical CPU can be pinned explicitly instead of being assigned
/// on first touch.
///
/// Gated behind `#[cfg(test)]` for this crate's own unit tests and behind
/// the `test-util` feature for integration tests, which compile the crate
/// as an ordinary dependency and so never see plain `#[cfg(test)]` items.
#[cfg(any(test, feature = "test-util"))]
pub struct TestPlatform {
    ticks: AtomicUsize,
    tick_hz: u64,
    num_cpus: usize,
    thread_slots: Mutex<HashMap<std::thread::ThreadId, usize>>,
}

#[cfg(any(test, feature = "test-util"))]
impl TestPlatform {
    pub fn new(num_cpus: usize) -> Self {
        TestPlatform {
            ticks: AtomicUsize::new(0),
            tick_hz: 1000,
            num_cpus: num_cpus.max(1),
            thread_slots: Mutex::new(HashMap::new()),
        }
    }

    /// Pin the calling thread to a specific logical CPU slot.
    pub fn pin_current_thread(&self, cpu: usize) {
        let id = std::thread::current().id();
        self.thread_slots.lock().unwrap().insert(id, cpu % self.num_cpus);
    }

    pub fn advance_ticks(&self, ticks: u64) {
        self.ticks.fetch_add(ticks as usize, Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Platform for TestPlatform {
    fn kmem_alloc(&self, size: usize, align: usize, _flags: AllocFlags) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1), align.max(1)).ok()?;
        let raw = unsafe { alloc::alloc(layout) };
        NonNull::new(raw)
    }

    unsafe fn kmem_free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = Layout::from_size_align_unchecked(size.max(1), align.max(1));
        alloc::dealloc(ptr.as_ptr(), layout);
    }

    fn vmem_alloc(&self, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        self.kmem_alloc(size, align, flags)
    }

    unsafe fn vmem_free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        self.kmem_free(ptr, size, align)
    }

    fn cpu_id(&self) -> usize {
        let id = std::thread::current().id();
        *self.thread_slots.lock().unwrap().entry(id).or_insert(0)
    }

    fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst) as u64
    }

    fn ticks_per_second(&self) -> u64 {
        self.tick_hz
    }

    fn is_sleep_safe(&self) -> bool {
        true
    }
}
