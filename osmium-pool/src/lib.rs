//! # osmium-pool
//!
//! Object pool (slab) allocator: named caches of same-sized, same-aligned
//! objects carved from contiguous page groups, amortizing page-allocator
//! pressure for the kernel's high-churn structures (tasks, processes,
//! mailboxes).
//!
//! # Design
//!
//! - Slabs move between three lists as their free count changes: `full`
//!   (no free blocks), `partial`, and at most one retained `idle` slab;
//!   further fully-free slabs are returned to the page pool.
//! - Block constructors run once when a slab is carved, destructors once
//!   when it is released, so `get` normally hands out pre-constructed
//!   objects.
//! - Consecutive slabs start at staggered color offsets modulo the pool's
//!   `color_max`, spreading hot fields across cache-line sets.
//! - Metadata is kept out-of-line from the blocks.
//!
//! # Serialization
//!
//! `Pool` methods take `&mut self`; the kernel wraps each pool in its
//! IRQ-safe spinlock, unit tests use plain ownership.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod error;
pub mod slab;
pub mod traits;

use alloc::vec::Vec;
use core::ptr::NonNull;

pub use error::PoolError;
pub use slab::{Slab, SlabGeometry};
pub use traits::{PagePool, PAGE_SIZE};

/// Constructor/destructor invoked with the block address and object size.
pub type ObjHook = fn(NonNull<u8>, usize);

/// Inventory of live pools, for diagnostics.
static INVENTORY: spin::Mutex<Vec<&'static str>> = spin::Mutex::new(Vec::new());

/// Run `f` over the names of all live pools.
pub fn for_each_pool(mut f: impl FnMut(&'static str)) {
    for name in INVENTORY.lock().iter() {
        f(name);
    }
}

/// A named cache of fixed-size objects.
pub struct Pool<P: PagePool> {
    name: &'static str,
    pages: P,
    geometry: SlabGeometry,
    color_next: usize,
    ctor: Option<ObjHook>,
    dtor: Option<ObjHook>,
    partial: Vec<Slab>,
    full: Vec<Slab>,
    /// At most one fully-free slab kept as a warm reserve.
    idle: Option<Slab>,
}

impl<P: PagePool> core::fmt::Debug for Pool<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("live", &self.live())
            .field("geometry", &self.geometry)
            .finish()
    }
}

impl<P: PagePool> Pool<P> {
    /// Create a pool of `obj_size`-byte objects aligned to `align`.
    ///
    /// `ctor`/`dtor` run when blocks enter and leave the pool (per slab),
    /// not on every `get`/`put`.
    pub fn create(
        name: &'static str,
        obj_size: usize,
        align: usize,
        ctor: Option<ObjHook>,
        dtor: Option<ObjHook>,
        pages: P,
    ) -> Result<Self, PoolError> {
        let geometry = SlabGeometry::compute(obj_size, align).ok_or(PoolError::BadGeometry)?;

        INVENTORY.lock().push(name);
        log::debug!(
            "pool {}: {} x {} bytes per order-{} slab, color range {}",
            name,
            geometry.capacity,
            geometry.block_size,
            geometry.page_order,
            geometry.color_max
        );

        Ok(Self {
            name,
            pages,
            geometry,
            color_next: 0,
            ctor,
            dtor,
            partial: Vec::new(),
            full: Vec::new(),
            idle: None,
        })
    }

    /// Pool name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Pool geometry (capacity, order, coloring).
    #[inline]
    #[must_use]
    pub fn geometry(&self) -> &SlabGeometry {
        &self.geometry
    }

    /// Number of live objects.
    #[must_use]
    pub fn live(&self) -> usize {
        self.partial.iter().map(Slab::used).sum::<usize>()
            + self.full.iter().map(Slab::used).sum::<usize>()
    }

    /// Take an object from the pool, carving a new slab if needed.
    ///
    /// Returns `None` when the page pool is exhausted.
    #[must_use]
    pub fn get(&mut self) -> Option<NonNull<u8>> {
        if self.partial.is_empty() {
            let slab = match self.idle.take() {
                Some(slab) => slab,
                None => self.carve_slab()?,
            };
            self.partial.push(slab);
        }

        let slab = self.partial.last_mut().expect("partial list refilled above");
        let block = slab.take(&self.geometry).expect("partial slab has a free block");

        if slab.is_full(&self.geometry) {
            let slab = self.partial.pop().expect("slab just borrowed");
            self.full.push(slab);
        }

        Some(block)
    }

    /// Return an object to its owning slab.
    ///
    /// Panics if `ptr` does not belong to this pool: that is a kernel bug
    /// on par with a double free.
    pub fn put(&mut self, ptr: NonNull<u8>) {
        if let Some(pos) = self
            .full
            .iter()
            .position(|s| s.owns(ptr, &self.geometry))
        {
            let mut slab = self.full.swap_remove(pos);
            slab.give_back(ptr, &self.geometry);
            if slab.is_idle() {
                // Single-block slabs go straight from full to free.
                self.retire_slab(slab);
            } else {
                self.partial.push(slab);
            }
            return;
        }

        if let Some(pos) = self
            .partial
            .iter()
            .position(|s| s.owns(ptr, &self.geometry))
        {
            let mut slab = self.partial.swap_remove(pos);
            slab.give_back(ptr, &self.geometry);
            if slab.is_idle() {
                self.retire_slab(slab);
            } else {
                self.partial.push(slab);
            }
            return;
        }

        panic!("pool {}: put of foreign pointer {:p}", self.name, ptr);
    }

    /// Tear the pool down.
    ///
    /// Fails while any object is live, handing the still-usable pool back
    /// alongside [`PoolError::Busy`]; otherwise runs destructors, releases
    /// every page group, and unlinks the pool from the inventory.
    pub fn destroy(mut self) -> Result<(), (Self, PoolError)> {
        if !self.partial.is_empty() || !self.full.is_empty() {
            return Err((self, PoolError::Busy));
        }

        if let Some(slab) = self.idle.take() {
            self.release_slab(slab);
        }

        let mut inventory = INVENTORY.lock();
        if let Some(pos) = inventory.iter().position(|n| *n == self.name) {
            inventory.swap_remove(pos);
        }

        Ok(())
    }

    /// Allocate and construct a fresh slab at the next color offset.
    fn carve_slab(&mut self) -> Option<Slab> {
        let base = self.pages.alloc_pages(self.geometry.page_order)?;

        let color = self.color_next;
        if self.geometry.color_max > 0 {
            self.color_next =
                (self.color_next + self.geometry.block_align) % (self.geometry.color_max + 1);
        }

        let slab = Slab::new(base, color, &self.geometry);
        if let Some(ctor) = self.ctor {
            for i in 0..self.geometry.capacity {
                ctor(slab.block_at(i, &self.geometry), self.geometry.obj_size);
            }
        }

        Some(slab)
    }

    /// Handle a slab that just became fully free.
    fn retire_slab(&mut self, slab: Slab) {
        if self.idle.is_none() {
            self.idle = Some(slab);
        } else {
            self.release_slab(slab);
        }
    }

    /// Destruct the blocks of a fully-free slab and return its pages.
    fn release_slab(&mut self, slab: Slab) {
        debug_assert!(slab.is_idle());

        if let Some(dtor) = self.dtor {
            for i in 0..self.geometry.capacity {
                dtor(slab.block_at(i, &self.geometry), self.geometry.obj_size);
            }
        }

        // SAFETY: The slab's base came from this page pool with this
        // order, and no block outlives the slab (is_idle checked).
        unsafe {
            self.pages.free_pages(slab.base(), self.geometry.page_order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use core::sync::atomic::{AtomicUsize, Ordering};

    extern crate std;

    /// Host-memory page pool tracking outstanding groups.
    struct HostPages {
        outstanding: Cell<usize>,
        /// Fail allocations after this many successes (usize::MAX = never).
        budget: Cell<usize>,
    }

    impl HostPages {
        fn new() -> Self {
            Self {
                outstanding: Cell::new(0),
                budget: Cell::new(usize::MAX),
            }
        }

        fn with_budget(groups: usize) -> Self {
            let p = Self::new();
            p.budget.set(groups);
            p
        }
    }

    impl PagePool for &HostPages {
        fn alloc_pages(&self, order: usize) -> Option<NonNull<u8>> {
            if self.budget.get() == 0 {
                return None;
            }
            self.budget.set(self.budget.get() - 1);
            self.outstanding.set(self.outstanding.get() + 1);

            let layout =
                std::alloc::Layout::from_size_align(PAGE_SIZE << order, PAGE_SIZE).unwrap();
            // SAFETY: layout has non-zero size.
            NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
        }

        unsafe fn free_pages(&self, ptr: NonNull<u8>, order: usize) {
            self.outstanding.set(self.outstanding.get() - 1);
            let layout =
                std::alloc::Layout::from_size_align(PAGE_SIZE << order, PAGE_SIZE).unwrap();
            // SAFETY: caller passes a pointer from alloc_pages(order).
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }

    #[test]
    fn test_get_put_recycles_blocks() {
        let pages = HostPages::new();
        let mut pool = Pool::create("t_recycle", 128, 8, None, None, &pages).unwrap();

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.live(), 2);

        pool.put(b);
        let c = pool.get().unwrap();
        assert_eq!(b, c, "freed block is reused first");

        pool.put(a);
        pool.put(c);
        assert_eq!(pool.live(), 0);
        pool.destroy().unwrap();
        assert_eq!(pages.outstanding.get(), 0);
    }

    #[test]
    fn test_slab_overflow_carves_second_slab() {
        let pages = HostPages::new();
        let mut pool = Pool::create("t_overflow", 1024, 8, None, None, &pages).unwrap();
        let capacity = pool.geometry().capacity;

        let mut blocks = std::vec::Vec::new();
        for _ in 0..capacity + 1 {
            blocks.push(pool.get().unwrap());
        }
        assert_eq!(pool.live(), capacity + 1);
        assert_eq!(pages.outstanding.get(), 2);

        for b in blocks.drain(..) {
            pool.put(b);
        }
        assert_eq!(pool.live(), 0);
        // One idle slab retained, the other returned.
        assert_eq!(pages.outstanding.get(), 1);

        pool.destroy().unwrap();
        assert_eq!(pages.outstanding.get(), 0);
    }

    #[test]
    fn test_ctor_runs_once_per_block() {
        static CTOR_CALLS: AtomicUsize = AtomicUsize::new(0);

        fn count_ctor(_ptr: NonNull<u8>, _size: usize) {
            CTOR_CALLS.fetch_add(1, Ordering::Relaxed);
        }

        let pages = HostPages::new();
        let mut pool = Pool::create("t_ctor", 512, 8, Some(count_ctor), None, &pages).unwrap();
        let capacity = pool.geometry().capacity;

        let a = pool.get().unwrap();
        assert_eq!(CTOR_CALLS.load(Ordering::Relaxed), capacity);

        // Churning within the same slab must not re-run constructors.
        pool.put(a);
        let b = pool.get().unwrap();
        pool.put(b);
        assert_eq!(CTOR_CALLS.load(Ordering::Relaxed), capacity);

        pool.destroy().unwrap();
    }

    #[test]
    fn test_destroy_with_live_objects_fails() {
        let pages = HostPages::new();
        let mut pool = Pool::create("t_busy", 64, 8, None, None, &pages).unwrap();
        let a = pool.get().unwrap();

        let mut pool = match pool.destroy() {
            Err((pool, PoolError::Busy)) => pool,
            Err((_, e)) => panic!("expected Busy, got {e:?}"),
            Ok(()) => panic!("destroy succeeded with a live object"),
        };

        pool.put(a);
        pool.destroy().unwrap();
        assert_eq!(pages.outstanding.get(), 0);
    }

    #[test]
    fn test_exhausted_page_pool_reports_none() {
        let pages = HostPages::with_budget(1);
        let mut pool = Pool::create("t_oom", 2048, 8, None, None, &pages).unwrap();
        let capacity = pool.geometry().capacity;

        for _ in 0..capacity {
            assert!(pool.get().is_some());
        }
        assert!(pool.get().is_none(), "second slab cannot be carved");
    }

    #[test]
    fn test_coloring_staggers_consecutive_slabs() {
        let pages = HostPages::new();
        // 200-byte objects leave a coloring range at order 0.
        let mut pool = Pool::create("t_color", 200, 8, None, None, &pages).unwrap();
        assert!(pool.geometry().color_max > 0);
        let capacity = pool.geometry().capacity;
        let block = pool.geometry().block_size;

        let mut blocks = std::vec::Vec::new();
        for _ in 0..capacity + 1 {
            blocks.push(pool.get().unwrap());
        }

        let offset = |p: NonNull<u8>| (p.as_ptr() as usize) % PAGE_SIZE % block;
        let first_slab = offset(blocks[0]);
        let second_slab = offset(blocks[capacity]);
        assert_ne!(first_slab, second_slab, "second slab must be color-shifted");

        for b in blocks.drain(..) {
            pool.put(b);
        }
    }

    #[test]
    fn test_inventory_tracks_pools() {
        let pages = HostPages::new();
        let pool = Pool::create("t_inventory_x", 64, 8, None, None, &pages).unwrap();

        let mut seen = false;
        for_each_pool(|name| seen |= name == "t_inventory_x");
        assert!(seen);

        pool.destroy().unwrap();
        let mut seen = false;
        for_each_pool(|name| seen |= name == "t_inventory_x");
        assert!(!seen);
    }
}
