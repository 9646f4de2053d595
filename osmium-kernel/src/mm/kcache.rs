//! Typed object caches
//!
//! [`KCache<T>`] wraps an object pool with a typed, owning interface:
//! `alloc` places a value into a pool block and returns a [`KBox`], which
//! writes the destructor and returns the block on drop. The kernel's
//! high-churn descriptors (tasks, mailboxes, interrupt threads) allocate
//! here instead of hammering the heap free lists.

use core::mem::{align_of, size_of};
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use osmium_abi::Errno;
use osmium_pool::Pool;

use crate::mm::page::KernelPages;
use crate::sync::Spinlock;

/// A typed cache of `T` objects backed by an object pool.
pub struct KCache<T> {
    pool: Spinlock<Pool<KernelPages>>,
    _marker: core::marker::PhantomData<fn() -> T>,
}

impl<T> KCache<T> {
    /// Create the cache. Called once per type at kernel init.
    ///
    /// Panics on unusable geometry: the kernel's descriptor types are
    /// compile-time known, so that is a build bug, not a runtime error.
    #[must_use]
    pub fn create(name: &'static str) -> Self {
        let pool = Pool::create(name, size_of::<T>(), align_of::<T>(), None, None, KernelPages)
            .unwrap_or_else(|e| panic!("cannot create cache {name}: {e:?}"));
        Self {
            pool: Spinlock::new(name, pool),
            _marker: core::marker::PhantomData,
        }
    }

    /// Move `value` into a pool block.
    pub fn alloc(&'static self, value: T) -> Result<KBox<T>, Errno> {
        let block = self.pool.lock().get().ok_or(Errno::ENOMEM)?;
        let ptr = block.cast::<T>();
        // SAFETY: The block is big enough and aligned for T (pool
        // geometry), and exclusively ours.
        unsafe { ptr.as_ptr().write(value) };
        Ok(KBox { ptr, cache: self })
    }

    /// Number of live objects.
    #[must_use]
    pub fn live(&self) -> usize {
        self.pool.lock().live()
    }
}

/// Owning handle to a cache-allocated object.
pub struct KBox<T: 'static> {
    ptr: NonNull<T>,
    cache: &'static KCache<T>,
}

// SAFETY: KBox is a unique owner; moving it between threads moves the T.
unsafe impl<T: Send> Send for KBox<T> {}
unsafe impl<T: Sync> Sync for KBox<T> {}

impl<T> KBox<T> {
    /// Leak the box, never returning the block to its pool.
    ///
    /// For objects that live for the kernel's lifetime, such as bottom-half
    /// interrupt state shared with an ISR stub.
    #[must_use]
    pub fn leak(b: KBox<T>) -> &'static mut T {
        let b = core::mem::ManuallyDrop::new(b);
        // SAFETY: The block is never freed, so the reference stays valid
        // forever; ManuallyDrop suppresses the pool return.
        unsafe { &mut *b.ptr.as_ptr() }
    }
}

impl<T> Deref for KBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: ptr points at a live T owned by this box.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for KBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: ptr points at a live T owned by this box.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for KBox<T> {
    fn drop(&mut self) {
        // SAFETY: We own the value and the block; after drop_in_place the
        // block goes back to the pool unused.
        unsafe {
            core::ptr::drop_in_place(self.ptr.as_ptr());
            self.cache.pool.lock().put(self.ptr.cast());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spin::Once;

    struct Tracked {
        value: u64,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.value = 0;
        }
    }

    fn cache() -> &'static KCache<Tracked> {
        static CACHE: Once<KCache<Tracked>> = Once::new();
        CACHE.call_once(|| KCache::create("t_kcache"))
    }

    #[test]
    fn test_alloc_and_reuse() {
        let _serial = crate::test_sync::guard();
        let cache = cache();

        let a = cache.alloc(Tracked { value: 7 }).unwrap();
        assert_eq!(a.value, 7);
        let before = cache.live();

        let a_ptr = a.ptr;
        drop(a);
        assert_eq!(cache.live(), before - 1);

        let b = cache.alloc(Tracked { value: 9 }).unwrap();
        assert_eq!(b.ptr, a_ptr, "freed block is reused first");
        assert_eq!(b.value, 9);
    }
}
