//! Page-frame facade
//!
//! The physical frame allocator is an external collaborator; the core only
//! needs "give me `2^order` zeroed, page-aligned, contiguous pages" for
//! kernel stacks, translation tables, user frames, and slab backing. On
//! the target those requests land in the buddy heap set up at boot; on the
//! host they route to the test process allocator, which is what lets the
//! kernel logic unit-test off-target.

use core::alloc::Layout;
use core::ptr::NonNull;

use osmium_abi::{Errno, PAGE_SIZE};
use osmium_pool::PagePool;

fn layout_for(order: usize) -> Layout {
    // Naturally aligned: an order-2 group (a translation table root) must
    // sit on a 16 KiB boundary for TTBR0.
    Layout::from_size_align(PAGE_SIZE << order, PAGE_SIZE << order).expect("page layout")
}

/// An owned, zeroed group of `2^order` contiguous pages.
pub struct PageBox {
    ptr: NonNull<u8>,
    order: usize,
}

// SAFETY: PageBox is a unique owner of its allocation.
unsafe impl Send for PageBox {}
unsafe impl Sync for PageBox {}

impl PageBox {
    /// Allocate a zeroed page group.
    pub fn alloc_zeroed(order: usize) -> Result<Self, Errno> {
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout_for(order)) };
        NonNull::new(ptr)
            .map(|ptr| Self { ptr, order })
            .ok_or(Errno::ENOMEM)
    }

    /// Base address.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Base address as an integer.
    #[inline]
    #[must_use]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// One past the last byte; kernel stacks grow down from here.
    #[inline]
    #[must_use]
    pub fn top(&self) -> usize {
        self.addr() + self.len()
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        PAGE_SIZE << self.order
    }

    /// View the pages as bytes.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: We own `len` initialised (zeroed) bytes at `ptr`.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    /// View the pages as mutable bytes.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: We own `len` initialised (zeroed) bytes at `ptr`.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl Drop for PageBox {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from alloc_zeroed with this exact layout.
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), layout_for(self.order)) };
    }
}

/// The kernel-side backing store for object pools.
pub struct KernelPages;

impl PagePool for KernelPages {
    fn alloc_pages(&self, order: usize) -> Option<NonNull<u8>> {
        // SAFETY: layout has non-zero size.
        NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout_for(order)) })
    }

    unsafe fn free_pages(&self, ptr: NonNull<u8>, order: usize) {
        // SAFETY: caller passes a pointer from alloc_pages(order).
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout_for(order)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagebox_is_zeroed_and_aligned() {
        let page = PageBox::alloc_zeroed(0).unwrap();
        assert_eq!(page.addr() % PAGE_SIZE, 0);
        assert_eq!(page.len(), PAGE_SIZE);
        assert!(page.as_slice().iter().all(|b| *b == 0));
        assert_eq!(page.top() - page.addr(), PAGE_SIZE);
    }

    #[test]
    fn test_pagebox_orders() {
        let group = PageBox::alloc_zeroed(2).unwrap();
        assert_eq!(group.len(), 4 * PAGE_SIZE);
    }
}
