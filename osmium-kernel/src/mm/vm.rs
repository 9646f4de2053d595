//! Per-process address space
//!
//! A [`VmSpace`] is a set of typed region descriptors, each owning the
//! physical frames behind a span of user virtual addresses, plus the
//! hardware translation table the scheduler loads while the owning
//! process runs.
//!
//! Fork clones a space by sharing every frame (reference-counted) and
//! mapping both sides read-only; the first write through either side
//! faults, and [`VmSpace::handle_fault`] upgrades the shared frame into a
//! unique writable copy. Kernel-side access (`copy_out`, ELF loading)
//! goes through the same materialization path, so a shared frame is never
//! written in place.
//!
//! Frames are addressed through the kernel's one-to-one physical map, so
//! a frame's kernel address doubles as its physical address.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use osmium_abi::{Errno, PAGE_SIZE, USTACK_TOP};
use osmium_arch::mmu;

use crate::mm::page::PageBox;

bitflags! {
    /// Region permissions.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
    }
}

/// One physical page, owned by the frame references that share it.
struct Frame {
    page: PageBox,
}

type FrameRef = Arc<Frame>;

fn alloc_frame() -> Result<FrameRef, Errno> {
    Ok(Arc::new(Frame {
        page: PageBox::alloc_zeroed(0)?,
    }))
}

/// A contiguous span of user pages with one set of permissions.
struct VmRegion {
    base: usize,
    flags: VmFlags,
    frames: Vec<FrameRef>,
}

impl VmRegion {
    fn size(&self) -> usize {
        self.frames.len() * PAGE_SIZE
    }

    fn contains(&self, va: usize) -> bool {
        va >= self.base && va < self.base + self.size()
    }
}

/// A per-process virtual address space.
pub struct VmSpace {
    /// L1 translation table root (16 KiB, naturally aligned).
    ttb: PageBox,
    /// L2 tables, one per touched 1 MiB slot.
    l2_tables: BTreeMap<usize, PageBox>,
    /// Regions keyed by base address.
    regions: BTreeMap<usize, VmRegion>,
    /// Program break for `grow`.
    brk: usize,
}

impl VmSpace {
    /// Create an empty address space with a zeroed translation root.
    pub fn create() -> Result<Self, Errno> {
        Ok(Self {
            ttb: PageBox::alloc_zeroed(2)?,
            l2_tables: BTreeMap::new(),
            regions: BTreeMap::new(),
            brk: 0,
        })
    }

    /// Physical address of the translation root, for TTBR0.
    #[must_use]
    pub fn ttb_phys(&self) -> usize {
        self.ttb.addr()
    }

    /// Reserve `size` bytes at `va` with the given permissions, backed by
    /// zeroed frames.
    ///
    /// Both ends are page-aligned outward. Fails with `EINVAL` on an
    /// empty or out-of-user-range span or an overlap with an existing
    /// region.
    pub fn alloc_region(&mut self, va: usize, size: usize, flags: VmFlags) -> Result<(), Errno> {
        let start = va & !(PAGE_SIZE - 1);
        let end = va
            .checked_add(size)
            .ok_or(Errno::EINVAL)?
            .div_ceil(PAGE_SIZE)
            * PAGE_SIZE;

        if start >= end || end > USTACK_TOP as usize {
            return Err(Errno::EINVAL);
        }
        if self.overlaps(start, end) {
            return Err(Errno::EINVAL);
        }

        let mut frames = Vec::new();
        for _ in (start..end).step_by(PAGE_SIZE) {
            frames.push(alloc_frame()?);
        }

        let region = VmRegion {
            base: start,
            flags,
            frames,
        };
        self.map_region(&region)?;
        self.regions.insert(start, region);

        if end > self.brk {
            self.brk = end;
        }

        Ok(())
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        self.regions
            .values()
            .any(|r| start < r.base + r.size() && r.base < end)
    }

    /// Extend the address space by `increment` bytes at the program
    /// break, returning the base of the new span.
    pub fn grow(&mut self, increment: usize) -> Result<usize, Errno> {
        let base = self.brk;
        self.alloc_region(
            base,
            increment,
            VmFlags::READ | VmFlags::WRITE | VmFlags::USER,
        )?;
        Ok(base)
    }

    /// Copy `data` into the space at `va`, materializing shared frames.
    pub fn copy_out(&mut self, va: usize, data: &[u8]) -> Result<(), Errno> {
        let mut at = va;
        let mut rest = data;

        while !rest.is_empty() {
            let chunk = (PAGE_SIZE - at % PAGE_SIZE).min(rest.len());
            let offset = at % PAGE_SIZE;

            let frame = self.writable_frame(at)?;
            // SAFETY: The frame is exclusively ours after
            // writable_frame, and offset+chunk stays inside the page.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    rest.as_ptr(),
                    frame.page.as_ptr().add(offset),
                    chunk,
                );
            }

            at += chunk;
            rest = &rest[chunk..];
        }

        Ok(())
    }

    /// Copy `buf.len()` bytes out of the space at `va`.
    pub fn copy_in(&self, va: usize, buf: &mut [u8]) -> Result<(), Errno> {
        let mut at = va;
        let mut rest: &mut [u8] = buf;

        while !rest.is_empty() {
            let chunk = (PAGE_SIZE - at % PAGE_SIZE).min(rest.len());
            let offset = at % PAGE_SIZE;

            let (region, index) = self.lookup(at)?;
            let frame = &region.frames[index];
            let (head, tail) = core::mem::take(&mut rest).split_at_mut(chunk);
            head.copy_from_slice(&frame.page.as_slice()[offset..offset + chunk]);

            at += chunk;
            rest = tail;
        }

        Ok(())
    }

    /// Clone the space for fork: every frame is shared and both sides are
    /// mapped read-only, so the first write on either side faults into
    /// [`VmSpace::handle_fault`].
    pub fn try_clone(&mut self) -> Result<Self, Errno> {
        let mut child = Self::create()?;

        for (base, region) in &self.regions {
            let clone = VmRegion {
                base: region.base,
                flags: region.flags,
                frames: region.frames.iter().map(Arc::clone).collect(),
            };
            child.map_region(&clone)?;
            child.regions.insert(*base, clone);
        }
        child.brk = self.brk;

        // Downgrade the parent's own mappings: shared frames must fault
        // on write here too.
        let bases: Vec<usize> = self.regions.keys().copied().collect();
        for base in bases {
            let region = self.regions.remove(&base).expect("region listed above");
            self.map_region(&region)?;
            self.regions.insert(base, region);
        }

        Ok(child)
    }

    /// Resolve a write fault at `va`.
    ///
    /// If the address lies in a writable region whose frame is shared,
    /// the frame is copied into a unique writable one and remapped;
    /// if the frame is already unique, it is simply remapped writable
    /// (the other side of the share went away). Anything else is a real
    /// fault and comes back `EINVAL` for the trap path to kill with.
    pub fn handle_fault(&mut self, va: usize) -> Result<(), Errno> {
        let page_va = va & !(PAGE_SIZE - 1);
        self.writable_frame(page_va)?;
        Ok(())
    }

    /// Find the region and frame index backing `va`.
    fn lookup(&self, va: usize) -> Result<(&VmRegion, usize), Errno> {
        let (_, region) = self
            .regions
            .range(..=va)
            .next_back()
            .ok_or(Errno::EINVAL)?;
        if !region.contains(va) {
            return Err(Errno::EINVAL);
        }
        Ok((region, (va - region.base) / PAGE_SIZE))
    }

    /// Get the unique, writable frame backing `va`, materializing a
    /// private copy of a shared frame first.
    fn writable_frame(&mut self, va: usize) -> Result<&FrameRef, Errno> {
        let base = {
            let (region, _) = self.lookup(va)?;
            if !region.flags.contains(VmFlags::WRITE) {
                return Err(Errno::EINVAL);
            }
            region.base
        };

        let index = (va - base) / PAGE_SIZE;
        let entry = {
            let region = self.regions.get_mut(&base).expect("region looked up above");

            if Arc::strong_count(&region.frames[index]) > 1 {
                let fresh = alloc_frame()?;
                // SAFETY: Distinct frames; both are full pages.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        region.frames[index].page.as_ptr(),
                        fresh.page.as_ptr(),
                        PAGE_SIZE,
                    );
                }
                region.frames[index] = fresh;
            }

            mmu::l2_page_entry(region.frames[index].page.addr(), true)
        };

        self.map_one(base + index * PAGE_SIZE, entry)?;

        let region = self.regions.get(&base).expect("region looked up above");
        Ok(&region.frames[index])
    }

    /// Write the translation entries for every page of `region`.
    ///
    /// A writable region maps read-only while any of its frames is
    /// shared; that is what arms copy-on-write.
    fn map_region(&mut self, region: &VmRegion) -> Result<(), Errno> {
        for (i, frame) in region.frames.iter().enumerate() {
            let va = region.base + i * PAGE_SIZE;
            let writable =
                region.flags.contains(VmFlags::WRITE) && Arc::strong_count(frame) == 1;
            let entry = mmu::l2_page_entry(frame.page.addr(), writable);
            self.map_one(va, entry)?;
        }
        Ok(())
    }

    /// Write one L2 entry, carving the L2 table on first touch of its
    /// 1 MiB slot.
    fn map_one(&mut self, va: usize, entry: u32) -> Result<(), Errno> {
        let slot = mmu::l1_index(va);

        if !self.l2_tables.contains_key(&slot) {
            let table = PageBox::alloc_zeroed(0)?;
            // SAFETY: The slot index is < L1_ENTRIES (va is below the
            // user ceiling) and the root is a zeroed 16 KiB table.
            unsafe {
                let l1 = self.ttb.as_ptr() as *mut u32;
                l1.add(slot).write_volatile(mmu::l1_table_entry(table.addr()));
            }
            self.l2_tables.insert(slot, table);
        }

        let table = self.l2_tables.get_mut(&slot).expect("carved above");
        // SAFETY: l2_index < L2_ENTRIES and the table page is 4 KiB.
        unsafe {
            let l2 = table.as_ptr() as *mut u32;
            l2.add(mmu::l2_index(va)).write_volatile(entry);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RWX: VmFlags = VmFlags::READ
        .union(VmFlags::WRITE)
        .union(VmFlags::EXEC)
        .union(VmFlags::USER);

    #[test]
    fn test_copy_out_and_back() {
        let mut vm = VmSpace::create().unwrap();
        vm.alloc_region(0x1_0000, 2 * PAGE_SIZE, RWX).unwrap();

        let data = b"hello, address space";
        vm.copy_out(0x1_0000 + PAGE_SIZE - 8, data).unwrap();

        let mut back = [0u8; 20];
        vm.copy_in(0x1_0000 + PAGE_SIZE - 8, &mut back).unwrap();
        assert_eq!(&back, data);
    }

    #[test]
    fn test_regions_may_not_overlap() {
        let mut vm = VmSpace::create().unwrap();
        vm.alloc_region(0x1_0000, PAGE_SIZE, RWX).unwrap();
        assert_eq!(
            vm.alloc_region(0x1_0000, PAGE_SIZE, RWX),
            Err(Errno::EINVAL)
        );
        assert_eq!(
            vm.alloc_region(0xF000, 2 * PAGE_SIZE, RWX),
            Err(Errno::EINVAL)
        );
        vm.alloc_region(0x2_0000, PAGE_SIZE, RWX).unwrap();
    }

    #[test]
    fn test_unmapped_access_fails() {
        let vm = VmSpace::create().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(vm.copy_in(0x5000, &mut buf), Err(Errno::EINVAL));
    }

    #[test]
    fn test_clone_shares_then_fork_law_holds() {
        let mut parent = VmSpace::create().unwrap();
        parent.alloc_region(0x4_0000, PAGE_SIZE, RWX).unwrap();
        parent.copy_out(0x4_0000, b"fork me").unwrap();

        let child = parent.try_clone().unwrap();

        // Every readable byte of parent memory equals the child's.
        let mut p = [0u8; 7];
        let mut c = [0u8; 7];
        parent.copy_in(0x4_0000, &mut p).unwrap();
        child.copy_in(0x4_0000, &mut c).unwrap();
        assert_eq!(p, c);
    }

    #[test]
    fn test_cow_materializes_on_write() {
        let mut parent = VmSpace::create().unwrap();
        parent.alloc_region(0x4_0000, PAGE_SIZE, RWX).unwrap();
        parent.copy_out(0x4_0000, b"original").unwrap();

        let mut child = parent.try_clone().unwrap();

        // Writing different bytes into the same virtual page from each
        // side yields two distinct pages.
        parent.copy_out(0x4_0000, b"parent!!").unwrap();
        child.copy_out(0x4_0000, b"child!!!").unwrap();

        let mut p = [0u8; 8];
        let mut c = [0u8; 8];
        parent.copy_in(0x4_0000, &mut p).unwrap();
        child.copy_in(0x4_0000, &mut c).unwrap();
        assert_eq!(&p, b"parent!!");
        assert_eq!(&c, b"child!!!");
    }

    #[test]
    fn test_fault_on_shared_frame_upgrades() {
        let mut parent = VmSpace::create().unwrap();
        parent.alloc_region(0x4_0000, PAGE_SIZE, RWX).unwrap();
        let mut child = parent.try_clone().unwrap();

        child.handle_fault(0x4_0000 + 12).unwrap();

        // Fault outside any region is a real fault.
        assert_eq!(child.handle_fault(0x9_0000), Err(Errno::EINVAL));
        drop(parent);
    }

    #[test]
    fn test_fault_on_readonly_region_is_fatal() {
        let mut vm = VmSpace::create().unwrap();
        vm.alloc_region(0x4_0000, PAGE_SIZE, VmFlags::READ | VmFlags::USER)
            .unwrap();
        assert_eq!(vm.handle_fault(0x4_0000), Err(Errno::EINVAL));
    }

    #[test]
    fn test_grow_extends_break() {
        let mut vm = VmSpace::create().unwrap();
        vm.alloc_region(0x1_0000, PAGE_SIZE, RWX).unwrap();

        let first = vm.grow(100).unwrap();
        assert_eq!(first, 0x1_0000 + PAGE_SIZE);
        let second = vm.grow(PAGE_SIZE).unwrap();
        assert_eq!(second, first + PAGE_SIZE);
    }
}
