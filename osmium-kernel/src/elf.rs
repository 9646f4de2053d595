//! ELF32 binary loader
//!
//! Loads a little-endian ARM ELF32 image into a process address space.
//! Only `PT_LOAD` segments are honored: each is reserved at its virtual
//! address with read-write-execute user permissions, `filesz` bytes are
//! copied from the image, and the `memsz` remainder stays zero. Finally
//! the fixed user stack is reserved and the trap frame is pointed at the
//! image entry with an empty argument vector.

use elf_rs::{Elf, ElfFile, ProgramType};

use osmium_abi::{Errno, USTACK_SIZE, USTACK_TOP};
use osmium_arch::TrapFrame;

use crate::mm::{VmFlags, VmSpace};

/// Load `image` into `vm` and prime `tf` for the first user entry.
pub fn load_binary(vm: &mut VmSpace, tf: &mut TrapFrame, image: &[u8]) -> Result<(), Errno> {
    let elf = Elf::from_bytes(image).map_err(|_| Errno::EINVAL)?;

    let Elf::Elf32(elf) = elf else {
        log::warn!("rejecting 64-bit image");
        return Err(Errno::EINVAL);
    };

    let flags = VmFlags::READ | VmFlags::WRITE | VmFlags::EXEC | VmFlags::USER;

    for phdr in elf.program_header_iter() {
        if phdr.ph_type() != ProgramType::LOAD || phdr.memsz() == 0 {
            continue;
        }

        let vaddr = phdr.vaddr() as usize;
        let memsz = phdr.memsz() as usize;
        let filesz = phdr.filesz() as usize;
        let offset = phdr.offset() as usize;

        if filesz > memsz {
            return Err(Errno::EINVAL);
        }

        let file_end = offset.checked_add(filesz).ok_or(Errno::EINVAL)?;
        if file_end > image.len() {
            log::error!(
                "segment at {:#x}: file range {:#x}..{:#x} outside image of {:#x} bytes",
                vaddr,
                offset,
                file_end,
                image.len()
            );
            return Err(Errno::EINVAL);
        }

        vm.alloc_region(vaddr, memsz, flags)?;
        vm.copy_out(vaddr, &image[offset..file_end])?;

        log::debug!(
            "segment {:#x}: memsz {:#x} filesz {:#x}",
            vaddr,
            memsz,
            filesz
        );
    }

    // The user stack sits at a fixed top-of-user-space address.
    vm.alloc_region(
        (USTACK_TOP - USTACK_SIZE) as usize,
        USTACK_SIZE as usize,
        VmFlags::READ | VmFlags::WRITE | VmFlags::USER,
    )?;

    // Enter at the image entry point with argc/argv/envp all zero.
    *tf = TrapFrame::user_entry(elf.elf_header().entry_point() as usize, USTACK_TOP as usize);

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    /// Assemble a minimal ELF32 ARM executable with one PT_LOAD segment.
    pub(crate) fn sample_elf(entry: u32, vaddr: u32, payload: &[u8], memsz: u32) -> Vec<u8> {
        let mut image = vec![0u8; 0x54 + payload.len()];

        // e_ident
        image[0..4].copy_from_slice(b"\x7fELF");
        image[4] = 1; // ELFCLASS32
        image[5] = 1; // little endian
        image[6] = 1; // EV_CURRENT

        let half = |v: u16| v.to_le_bytes();
        let word = |v: u32| v.to_le_bytes();

        image[16..18].copy_from_slice(&half(2)); // ET_EXEC
        image[18..20].copy_from_slice(&half(40)); // EM_ARM
        image[20..24].copy_from_slice(&word(1)); // version
        image[24..28].copy_from_slice(&word(entry));
        image[28..32].copy_from_slice(&word(0x34)); // phoff
        image[32..36].copy_from_slice(&word(0)); // shoff
        image[40..42].copy_from_slice(&half(0x34)); // ehsize
        image[42..44].copy_from_slice(&half(0x20)); // phentsize
        image[44..46].copy_from_slice(&half(1)); // phnum
        image[46..48].copy_from_slice(&half(0x28)); // shentsize

        // Program header at 0x34: PT_LOAD
        let ph = 0x34;
        image[ph..ph + 4].copy_from_slice(&word(1)); // PT_LOAD
        image[ph + 4..ph + 8].copy_from_slice(&word(0x54)); // offset
        image[ph + 8..ph + 12].copy_from_slice(&word(vaddr));
        image[ph + 12..ph + 16].copy_from_slice(&word(vaddr)); // paddr
        image[ph + 16..ph + 20].copy_from_slice(&word(payload.len() as u32));
        image[ph + 20..ph + 24].copy_from_slice(&word(memsz));
        image[ph + 24..ph + 28].copy_from_slice(&word(7)); // RWX
        image[ph + 28..ph + 32].copy_from_slice(&word(4)); // align

        image[0x54..].copy_from_slice(payload);
        image
    }

    fn fresh() -> (VmSpace, TrapFrame) {
        (VmSpace::create().unwrap(), TrapFrame::user_entry(0, 0))
    }

    #[test]
    fn test_load_copies_segment_and_zero_fills() {
        let (mut vm, mut tf) = fresh();
        let image = sample_elf(0x1_0040, 0x1_0000, b"codebytes", 0x40);

        load_binary(&mut vm, &mut tf, &image).unwrap();

        let mut seg = [0u8; 16];
        vm.copy_in(0x1_0000, &mut seg).unwrap();
        assert_eq!(&seg[..9], b"codebytes");
        // memsz tail beyond filesz stays zero.
        assert!(seg[9..].iter().all(|b| *b == 0));

        assert_eq!(tf.pc, 0x1_0040);
        assert_eq!(tf.sp, USTACK_TOP as usize);
        assert_eq!(tf.r[0], 0);
    }

    #[test]
    fn test_user_stack_is_reserved() {
        let (mut vm, mut tf) = fresh();
        let image = sample_elf(0x1_0000, 0x1_0000, b"x", 4);
        load_binary(&mut vm, &mut tf, &image).unwrap();

        // The page just below USTACK_TOP is writable.
        vm.copy_out(USTACK_TOP as usize - 8, b"stackok!").unwrap();
        let mut back = [0u8; 8];
        vm.copy_in(USTACK_TOP as usize - 8, &mut back).unwrap();
        assert_eq!(&back, b"stackok!");
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let (mut vm, mut tf) = fresh();
        let mut image = sample_elf(0x1_0000, 0x1_0000, b"x", 4);
        image[0] = 0x7e;
        assert_eq!(load_binary(&mut vm, &mut tf, &image), Err(Errno::EINVAL));
    }

    #[test]
    fn test_filesz_beyond_memsz_is_rejected() {
        let (mut vm, mut tf) = fresh();
        // filesz 9 > memsz 4.
        let image = sample_elf(0x1_0000, 0x1_0000, b"codebytes", 4);
        assert_eq!(load_binary(&mut vm, &mut tf, &image), Err(Errno::EINVAL));
    }

    #[test]
    fn test_truncated_image_is_rejected() {
        let (mut vm, mut tf) = fresh();
        let mut image = sample_elf(0x1_0000, 0x1_0000, b"codebytes", 0x40);
        image.truncate(image.len() - 4);
        assert_eq!(load_binary(&mut vm, &mut tf, &image), Err(Errno::EINVAL));
    }
}
