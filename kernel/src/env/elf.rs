//! ELF32 loading
//!
//! Minimal statically-linked ELF support: header validation and PT_LOAD
//! program headers, nothing else. Each loadable segment becomes a
//! binary-backed region; frames are populated eagerly, file bytes copied and
//! the BSS tail left zeroed.

use alloc::vec::Vec;

use super::{EnvId, EnvStatus, EnvTable, EnvType};
use crate::error::{KernelError, Result};
use crate::mm::frame::{AllocFlags, FrameTable};
use crate::mm::page::{PageDir, PteFlags};
use crate::mm::vma::{VmaPerm, VmaType};
use crate::mm::{page_round_down, page_round_up, VirtAddr, PGSIZE, USTACKTOP, UTEMP, UTOP};

const ELF_MAGIC: u32 = 0x464C_457F;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// One loadable segment.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub va: u32,
    pub memsz: u32,
    pub filesz: u32,
    pub offset: u32,
    pub flags: u32,
}

impl Segment {
    pub fn perm(&self) -> VmaPerm {
        let mut p = VmaPerm::empty();
        if self.flags & PF_R != 0 {
            p |= VmaPerm::READ;
        }
        if self.flags & PF_W != 0 {
            p |= VmaPerm::WRITE;
        }
        if self.flags & PF_X != 0 {
            p |= VmaPerm::EXEC;
        }
        p
    }
}

/// Parsed image: entry point plus loadable segments.
#[derive(Debug)]
pub struct ElfImage {
    pub entry: u32,
    pub segments: Vec<Segment>,
}

fn read_u16(b: &[u8], off: usize) -> Result<u16> {
    let raw: [u8; 2] = b
        .get(off..off + 2)
        .and_then(|s| s.try_into().ok())
        .ok_or(KernelError::BadElf)?;
    Ok(u16::from_le_bytes(raw))
}

fn read_u32(b: &[u8], off: usize) -> Result<u32> {
    let raw: [u8; 4] = b
        .get(off..off + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or(KernelError::BadElf)?;
    Ok(u32::from_le_bytes(raw))
}

/// Validate the header and collect PT_LOAD entries.
pub fn parse(binary: &[u8]) -> Result<ElfImage> {
    if read_u32(binary, 0)? != ELF_MAGIC {
        return Err(KernelError::BadElf);
    }
    let entry = read_u32(binary, 24)?;
    let phoff = read_u32(binary, 28)? as usize;
    let phentsize = read_u16(binary, 42)? as usize;
    let phnum = read_u16(binary, 44)? as usize;
    if phentsize < 32 {
        return Err(KernelError::BadElf);
    }

    let mut segments = Vec::new();
    for i in 0..phnum {
        let ph = phoff + i * phentsize;
        if read_u32(binary, ph)? != PT_LOAD {
            continue;
        }
        let seg = Segment {
            offset: read_u32(binary, ph + 4)?,
            va: read_u32(binary, ph + 8)?,
            filesz: read_u32(binary, ph + 16)?,
            memsz: read_u32(binary, ph + 20)?,
            flags: read_u32(binary, ph + 24)?,
        };
        if seg.filesz > seg.memsz
            || seg.offset as usize + seg.filesz as usize > binary.len()
            || seg.va.checked_add(seg.memsz).map_or(true, |end| end > UTOP)
        {
            return Err(KernelError::BadElf);
        }
        segments.push(seg);
    }
    Ok(ElfImage { entry, segments })
}

/// Allocate an environment and load `binary` into it.
///
/// Declares a binary-backed region per PT_LOAD segment, maps fresh zeroed
/// frames over the whole memory image, copies the file bytes, adds the
/// scratch and stack regions the first user binaries expect, and commits
/// the environment runnable.
pub fn create(
    ft: &FrameTable,
    envs: &EnvTable,
    template: &PageDir,
    binary: &'static [u8],
    ty: EnvType,
) -> Result<usize> {
    let image = parse(binary)?;
    let slot = envs.alloc(ft, template, EnvId::NONE, ty)?;

    let result = (|| -> Result<()> {
        let env = envs.get(slot);
        let mut body = env.body();
        let dir = body.pgdir.expect("fresh env has a directory");
        let vmas = body.vmas.as_mut().expect("fresh env has a region list");

        for seg in &image.segments {
            if seg.memsz == 0 {
                continue;
            }
            let idx = vmas.new_region(
                VirtAddr::new(seg.va),
                seg.memsz,
                seg.perm(),
                VmaType::Binary,
            )?;
            if seg.filesz > 0 {
                let file = &binary[seg.offset as usize..(seg.offset + seg.filesz) as usize];
                vmas.set_backing(idx, file)?;
            }

            // Populate eagerly: zeroed frames over the full image, file
            // bytes copied on top, which leaves the BSS tail zero.
            let start = page_round_down(seg.va);
            let end = page_round_up(seg.va + seg.memsz);
            let mut flags = PteFlags::USER;
            if seg.perm().contains(VmaPerm::WRITE) {
                flags |= PteFlags::WRITABLE;
            }
            let mut page = start;
            while page < end {
                let frame = ft.alloc(AllocFlags::ZERO).ok_or(KernelError::OutOfMemory)?;
                dir.insert(ft, frame, VirtAddr::new(page), flags)?;
                ft.set_swappable(frame, true);

                // Overlap of [page, page+PGSIZE) with the file image.
                let fstart = page.max(seg.va);
                let fend = (page + PGSIZE as u32).min(seg.va + seg.filesz);
                if fstart < fend {
                    let src = (seg.offset + (fstart - seg.va)) as usize;
                    ft.write_bytes(
                        frame,
                        (fstart - page) as usize,
                        &binary[src..src + (fend - fstart) as usize],
                    );
                }
                page += PGSIZE as u32;
            }
        }

        // Scratch regions the first test binaries rely on, then the stack.
        vmas.new_region(VirtAddr::new(UTEMP), PGSIZE as u32, VmaPerm::READ, VmaType::Anon)?;
        vmas.new_region(
            VirtAddr::new(UTEMP + PGSIZE as u32),
            PGSIZE as u32,
            VmaPerm::READ | VmaPerm::WRITE,
            VmaType::Anon,
        )?;
        vmas.new_region(
            VirtAddr::new(USTACKTOP - PGSIZE as u32),
            PGSIZE as u32,
            VmaPerm::READ | VmaPerm::WRITE,
            VmaType::Anon,
        )?;

        body.tf.eip = image.entry;
        Ok(())
    })();

    match result {
        Ok(()) => {
            let committed = envs
                .get(slot)
                .status
                .transition(EnvStatus::NotRunnable, EnvStatus::Runnable);
            assert!(committed, "freshly loaded env must commit runnable");
            Ok(slot)
        }
        Err(e) => {
            envs.free(ft, None, slot);
            Err(e)
        }
    }
}
