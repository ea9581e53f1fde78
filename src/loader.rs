use std::ffi::CString;
use std::fs::{self, File};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use goblin::elf::Elf;
use goblin::elf::header::{EM_X86_64, ET_DYN, ET_EXEC};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use log::{debug, info};

use crate::error::{Error, Result};
use crate::memory::{MemoryMap, Prot};

/// Flat binaries are mapped at this guest address, which is also their
/// entry point.
pub const FLAT_LOAD_ADDR: u64 = 0x40_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutableFormat {
    Flat,
    Elf64,
    /// Try ELF64 first, fall back to flat.
    Auto,
}

/// Result of a successful load: the regions backing the executable and the
/// guest address execution starts at.
#[derive(Debug)]
pub struct LoadedImage {
    pub memory: MemoryMap,
    pub entry: u64,
}

/// The calling process must be able to read and execute the file.
pub fn check_access(path: &Path) -> Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument(format!("{}: path contains NUL", path.display())))?;
    // SAFETY: cpath is a valid NUL-terminated string.
    let res = unsafe { libc::access(cpath.as_ptr(), libc::R_OK | libc::X_OK) };
    if res != 0 {
        return Err(Error::InvalidArgument(format!(
            "{}: no read + execute access",
            path.display()
        )));
    }
    Ok(())
}

pub fn load(path: &Path, format: ExecutableFormat) -> Result<LoadedImage> {
    match format {
        ExecutableFormat::Flat => load_flat(path),
        ExecutableFormat::Elf64 => load_elf64(path),
        // Each attempt owns its memory map, so a failed ELF attempt drops
        // every region it mapped before the flat fallback starts.
        ExecutableFormat::Auto => load_elf64(path).or_else(|_| load_flat(path)),
    }
}

/// Map the file itself into the guest as a single read-execute region.
fn load_flat(path: &Path) -> Result<LoadedImage> {
    let size = fs::metadata(path)?.len();
    if size == 0 {
        return Err(Error::InvalidArgument(format!(
            "{}: empty flat binary",
            path.display()
        )));
    }

    let file = File::open(path)?;
    let mut memory = MemoryMap::new();
    memory.map(FLAT_LOAD_ADDR, size, Some((file, 0)), Prot::READ | Prot::EXEC)?;

    info!(
        "loaded flat binary {} ({size} bytes) at {FLAT_LOAD_ADDR:#x}",
        path.display()
    );
    Ok(LoadedImage {
        memory,
        entry: FLAT_LOAD_ADDR,
    })
}

fn prot_from_phdr(p_flags: u32) -> Prot {
    let mut prot = Prot::empty();
    if p_flags & PF_R != 0 {
        prot |= Prot::READ;
    }
    if p_flags & PF_W != 0 {
        prot |= Prot::WRITE;
    }
    if p_flags & PF_X != 0 {
        prot |= Prot::EXEC;
    }
    prot
}

fn short_read(path: &Path, vaddr: u64) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!(
            "{}: load segment at {vaddr:#x} extends past end of file",
            path.display()
        ),
    ))
}

/// Create one anonymous region per LOAD segment and copy the
/// file-initialized bytes into it; the [p_filesz, p_memsz) tail stays
/// zero (BSS).
fn load_elf64(path: &Path) -> Result<LoadedImage> {
    let data = fs::read(path)?;
    let elf = Elf::parse(&data)?;

    if !elf.is_64 {
        return Err(Error::Unsupported(format!(
            "{}: only ELF64 images can be loaded",
            path.display()
        )));
    }
    if elf.header.e_machine != EM_X86_64 {
        return Err(Error::Unsupported(format!(
            "{}: unsupported machine {:#x}",
            path.display(),
            elf.header.e_machine
        )));
    }
    if elf.header.e_type != ET_EXEC && elf.header.e_type != ET_DYN {
        return Err(Error::Unsupported(format!(
            "{}: unsupported elf type {:#x}",
            path.display(),
            elf.header.e_type
        )));
    }

    let mut memory = MemoryMap::new();
    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }
        if ph.p_filesz > ph.p_memsz {
            return Err(Error::InvalidArgument(format!(
                "{}: load segment at {:#x} has p_filesz > p_memsz",
                path.display(),
                ph.p_vaddr
            )));
        }

        let prot = prot_from_phdr(ph.p_flags);
        let index = memory.map(ph.p_vaddr, ph.p_memsz, None, prot)?;

        let start = ph.p_offset as usize;
        let end = start
            .checked_add(ph.p_filesz as usize)
            .ok_or_else(|| short_read(path, ph.p_vaddr))?;
        if end > data.len() {
            return Err(short_read(path, ph.p_vaddr));
        }
        memory.region(index).write_slice(&data[start..end], 0)?;

        debug!(
            "segment at {:#x}: filesz {:#x}, memsz {:#x}, prot {prot:?}",
            ph.p_vaddr, ph.p_filesz, ph.p_memsz
        );
    }

    info!(
        "loaded elf64 {} ({} regions), entry {:#x}",
        path.display(),
        memory.len(),
        elf.entry
    );
    Ok(LoadedImage {
        memory,
        entry: elf.entry,
    })
}
