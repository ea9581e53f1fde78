use std::fs::File;

use bitflags::bitflags;
use vm_memory::{Bytes, FileOffset, MmapRegion, VolatileMemory};

use crate::error::{Error, Result};

pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// The guest physical address space is capped at 1 GiB.
pub const GUEST_MEMORY_SIZE: u64 = 1 << 30;

bitflags! {
    /// Guest-side protection of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ = 1;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// A contiguous range of guest physical frames backed by one host mapping.
#[derive(Debug)]
pub struct Region {
    mapping: MmapRegion<()>,
    first_gfn: u64,
    last_gfn: u64,
    prot: Prot,
}

impl Region {
    pub fn first_gfn(&self) -> u64 {
        self.first_gfn
    }

    pub fn last_gfn(&self) -> u64 {
        self.last_gfn
    }

    /// Guest physical base address.
    pub fn gpa(&self) -> u64 {
        self.first_gfn << PAGE_SHIFT
    }

    pub fn size(&self) -> u64 {
        (self.last_gfn - self.first_gfn + 1) * PAGE_SIZE
    }

    pub fn prot(&self) -> Prot {
        self.prot
    }

    /// Host virtual base of the mapping.
    pub fn host_base(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    pub fn write_slice(&self, data: &[u8], offset: u64) -> Result<()> {
        self.mapping
            .as_volatile_slice()
            .write_slice(data, offset as usize)?;
        Ok(())
    }

    pub fn read_slice(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.mapping
            .as_volatile_slice()
            .read_slice(buf, offset as usize)?;
        Ok(())
    }

    pub fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.write_slice(&value.to_le_bytes(), offset)
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_slice(&mut buf, offset)?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// Ordered set of non-overlapping guest physical regions.
///
/// Dropping the map releases every host mapping it owns.
#[derive(Default, Debug)]
pub struct MemoryMap {
    regions: Vec<Region>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `size` bytes of host memory at guest physical address `gpa` and
    /// return the index of the inserted region.
    ///
    /// `size` is rounded up to a whole page. Anonymous mappings (`file` is
    /// `None`) are zero-filled and host-writable. File-backed mappings are
    /// shared read-only on the host and must not request [`Prot::WRITE`];
    /// the `File` handle is owned by the mapping and released with it.
    pub fn map(
        &mut self,
        gpa: u64,
        size: u64,
        file: Option<(File, u64)>,
        prot: Prot,
    ) -> Result<usize> {
        if gpa % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "guest address {gpa:#x} is not page-aligned"
            )));
        }
        if size == 0 {
            return Err(Error::InvalidArgument("zero-size mapping".into()));
        }
        let size = size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or_else(|| Error::InvalidArgument(format!("mapping size {size:#x} overflows")))?;
        let end = gpa
            .checked_add(size)
            .ok_or_else(|| Error::InvalidArgument(format!("mapping at {gpa:#x} overflows")))?;
        if end > GUEST_MEMORY_SIZE {
            return Err(Error::InvalidArgument(format!(
                "mapping [{gpa:#x}, {end:#x}) is outside the {GUEST_MEMORY_SIZE:#x} guest window"
            )));
        }
        if file.is_some() && prot.contains(Prot::WRITE) {
            return Err(Error::InvalidArgument(
                "file-backed regions cannot be writable".into(),
            ));
        }

        let first_gfn = gpa >> PAGE_SHIFT;
        let last_gfn = (end >> PAGE_SHIFT) - 1;

        // Regions are kept sorted by first frame; reject any overlap with
        // the neighbors of the insertion point.
        let index = match self
            .regions
            .binary_search_by_key(&first_gfn, |r| r.first_gfn)
        {
            Ok(_) => {
                return Err(Error::InvalidArgument(format!(
                    "region at {gpa:#x} overlaps an existing region"
                )));
            }
            Err(index) => index,
        };
        let clear_below = index == 0 || self.regions[index - 1].last_gfn < first_gfn;
        let clear_above = index == self.regions.len() || self.regions[index].first_gfn > last_gfn;
        if !clear_below || !clear_above {
            return Err(Error::InvalidArgument(format!(
                "region at {gpa:#x} overlaps an existing region"
            )));
        }

        let mapping = match file {
            Some((file, offset)) => {
                let mut host_prot = libc::PROT_READ;
                if prot.contains(Prot::EXEC) {
                    host_prot |= libc::PROT_EXEC;
                }
                MmapRegion::build(
                    Some(FileOffset::new(file, offset)),
                    size as usize,
                    host_prot,
                    libc::MAP_SHARED | libc::MAP_NORESERVE,
                )?
            }
            None => MmapRegion::build(
                None,
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            )?,
        };

        self.regions.insert(
            index,
            Region {
                mapping,
                first_gfn,
                last_gfn,
                prot,
            },
        );
        Ok(index)
    }

    pub fn region(&self, index: usize) -> &Region {
        &self.regions[index]
    }

    /// Regions in ascending guest physical order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
