//! Multi-architecture slice container
//!
//! Artifacts are stored either as a single untagged slice (the legacy
//! single-architecture form) or as a tagged container: a big-endian header
//! `{ magic, count }` followed by `count` table entries of
//! `{ cputype, cpusubtype, offset, size, align }` and the slice bodies.
//!
//! # Security Model
//!
//! Containers are read from removable and external volumes, so every table
//! entry is bounds-checked against the input at [`Container::open`]. After a
//! successful open, every [`Slice`] produced by the container is guaranteed to
//! lie within the input buffer.

pub mod arch;

pub use arch::{best_match, ArchId};

use std::ops::Range;
use thiserror::Error;

/// Magic marker of the tagged form
pub const FAT_MAGIC: u32 = 0xcafe_babe;
/// Thin Mach-O magics (32/64-bit, both byte orders)
const MH_MAGIC: u32 = 0xfeed_face;
const MH_CIGAM: u32 = 0xcefa_edfe;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM_64: u32 = 0xcffa_edfe;

const HEADER_SIZE: usize = 8;
const ENTRY_SIZE: usize = 20;

/// Errors from container parsing and writing
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContainerError {
    #[error("tagged header truncated ({len} bytes)")]
    TooShort { len: usize },

    #[error("slice table for {count} slices needs {needed} bytes, input has {len}")]
    TruncatedTable { count: u32, needed: u64, len: usize },

    #[error("slice {index} ({arch}) spans {start}..{end}, input has {len} bytes")]
    SliceOutOfBounds {
        index: u32,
        arch: String,
        start: u64,
        end: u64,
        len: usize,
    },

    #[error("no slices to write")]
    NoSlices,

    #[error("container of {0} bytes exceeds 32-bit offsets")]
    TooLarge(u64),
}

/// Form of a parsed container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Header plus slice table
    Tagged,
    /// One slice covering the whole input
    Untagged,
}

/// One architecture's slice within a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    /// Architecture, when known (an untagged non-Mach-O slice has none)
    pub arch: Option<ArchId>,
    pub offset: u64,
    pub size: u64,
    /// Alignment as a power of two
    pub align: u32,
}

impl Slice {
    /// Byte range of this slice within the container input
    pub fn range(&self) -> Range<usize> {
        // validated against the input length at open
        self.offset as usize..(self.offset + self.size) as usize
    }
}

/// A validated view over container bytes
#[derive(Debug, Clone)]
pub struct Container<'a> {
    data: &'a [u8],
    kind: ContainerKind,
    count: u32,
}

impl<'a> Container<'a> {
    /// Parse and validate container bytes
    pub fn open(data: &'a [u8]) -> Result<Self, ContainerError> {
        // anything without the tagged magic, even empty input, is one untagged slice
        if read_u32_be(data, 0) != Some(FAT_MAGIC) {
            return Ok(Self {
                data,
                kind: ContainerKind::Untagged,
                count: 1,
            });
        }

        let count = read_u32_be(data, 4).ok_or(ContainerError::TooShort { len: data.len() })?;
        let needed = HEADER_SIZE as u64 + u64::from(count) * ENTRY_SIZE as u64;
        if needed > data.len() as u64 {
            return Err(ContainerError::TruncatedTable {
                count,
                needed,
                len: data.len(),
            });
        }

        let container = Self {
            data,
            kind: ContainerKind::Tagged,
            count,
        };
        for index in 0..count {
            let entry = container.entry(index);
            let end = entry.offset + entry.size;
            if end > data.len() as u64 {
                return Err(ContainerError::SliceOutOfBounds {
                    index,
                    arch: entry
                        .arch
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    start: entry.offset,
                    end,
                    len: data.len(),
                });
            }
        }

        Ok(container)
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    /// Number of slices
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterate slices in table order; each call starts from the beginning
    pub fn slices(&self) -> Slices<'_, 'a> {
        Slices {
            container: self,
            next: 0,
        }
    }

    /// Bytes of one slice
    pub fn slice_bytes(&self, slice: &Slice) -> &'a [u8] {
        &self.data[slice.range()]
    }

    /// Best slice for `want`: exact match first, then the family ranking
    pub fn find_best_match(&self, want: &ArchId) -> Option<Slice> {
        let slices: Vec<Slice> = self.slices().collect();
        let index = best_match(slices.iter().filter_map(|s| s.arch), want)?;
        // best_match indexes the arch-bearing subset
        slices.into_iter().filter(|s| s.arch.is_some()).nth(index)
    }

    fn entry(&self, index: u32) -> Slice {
        match self.kind {
            ContainerKind::Untagged => Slice {
                arch: thin_arch(self.data),
                offset: 0,
                size: self.data.len() as u64,
                align: 0,
            },
            ContainerKind::Tagged => {
                let base = HEADER_SIZE + index as usize * ENTRY_SIZE;
                let field = |n: usize| read_u32_be(self.data, base + n * 4).unwrap_or(0);
                Slice {
                    arch: Some(ArchId::new(field(0) as i32, field(1) as i32)),
                    offset: u64::from(field(2)),
                    size: u64::from(field(3)),
                    align: field(4),
                }
            }
        }
    }
}

/// Lazy iterator over a container's slices
pub struct Slices<'c, 'a> {
    container: &'c Container<'a>,
    next: u32,
}

impl Iterator for Slices<'_, '_> {
    type Item = Slice;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.container.count {
            return None;
        }
        let slice = self.container.entry(self.next);
        self.next += 1;
        Some(slice)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.container.count - self.next) as usize;
        (left, Some(left))
    }
}

/// Serialize slices; a single slice is written untagged
pub fn write<B: AsRef<[u8]>>(slices: &[(ArchId, B)]) -> Result<Vec<u8>, ContainerError> {
    write_aligned(slices, 0)
}

/// Serialize slices, padding each tagged slice to `1 << align_log2`
pub fn write_aligned<B: AsRef<[u8]>>(
    slices: &[(ArchId, B)],
    align_log2: u32,
) -> Result<Vec<u8>, ContainerError> {
    match slices {
        [] => Err(ContainerError::NoSlices),
        [(_, only)] => Ok(only.as_ref().to_vec()),
        _ => {
            let align = 1u64 << align_log2.min(31);
            let table_end = (HEADER_SIZE + slices.len() * ENTRY_SIZE) as u64;

            let mut placements = Vec::with_capacity(slices.len());
            let mut cursor = table_end;
            for (arch, body) in slices {
                let offset = cursor.next_multiple_of(align);
                let size = body.as_ref().len() as u64;
                cursor = offset + size;
                if cursor > u64::from(u32::MAX) {
                    return Err(ContainerError::TooLarge(cursor));
                }
                placements.push((*arch, offset, size));
            }

            let mut out = Vec::with_capacity(cursor as usize);
            out.extend_from_slice(&FAT_MAGIC.to_be_bytes());
            out.extend_from_slice(&(slices.len() as u32).to_be_bytes());
            for &(arch, offset, size) in &placements {
                out.extend_from_slice(&arch.cputype.to_be_bytes());
                out.extend_from_slice(&arch.cpusubtype.to_be_bytes());
                out.extend_from_slice(&(offset as u32).to_be_bytes());
                out.extend_from_slice(&(size as u32).to_be_bytes());
                out.extend_from_slice(&align_log2.to_be_bytes());
            }
            for ((_, body), &(_, offset, _)) in slices.iter().zip(&placements) {
                out.resize(offset as usize, 0);
                out.extend_from_slice(body.as_ref());
            }
            Ok(out)
        }
    }
}

fn read_u32_be(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at.checked_add(4)?)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

/// Architecture of a thin Mach-O image, if the data is one
fn thin_arch(data: &[u8]) -> Option<ArchId> {
    let magic = read_u32_be(data, 0)?;
    let swapped = match magic {
        MH_MAGIC | MH_MAGIC_64 => false,
        MH_CIGAM | MH_CIGAM_64 => true,
        _ => return None,
    };
    let read = |at: usize| {
        let v = read_u32_be(data, at)?;
        Some(if swapped { v.swap_bytes() } else { v } as i32)
    };
    Some(ArchId::new(read(4)?, read(8)?))
}
