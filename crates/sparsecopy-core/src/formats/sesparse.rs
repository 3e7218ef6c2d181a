//! VMware SESparse extents.
//!
//! SESparse keeps a grain directory of 64-bit entries, each pointing at a
//! grain table of 4096 tagged 64-bit grain entries. The top nibble of a grain
//! entry says whether the grain is unallocated, reads as zeros, or is stored
//! in the grain area; for stored grains the grain number is split across two
//! bit ranges of the entry.

use tracing::{debug, info};

use crate::bounds::{le_u32, le_u64, scaled, slice_at};
use crate::error::{Error, Result};
use crate::extent::{ChunkKind, Descriptor};

use super::{check_capacity, expect_field, DiskInfo, Format, SparseImage, SECTOR_SIZE};

/// SESparse constant header magic.
pub const MAGIC: u64 = 0xCAFE_BABE;

/// SESparse volatile header magic.
pub const VOLATILE_MAGIC: u64 = 0xCAFE_CAFE;

/// Grain size in bytes (8 sectors).
pub const GRAIN_SIZE: u64 = 8 * SECTOR_SIZE;

/// Grain table size in bytes (64 sectors).
pub const TABLE_SIZE: u64 = 64 * SECTOR_SIZE;

/// Entries per grain table.
pub const ENTRIES_PER_TABLE: u64 = TABLE_SIZE / 8;

/// Virtual bytes covered by one grain directory entry.
pub const DIR_ENTRY_SPAN: u64 = ENTRIES_PER_TABLE * GRAIN_SIZE;

const HEADER_SIZE: u64 = 512;
const VOLATILE_HEADER_OFFSET: u64 = 512;
const VERSION_UPPER: u32 = 1;
const VERSION_LOWER: u32 = 2;

/// Allocated directory entries carry this tag in their upper 32 bits.
const DIR_ENTRY_ALLOCATED: u64 = 0x1000_0000;

const GRAIN_UNALLOCATED: u64 = 0;
const GRAIN_UNMAPPED: u64 = 1;
const GRAIN_ZERO: u64 = 2;
const GRAIN_ALLOCATED: u64 = 3;

/// Reassembles the grain number of an allocated grain table entry.
///
/// Bits 59..48 hold the low 12 bits of the grain number and bits 47..0 the
/// rest.
pub fn grain_number(entry: u64) -> u64 {
    ((entry & 0x0FFF_0000_0000_0000) >> 48) | ((entry & 0x0000_FFFF_FFFF_FFFF) << 12)
}

#[derive(Debug, Clone)]
struct SeSparseHeader {
    /// Virtual capacity in bytes.
    capacity: u64,
    grain_dir_offset: u64,
    grain_dir_size: u64,
    grain_tables_offset: u64,
    grains_offset: u64,
}

impl SeSparseHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        let raw = slice_at(data, 0, HEADER_SIZE, 0)
            .map_err(|_| Error::format("image too small for an SESparse header"))?;

        let magic = le_u64(raw, 0);
        if magic != MAGIC {
            return Err(Error::format(format!(
                "invalid SESparse magic: expected {MAGIC:#x}, got {magic:#x}"
            )));
        }

        let upper = le_u32(raw, 8);
        let lower = le_u32(raw, 12);
        if upper != VERSION_UPPER || lower != VERSION_LOWER {
            return Err(Error::unsupported(format!(
                "SESparse version {upper}.{lower}"
            )));
        }

        // Every layout field is fixed for the supported version; anything
        // else is a variant we do not understand.
        expect_field("grain_size", le_u64(raw, 24), 8)?;
        expect_field("grain_table_size", le_u64(raw, 32), 64)?;
        expect_field("flags", le_u64(raw, 40), 0)?;
        expect_field("reserved1", le_u64(raw, 48), 0)?;
        expect_field("reserved2", le_u64(raw, 56), 0)?;
        expect_field("reserved3", le_u64(raw, 64), 0)?;
        expect_field("reserved4", le_u64(raw, 72), 0)?;
        expect_field("volatile_header_offset", le_u64(raw, 80), 1)?;
        expect_field("volatile_header_size", le_u64(raw, 88), 1)?;
        expect_field("journal_header_offset", le_u64(raw, 96), 2)?;
        expect_field("journal_header_size", le_u64(raw, 104), 2)?;
        expect_field("journal_offset", le_u64(raw, 112), 2048)?;
        expect_field("journal_size", le_u64(raw, 120), 2048)?;
        expect_field("grain_dir_offset", le_u64(raw, 128), 4096)?;

        let sectors = le_u64(raw, 16);
        let capacity = sectors.checked_mul(SECTOR_SIZE).ok_or_else(|| {
            Error::format(format!("SESparse capacity of {sectors} sectors overflows"))
        })?;

        Ok(Self {
            capacity,
            grain_dir_offset: le_u64(raw, 128),
            grain_dir_size: le_u64(raw, 136),
            grain_tables_offset: le_u64(raw, 144),
            grains_offset: le_u64(raw, 192),
        })
    }
}

fn check_volatile_header(data: &[u8]) -> Result<()> {
    let raw = slice_at(data, VOLATILE_HEADER_OFFSET, 512, 0)
        .map_err(|_| Error::format("image too small for an SESparse volatile header"))?;

    let magic = le_u64(raw, 0);
    if magic != VOLATILE_MAGIC {
        return Err(Error::format(format!(
            "invalid SESparse volatile header magic {magic:#x}"
        )));
    }
    if le_u64(raw, 24) != 0 {
        return Err(Error::unsupported("SESparse journal replay"));
    }
    Ok(())
}

/// A validated SESparse image.
pub struct SeSparseImage<'a> {
    data: &'a [u8],
    header: SeSparseHeader,
    directory: &'a [u8],
}

impl<'a> SeSparseImage<'a> {
    /// Validates both headers and locates the grain directory.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = SeSparseHeader::parse(data)?;
        check_volatile_header(data)?;

        let image_len = data.len() as u64;
        let dir_offset = scaled(header.grain_dir_offset, SECTOR_SIZE, 0, image_len)?;
        let dir_len = scaled(header.grain_dir_size, SECTOR_SIZE, 0, image_len)?;
        let directory = slice_at(data, dir_offset, dir_len, 0)?;

        info!(
            capacity = header.capacity,
            directory_entries = dir_len / 8,
            "SESparse header"
        );

        Ok(Self {
            data,
            header,
            directory,
        })
    }

    fn directory_len(&self) -> u64 {
        self.directory.len() as u64 / 8
    }

    fn table(&self, dir_index: u64) -> Result<Option<&'a [u8]>> {
        let entry = le_u64(self.directory, (dir_index * 8) as usize);
        if entry == 0 {
            return Ok(None);
        }
        if entry >> 32 != DIR_ENTRY_ALLOCATED {
            return Err(Error::format(format!(
                "grain directory entry {dir_index} has unknown type {entry:#x}"
            )));
        }
        debug!("dir[{}] = {:x}", dir_index, entry);

        let image_len = self.data.len() as u64;
        let table_number = entry & 0xFFFF_FFFF;
        let base = scaled(self.header.grain_tables_offset, SECTOR_SIZE, dir_index, image_len)?;
        let offset = scaled(table_number, TABLE_SIZE, dir_index, image_len)?
            .checked_add(base)
            .ok_or_else(|| Error::out_of_bounds(dir_index, base, TABLE_SIZE, image_len))?;
        slice_at(self.data, offset, TABLE_SIZE, dir_index).map(Some)
    }

    fn classify(&self, index: u64, entry: u64) -> Result<ChunkKind> {
        match entry >> 60 {
            GRAIN_UNALLOCATED => Ok(ChunkKind::Skip),
            GRAIN_UNMAPPED | GRAIN_ZERO => Ok(ChunkKind::ZeroFill),
            GRAIN_ALLOCATED => {
                let image_len = self.data.len() as u64;
                let base = scaled(self.header.grains_offset, SECTOR_SIZE, index, image_len)?;
                let offset = scaled(grain_number(entry), GRAIN_SIZE, index, image_len)?
                    .checked_add(base)
                    .ok_or_else(|| Error::out_of_bounds(index, base, GRAIN_SIZE, image_len))?;
                Ok(ChunkKind::Present { offset })
            }
            tag => Err(Error::format(format!(
                "grain table entry {index} has unknown grain type {tag:#x}"
            ))),
        }
    }
}

impl SparseImage for SeSparseImage<'_> {
    fn format(&self) -> Format {
        Format::SeSparse
    }

    fn virtual_size(&self) -> u64 {
        self.header.capacity
    }

    fn chunk_size(&self) -> u64 {
        GRAIN_SIZE
    }

    fn data(&self) -> &[u8] {
        self.data
    }

    fn info(&self) -> DiskInfo {
        DiskInfo {
            format: Format::SeSparse,
            virtual_size: self.virtual_size(),
            disk_id: None,
            name: None,
            parent: None,
        }
    }

    fn descriptors(&self) -> super::Descriptors<'_> {
        Box::new(GrainWalk {
            image: self,
            dir_index: 0,
            table: None,
            table_index: 0,
            done: false,
        })
    }
}

struct GrainWalk<'i, 'a> {
    image: &'i SeSparseImage<'a>,
    dir_index: u64,
    table: Option<&'a [u8]>,
    table_index: u64,
    done: bool,
}

impl GrainWalk<'_, '_> {
    fn next_descriptor(&mut self) -> Result<Option<Descriptor>> {
        loop {
            let Some(table) = self.table else {
                if self.dir_index >= self.image.directory_len() {
                    return Ok(None);
                }
                self.table = self.image.table(self.dir_index)?;
                self.table_index = 0;
                if self.table.is_none() {
                    self.dir_index += 1;
                }
                continue;
            };

            if self.table_index == ENTRIES_PER_TABLE {
                self.table = None;
                self.dir_index += 1;
                continue;
            }

            let j = self.table_index;
            self.table_index += 1;
            let entry = le_u64(table, (j * 8) as usize);
            let index = self.dir_index * ENTRIES_PER_TABLE + j;
            let descriptor = Descriptor {
                index,
                virtual_offset: self.dir_index * DIR_ENTRY_SPAN + j * GRAIN_SIZE,
                length: GRAIN_SIZE,
                kind: self.image.classify(index, entry)?,
            };
            if descriptor.kind != ChunkKind::Skip {
                check_capacity(&descriptor, self.image.virtual_size())?;
            }
            return Ok(Some(descriptor));
        }
    }
}

impl Iterator for GrainWalk<'_, '_> {
    type Item = Result<Descriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.next_descriptor().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}
