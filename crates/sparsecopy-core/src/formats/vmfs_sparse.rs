//! VMFS sparse (COWD) extents.
//!
//! A two-level grain directory of 32-bit sector offsets. Each grain table
//! holds 4096 entries and each entry addresses one 512-byte grain; a zero
//! entry means the grain was never written.

use tracing::{debug, info};

use crate::bounds::{le_u32, scaled, slice_at};
use crate::error::{Error, Result};
use crate::extent::{ChunkKind, Descriptor};

use super::{check_capacity, expect_field, DiskInfo, Format, SparseImage, SECTOR_SIZE};

/// "COWD" as a little-endian u32.
pub const MAGIC: u32 = 0x4457_4F43;

/// Grain table entries per table.
pub const GRAINS_PER_TABLE: u64 = 4096;

/// Grain size in bytes (one sector).
pub const GRAIN_SIZE: u64 = 512;

const HEADER_SIZE: u64 = 2048;
const VERSION: u32 = 1;
const FLAGS: u32 = 3;
const NAME_OFFSET: usize = 1064;
const NAME_LEN: usize = 60;

#[derive(Debug, Clone)]
struct CowdHeader {
    num_sectors: u32,
    gd_offset: u32,
    num_gd_entries: u32,
    name: Option<String>,
}

impl CowdHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        let raw = slice_at(data, 0, HEADER_SIZE, 0)
            .map_err(|_| Error::format("image too small for a COWD header"))?;

        let magic = le_u32(raw, 0);
        if magic != MAGIC {
            return Err(Error::format(format!(
                "invalid COWD magic: expected {MAGIC:#x}, got {magic:#x}"
            )));
        }

        let version = le_u32(raw, 4);
        if version != VERSION {
            return Err(Error::unsupported(format!("COWD version {version}")));
        }
        expect_field("flags", le_u32(raw, 8).into(), FLAGS.into())?;
        expect_field("grain_size", le_u32(raw, 16).into(), 1)?;

        let name_bytes = &raw[NAME_OFFSET..NAME_OFFSET + NAME_LEN];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let name = (end > 0).then(|| String::from_utf8_lossy(&name_bytes[..end]).into_owned());

        Ok(Self {
            num_sectors: le_u32(raw, 12),
            gd_offset: le_u32(raw, 20),
            num_gd_entries: le_u32(raw, 24),
            name,
        })
    }
}

/// A validated VMFS sparse image.
pub struct VmfsSparseImage<'a> {
    data: &'a [u8],
    header: CowdHeader,
    directory: &'a [u8],
}

impl<'a> VmfsSparseImage<'a> {
    /// Validates the header and locates the grain directory.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = CowdHeader::parse(data)?;
        let image_len = data.len() as u64;

        let gd_offset = scaled(header.gd_offset.into(), SECTOR_SIZE, 0, image_len)?;
        let directory = slice_at(data, gd_offset, u64::from(header.num_gd_entries) * 4, 0)?;

        info!(
            capacity = u64::from(header.num_sectors) * SECTOR_SIZE,
            tables = header.num_gd_entries,
            "VMFS sparse header"
        );

        Ok(Self {
            data,
            header,
            directory,
        })
    }

    fn directory_entry(&self, index: u64) -> u32 {
        le_u32(self.directory, (index * 4) as usize)
    }
}

impl SparseImage for VmfsSparseImage<'_> {
    fn format(&self) -> Format {
        Format::VmfsSparse
    }

    fn virtual_size(&self) -> u64 {
        u64::from(self.header.num_sectors) * SECTOR_SIZE
    }

    fn chunk_size(&self) -> u64 {
        GRAIN_SIZE
    }

    fn data(&self) -> &[u8] {
        self.data
    }

    fn info(&self) -> DiskInfo {
        DiskInfo {
            format: Format::VmfsSparse,
            virtual_size: self.virtual_size(),
            disk_id: None,
            name: self.header.name.clone(),
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
    image: &'i VmfsSparseImage<'a>,
    dir_index: u64,
    table: Option<&'a [u8]>,
    table_index: u64,
    done: bool,
}

impl GrainWalk<'_, '_> {
    fn next_descriptor(&mut self) -> Result<Option<Descriptor>> {
        let num_tables = u64::from(self.image.header.num_gd_entries);
        loop {
            let table = match self.table {
                Some(table) if self.table_index < GRAINS_PER_TABLE => table,
                _ => {
                    if self.table.is_some() {
                        self.dir_index += 1;
                        self.table = None;
                    }
                    if self.dir_index >= num_tables {
                        return Ok(None);
                    }
                    let table_sector = self.image.directory_entry(self.dir_index);
                    if table_sector == 0 {
                        self.dir_index += 1;
                        continue;
                    }
                    debug!("Table[{:4}] = {}", self.dir_index, table_sector);
                    let data = self.image.data;
                    let offset = scaled(
                        table_sector.into(),
                        SECTOR_SIZE,
                        self.dir_index,
                        data.len() as u64,
                    )?;
                    let table = slice_at(data, offset, GRAINS_PER_TABLE * 4, self.dir_index)?;
                    self.table = Some(table);
                    self.table_index = 0;
                    table
                }
            };

            let j = self.table_index;
            self.table_index += 1;
            let grain = le_u32(table, (j * 4) as usize);
            let index = self.dir_index * GRAINS_PER_TABLE + j;
            let kind = if grain == 0 {
                ChunkKind::Skip
            } else {
                ChunkKind::Present {
                    offset: u64::from(grain) * GRAIN_SIZE,
                }
            };
            let descriptor = Descriptor {
                index,
                virtual_offset: index * GRAIN_SIZE,
                length: GRAIN_SIZE,
                kind,
            };
            if kind != ChunkKind::Skip {
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
        // Stop after the first error.
        self.done = item.as_ref().map_or(true, |r| r.is_err());
        item
    }
}
