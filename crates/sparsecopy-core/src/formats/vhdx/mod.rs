//! VHDX images.
//!
//! Headers and the region table are self-checksummed with CRC-32C and kept
//! in two copies. The Block Allocation Table interleaves payload block
//! entries with sector bitmap entries: after every `chunk_ratio` payload
//! entries comes one entry pointing at the sector bitmap for that chunk.
//! Each entry carries a 3-bit state and a file offset in megabytes.

pub mod header;
pub mod metadata;

use tracing::{debug, info};

use crate::bitmap::BitOrder;
use crate::bounds::{le_u64, scaled, slice_at};
use crate::error::{Error, Result};
use crate::extent::{ChunkKind, Descriptor};

use super::{DiskInfo, Format, SparseImage, SECTOR_SIZE};

pub use header::{Region, Regions, VhdxHeader, FILE_SIGNATURE};
pub use metadata::Metadata;

/// BAT entries address the file in 1 MiB units.
pub const BAT_OFFSET_UNIT: u64 = 1024 * 1024;

const MIN_BLOCK_SIZE: u32 = 1024 * 1024;
const MAX_BLOCK_SIZE: u32 = 256 * 1024 * 1024;

/// Sectors described by one sector bitmap block (2^23).
const SECTORS_PER_BITMAP: u64 = 1 << 23;

const STATE_MASK: u64 = 0b111;
const PAYLOAD_FULLY_PRESENT: u64 = 6;
const PAYLOAD_PARTIALLY_PRESENT: u64 = 7;
const SB_BLOCK_PRESENT: u64 = 6;

/// Payload blocks per sector bitmap entry for `block_size`.
pub fn chunk_ratio(block_size: u64) -> u64 {
    SECTORS_PER_BITMAP * SECTOR_SIZE / block_size
}

/// A validated VHDX image.
pub struct VhdxImage<'a> {
    data: &'a [u8],
    header: VhdxHeader,
    metadata: Metadata,
    bat: &'a [u8],
}

impl<'a> VhdxImage<'a> {
    /// Selects the active header, reads the region table and metadata, and
    /// locates the BAT.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        header::check_identifier(data)?;
        let header = header::read_header(data)?;
        let regions = header::read_regions(data)?;
        let metadata = metadata::read_metadata(data, regions.metadata)?;

        let block_size = metadata.block_size;
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(Error::format(format!("invalid VHDX block size {block_size}")));
        }

        let bat = slice_at(data, regions.bat.file_offset, regions.bat.length, 0)?;

        info!(
            size = metadata.virtual_disk_size,
            block_size,
            sequence = header.sequence_number,
            has_parent = metadata.has_parent,
            "VHDX header"
        );
        debug!(file_write_guid = %header.file_write_guid, disk_id = ?metadata.virtual_disk_id);

        Ok(Self {
            data,
            header,
            metadata,
            bat,
        })
    }

    fn block_size(&self) -> u64 {
        self.metadata.block_size.into()
    }

    fn bat_entry(&self, index: u64) -> Result<u64> {
        let raw = slice_at(self.bat, index * 8, 8, index)?;
        Ok(le_u64(raw, 0))
    }

    fn file_offset(&self, entry: u64, index: u64) -> Result<u64> {
        scaled(entry >> 20, BAT_OFFSET_UNIT, index, self.data.len() as u64)
    }

    /// Decodes payload block `block`.
    fn descriptor(&self, block: u64) -> Result<Descriptor> {
        let block_size = self.block_size();
        let ratio = chunk_ratio(block_size);
        let chunk = block / ratio;
        let index = block + chunk;
        let entry = self.bat_entry(index)?;

        let virtual_offset = block * block_size;
        let length = block_size.min(self.metadata.virtual_disk_size - virtual_offset);

        let kind = match entry & STATE_MASK {
            // Not present, undefined, zero and unmapped all leave the
            // destination untouched.
            0..=3 => ChunkKind::Skip,
            PAYLOAD_FULLY_PRESENT => ChunkKind::Present {
                offset: self.file_offset(entry, index)?,
            },
            PAYLOAD_PARTIALLY_PRESENT => {
                let bitmap_index = chunk * (ratio + 1) + ratio;
                let bitmap_entry = self.bat_entry(bitmap_index)?;
                if bitmap_entry & STATE_MASK != SB_BLOCK_PRESENT {
                    return Err(Error::format(format!(
                        "sector bitmap entry {bitmap_index} for block {index} is not present"
                    )));
                }
                debug!("bitmap[{}] = {:x}", bitmap_index, bitmap_entry);
                let position = (block % ratio) * block_size / SECTOR_SIZE / 8;
                ChunkKind::PresentWithBitmap {
                    bitmap: self.file_offset(bitmap_entry, bitmap_index)? + position,
                    data: self.file_offset(entry, index)?,
                    order: BitOrder::LsbFirst,
                }
            }
            state => {
                return Err(Error::format(format!(
                    "BAT entry {index} has unsupported state {state}"
                )))
            }
        };

        Ok(Descriptor {
            index,
            virtual_offset,
            length,
            kind,
        })
    }
}

impl SparseImage for VhdxImage<'_> {
    fn format(&self) -> Format {
        Format::Vhdx
    }

    fn virtual_size(&self) -> u64 {
        self.metadata.virtual_disk_size
    }

    fn chunk_size(&self) -> u64 {
        self.block_size()
    }

    fn data(&self) -> &[u8] {
        self.data
    }

    fn info(&self) -> DiskInfo {
        DiskInfo {
            format: Format::Vhdx,
            virtual_size: self.metadata.virtual_disk_size,
            disk_id: Some(self.header.data_write_guid),
            name: None,
            parent: self.metadata.parent.clone(),
        }
    }

    fn descriptors(&self) -> super::Descriptors<'_> {
        let blocks = self.metadata.virtual_disk_size.div_ceil(self.block_size());
        let mut failed = false;
        Box::new((0..blocks).map_while(move |block| {
            if failed {
                return None;
            }
            let item = self.descriptor(block);
            failed = item.is_err();
            Some(item)
        }))
    }
}
