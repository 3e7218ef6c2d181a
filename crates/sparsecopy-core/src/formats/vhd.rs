//! Dynamic and differencing VHD images.
//!
//! The footer copy at the start of the file points at the dynamic disk
//! header, which in turn points at the Block Allocation Table. Each BAT entry
//! is the big-endian sector number of one block; the block starts with a
//! sector bitmap padded to a whole sector, followed by the block data.

use tracing::info;
use uuid::Uuid;

use crate::bitmap::{bitmap_len, BitOrder};
use crate::bounds::{be_u32, be_u64, bytes16, scaled, slice_at};
use crate::error::{Error, Result};
use crate::extent::{ChunkKind, Descriptor};

use super::{expect_field, DiskInfo, Format, ParentLink, SparseImage, SECTOR_SIZE};

/// Footer cookie.
pub const FOOTER_COOKIE: &[u8; 8] = b"conectix";

/// Dynamic disk header cookie.
pub const DYNAMIC_COOKIE: &[u8; 8] = b"cxsparse";

/// BAT entry of a block that was never allocated.
pub const BAT_UNALLOCATED: u32 = u32::MAX;

const FOOTER_SIZE: u64 = 512;
const DYNAMIC_HEADER_SIZE: u64 = 1024;
const FEATURES_RESERVED: u32 = 2;
const DISK_TYPE_DYNAMIC: u32 = 3;
const DISK_TYPE_DIFFERENCING: u32 = 4;
const DYNAMIC_HEADER_VERSION: u32 = 0x0001_0000;
const PARENT_NAME_OFFSET: usize = 64;
const PARENT_NAME_LEN: usize = 512;

/// Size of the sector bitmap in front of each block, padded to a sector.
pub fn block_bitmap_size(block_size: u64) -> u64 {
    bitmap_len(block_size / SECTOR_SIZE).div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

#[derive(Debug, Clone)]
struct VhdFooter {
    data_offset: u64,
    current_size: u64,
    disk_type: u32,
    uuid: Uuid,
}

impl VhdFooter {
    fn parse(data: &[u8]) -> Result<Self> {
        let raw = slice_at(data, 0, FOOTER_SIZE, 0)
            .map_err(|_| Error::format("image too small for a VHD footer"))?;

        if &raw[..8] != FOOTER_COOKIE {
            return Err(Error::format("VHD footer cookie mismatch"));
        }
        expect_field("features", be_u32(raw, 8).into(), FEATURES_RESERVED.into())?;

        let disk_type = be_u32(raw, 60);
        if disk_type != DISK_TYPE_DYNAMIC && disk_type != DISK_TYPE_DIFFERENCING {
            return Err(Error::unsupported(format!("VHD disk type {disk_type}")));
        }

        Ok(Self {
            data_offset: be_u64(raw, 16),
            current_size: be_u64(raw, 48),
            disk_type,
            uuid: Uuid::from_bytes(bytes16(raw, 68)),
        })
    }
}

#[derive(Debug, Clone)]
struct DynamicHeader {
    table_offset: u64,
    max_table_entries: u32,
    block_size: u32,
    parent_uuid: Uuid,
    parent_name: String,
}

impl DynamicHeader {
    fn parse(data: &[u8], offset: u64) -> Result<Self> {
        let raw = slice_at(data, offset, DYNAMIC_HEADER_SIZE, 0)
            .map_err(|_| Error::format("VHD dynamic header lies outside the image"))?;

        if &raw[..8] != DYNAMIC_COOKIE {
            return Err(Error::format("VHD dynamic header cookie mismatch"));
        }
        expect_field("dynamic data_offset", be_u64(raw, 8), u64::MAX)?;
        expect_field(
            "header_version",
            be_u32(raw, 24).into(),
            DYNAMIC_HEADER_VERSION.into(),
        )?;

        let block_size = be_u32(raw, 32);
        if block_size == 0 || u64::from(block_size) % SECTOR_SIZE != 0 {
            return Err(Error::format(format!("invalid VHD block size {block_size}")));
        }

        Ok(Self {
            table_offset: be_u64(raw, 16),
            max_table_entries: be_u32(raw, 28),
            block_size,
            parent_uuid: Uuid::from_bytes(bytes16(raw, 40)),
            parent_name: utf16be_until_nul(
                &raw[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_LEN],
            ),
        })
    }
}

fn utf16be_until_nul(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// A validated dynamic or differencing VHD.
pub struct VhdImage<'a> {
    data: &'a [u8],
    footer: VhdFooter,
    dynamic: DynamicHeader,
    bat: &'a [u8],
}

impl<'a> VhdImage<'a> {
    /// Validates the footer copy and dynamic header and locates the BAT.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let footer = VhdFooter::parse(data)?;
        let dynamic = DynamicHeader::parse(data, footer.data_offset)?;

        let block_size = u64::from(dynamic.block_size);
        let entries = footer
            .current_size
            .div_ceil(block_size)
            .min(dynamic.max_table_entries.into());
        let bat_len = scaled(entries, 4, 0, data.len() as u64)?;
        let bat = slice_at(data, dynamic.table_offset, bat_len, 0)?;

        info!(
            size = footer.current_size,
            block_size,
            entries,
            differencing = footer.disk_type == DISK_TYPE_DIFFERENCING,
            "VHD header"
        );

        Ok(Self {
            data,
            footer,
            dynamic,
            bat,
        })
    }

    fn block_size(&self) -> u64 {
        u64::from(self.dynamic.block_size)
    }
}

impl SparseImage for VhdImage<'_> {
    fn format(&self) -> Format {
        Format::Vhd
    }

    fn virtual_size(&self) -> u64 {
        self.footer.current_size
    }

    fn chunk_size(&self) -> u64 {
        self.block_size()
    }

    fn data(&self) -> &[u8] {
        self.data
    }

    fn info(&self) -> DiskInfo {
        let parent = (self.footer.disk_type == DISK_TYPE_DIFFERENCING).then(|| ParentLink {
            linkage: Some(self.dynamic.parent_uuid),
            path: Some(self.dynamic.parent_name.clone()),
            volume_path: None,
        });
        DiskInfo {
            format: Format::Vhd,
            virtual_size: self.footer.current_size,
            disk_id: Some(self.footer.uuid),
            name: None,
            parent,
        }
    }

    fn descriptors(&self) -> super::Descriptors<'_> {
        let block_size = self.block_size();
        let bitmap_size = block_bitmap_size(block_size);
        let capacity = self.footer.current_size;

        Box::new(
            self.bat
                .chunks_exact(4)
                .enumerate()
                .map(move |(i, raw)| {
                    let index = i as u64;
                    let virtual_offset = index * block_size;
                    let length = block_size.min(capacity - virtual_offset);
                    let sector = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
                    let kind = if sector == BAT_UNALLOCATED {
                        ChunkKind::Skip
                    } else {
                        let bitmap = u64::from(sector) * SECTOR_SIZE;
                        ChunkKind::PresentWithBitmap {
                            bitmap,
                            data: bitmap + bitmap_size,
                            order: BitOrder::MsbFirst,
                        }
                    };
                    Ok(Descriptor {
                        index,
                        virtual_offset,
                        length,
                        kind,
                    })
                }),
        )
    }
}
