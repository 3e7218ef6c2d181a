//! Chunk descriptors produced by the format decoders and the extents the
//! writer consumes.

use crate::bitmap::BitOrder;

/// How one chunk of the virtual disk is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Unallocated; the destination is left untouched.
    Skip,
    /// Reads as zeros and is written as zeros.
    ZeroFill,
    /// Fully backed by image bytes at `offset`.
    Present { offset: u64 },
    /// Backed by image bytes at `data`, but only the sectors marked in the
    /// bitmap at `bitmap` hold real data.
    PresentWithBitmap {
        bitmap: u64,
        data: u64,
        order: BitOrder,
    },
}

/// One decoded chunk of the virtual disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// Flat table index of the entry, used in diagnostics.
    pub index: u64,
    /// Byte offset of the chunk on the virtual disk.
    pub virtual_offset: u64,
    /// Chunk length in bytes.
    pub length: u64,
    pub kind: ChunkKind,
}

impl Descriptor {
    /// Byte offset just past the end of the chunk.
    pub fn end(&self) -> u64 {
        self.virtual_offset + self.length
    }
}

/// Where the bytes of an extent come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The writer's zero buffer.
    Zero,
    /// The mapped image at `offset`.
    Image { offset: u64 },
}

/// A contiguous range of the destination and the bytes to put there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub virtual_offset: u64,
    pub length: u64,
    pub source: Source,
    /// Table index the extent was decoded from.
    pub index: u64,
}

impl Extent {
    /// An extent of zeros.
    pub fn zero(virtual_offset: u64, length: u64, index: u64) -> Self {
        Self {
            virtual_offset,
            length,
            source: Source::Zero,
            index,
        }
    }

    /// An extent copied from the image at `offset`.
    pub fn image(virtual_offset: u64, length: u64, offset: u64, index: u64) -> Self {
        Self {
            virtual_offset,
            length,
            source: Source::Image { offset },
            index,
        }
    }

    /// Byte offset just past the end of the extent.
    pub fn end(&self) -> u64 {
        self.virtual_offset + self.length
    }
}
