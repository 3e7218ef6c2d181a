//! Container format decoders.
//!
//! Each submodule validates one on-disk layout and decodes its indirection
//! table into a lazy, offset-ordered stream of [`Descriptor`]s. The rest of
//! the crate only sees the [`SparseImage`] trait.

pub mod sesparse;
pub mod vhd;
pub mod vhdx;
pub mod vmfs_sparse;

use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::extent::Descriptor;

pub use sesparse::SeSparseImage;
pub use vhd::VhdImage;
pub use vhdx::VhdxImage;
pub use vmfs_sparse::VmfsSparseImage;

/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Supported container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// VMware space-efficient sparse (SESparse) extent.
    SeSparse,
    /// Dynamic or differencing VHD.
    Vhd,
    /// VHDX.
    Vhdx,
    /// VMware VMFS sparse (COWD) extent.
    VmfsSparse,
}

impl Format {
    /// Identifies the format from the image's leading signature.
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.len() >= 8 && data[..8] == sesparse::MAGIC.to_le_bytes() {
            Some(Format::SeSparse)
        } else if data.starts_with(vhd::FOOTER_COOKIE) {
            Some(Format::Vhd)
        } else if data.starts_with(vhdx::FILE_SIGNATURE) {
            Some(Format::Vhdx)
        } else if data.len() >= 4 && data[..4] == vmfs_sparse::MAGIC.to_le_bytes() {
            Some(Format::VmfsSparse)
        } else {
            None
        }
    }

    /// Short lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Format::SeSparse => "sesparse",
            Format::Vhd => "vhd",
            Format::Vhdx => "vhdx",
            Format::VmfsSparse => "vmfs-sparse",
        }
    }

    /// Whether the destination is opened for direct I/O unless told otherwise.
    ///
    /// Both VMware formats write whole aligned grains, which direct I/O needs.
    pub fn prefers_direct_io(self) -> bool {
        matches!(self, Format::SeSparse | Format::VmfsSparse)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Linkage to the parent of a differencing disk. Reported, never followed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentLink {
    /// Identity the parent must carry (data write GUID or disk UUID).
    pub linkage: Option<Uuid>,
    /// Path to the parent image.
    pub path: Option<String>,
    /// Volume path of the parent image.
    pub volume_path: Option<String>,
}

/// What a describe-only run reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    pub format: Format,
    /// Virtual disk capacity in bytes.
    pub virtual_size: u64,
    /// Identity of this disk, when the format carries one.
    pub disk_id: Option<Uuid>,
    /// Embedded disk name, when the format carries one.
    pub name: Option<String>,
    pub parent: Option<ParentLink>,
}

/// Stream of decoded chunk descriptors.
pub type Descriptors<'a> = Box<dyn Iterator<Item = Result<Descriptor>> + 'a>;

/// A validated container image that can be decoded into descriptors.
pub trait SparseImage {
    fn format(&self) -> Format;

    /// Virtual disk capacity in bytes.
    fn virtual_size(&self) -> u64;

    /// Granularity of the indirection table in bytes.
    fn chunk_size(&self) -> u64;

    /// The mapped image bytes descriptors point into.
    fn data(&self) -> &[u8];

    /// Metadata for describe-only runs.
    fn info(&self) -> DiskInfo;

    /// Decodes the indirection table in increasing virtual offset order.
    fn descriptors(&self) -> Descriptors<'_>;
}

/// Validates `data` as `format`, or as whatever its signature says when
/// `format` is `None`.
pub fn open_image<'a>(data: &'a [u8], format: Option<Format>) -> Result<Box<dyn SparseImage + 'a>> {
    let format = match format {
        Some(format) => format,
        None => Format::detect(data)
            .ok_or_else(|| Error::format("unrecognized image signature"))?,
    };
    let image: Box<dyn SparseImage + 'a> = match format {
        Format::SeSparse => Box::new(SeSparseImage::parse(data)?),
        Format::Vhd => Box::new(VhdImage::parse(data)?),
        Format::Vhdx => Box::new(VhdxImage::parse(data)?),
        Format::VmfsSparse => Box::new(VmfsSparseImage::parse(data)?),
    };
    Ok(image)
}

/// Rejects a header field that does not hold its one supported value.
pub(crate) fn expect_field(field: &str, actual: u64, expected: u64) -> Result<()> {
    if actual != expected {
        return Err(Error::format(format!(
            "unsupported value in header: {field} = {actual:#x}, expected {expected:#x}"
        )));
    }
    Ok(())
}

/// Rejects a descriptor that would reach past the virtual capacity.
pub(crate) fn check_capacity(descriptor: &Descriptor, capacity: u64) -> Result<()> {
    if descriptor.end() > capacity {
        return Err(Error::format(format!(
            "table entry {} maps virtual offset {} past capacity {}",
            descriptor.index, descriptor.virtual_offset, capacity
        )));
    }
    Ok(())
}
