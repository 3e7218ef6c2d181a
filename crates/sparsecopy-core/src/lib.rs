//! sparsecopy core library
//!
//! This crate copies the allocated contents of sparse and differencing
//! virtual disk images onto a pre-existing raw destination, leaving
//! unallocated ranges untouched.
//!
//! # Overview
//!
//! An input image is memory-mapped, validated by one of the format decoders,
//! and decoded into an offset-ordered stream of chunk descriptors. The
//! [`convert`] function expands those descriptors into extents and writes
//! them with positioned vectored writes.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`bounds`] - Checked offset arithmetic over the mapped image
//! - [`checksum`] - CRC-32C
//! - [`bitmap`] - Sector bitmap run extraction
//! - [`extent`] - Chunk descriptors and write extents
//! - [`image`] - Read-only mapping of the input file
//! - [`formats`] - SESparse, VHD, VHDX and VMFS sparse decoders
//! - [`writer`] - Extent coalescing and `pwritev` batching
//! - [`convert`] - Conversion orchestrator
//!
//! # Quick Start
//!
//! ```no_run
//! use sparsecopy_core::{convert, open_destination, open_image, ConvertOptions, SourceImage};
//! use std::path::Path;
//!
//! let source = SourceImage::open(Path::new("/path/to/disk.vhd")).unwrap();
//! let image = open_image(source.data(), None).unwrap();
//! let mut destination = open_destination(Path::new("/path/to/disk.raw"), false, None).unwrap();
//!
//! convert(image.as_ref(), &mut destination, &ConvertOptions::default(), None).unwrap();
//! ```

pub mod bitmap;
pub mod bounds;
pub mod checksum;
pub mod convert;
pub mod error;
pub mod extent;
pub mod formats;
pub mod image;
pub mod writer;

pub use error::{Error, Result};

// Re-export the conversion entry points for convenience
pub use convert::{
    convert, describe, open_destination, ConvertOptions, ConvertProgress, ConvertReport,
    ProgressCallback, DIRECT_IO_ALIGNMENT,
};
pub use formats::{open_image, DiskInfo, Format, ParentLink, SparseImage};
pub use image::SourceImage;
pub use writer::WriteStats;
