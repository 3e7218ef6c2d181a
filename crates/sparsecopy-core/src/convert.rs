//! Conversion orchestrator.
//!
//! Walks the descriptors of a validated [`SparseImage`], expands sector
//! bitmaps into runs, and feeds the resulting extents to an
//! [`ExtentWriter`] over the destination.
//!
//! # Example
//!
//! ```no_run
//! use sparsecopy_core::convert::{convert, open_destination, ConvertOptions};
//! use sparsecopy_core::formats::open_image;
//! use sparsecopy_core::image::SourceImage;
//! use std::path::Path;
//!
//! let source = SourceImage::open(Path::new("/path/to/disk.vhdx")).unwrap();
//! let image = open_image(source.data(), None).unwrap();
//! let mut destination = open_destination(Path::new("/dev/sdx"), false, None).unwrap();
//!
//! let report = convert(image.as_ref(), &mut destination, &ConvertOptions::default(), None).unwrap();
//! println!("wrote {} bytes", report.stats.bytes_written);
//! ```

use std::fs::{File, OpenOptions};
use std::path::Path;

use tracing::{debug, info};

use crate::bitmap::{bitmap_len, SectorRuns};
use crate::bounds::slice_at;
use crate::error::{Error, Result};
use crate::extent::{ChunkKind, Descriptor, Extent};
use crate::formats::{DiskInfo, SparseImage, SECTOR_SIZE};
use crate::writer::{
    ExtentWriter, WriteAt, WriteStats, WriterConfig, DEFAULT_MAX_BATCH_BYTES,
    DEFAULT_MAX_SEGMENTS,
};

/// Alignment required of every write when the destination is opened for
/// direct I/O.
pub const DIRECT_IO_ALIGNMENT: u64 = 512;

/// Options for a conversion run.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Maximum segments per vectored write (default 256).
    pub max_segments: usize,
    /// Maximum bytes per vectored write (default 64 MiB).
    pub max_batch_bytes: u64,
    /// Write alignment to enforce, set when the destination uses direct I/O.
    pub alignment: Option<u64>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            max_segments: DEFAULT_MAX_SEGMENTS,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            alignment: None,
        }
    }
}

impl ConvertOptions {
    /// Options for a destination opened with `O_DIRECT`.
    pub fn direct_io() -> Self {
        Self {
            alignment: Some(DIRECT_IO_ALIGNMENT),
            ..Self::default()
        }
    }

    fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_segments: self.max_segments,
            max_batch_bytes: self.max_batch_bytes,
            alignment: self.alignment,
        }
    }
}

/// Progress of a conversion run, reported once per descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertProgress {
    /// Virtual offset decoded so far.
    pub virtual_offset: u64,
    /// Virtual disk capacity.
    pub virtual_size: u64,
    /// Bytes handed to the destination so far, excluding the pending batch.
    pub bytes_written: u64,
}

impl ConvertProgress {
    /// Calculate overall percentage complete.
    pub fn percent_complete(&self) -> f64 {
        if self.virtual_size == 0 {
            return 100.0;
        }
        (self.virtual_offset as f64 / self.virtual_size as f64) * 100.0
    }
}

/// Type alias for the progress callback function.
pub type ProgressCallback = Box<dyn Fn(ConvertProgress) + Send>;

/// Outcome of a conversion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertReport {
    /// Descriptors left untouched in the destination.
    pub skipped: u64,
    /// Descriptors written as zeros.
    pub zero_filled: u64,
    /// Descriptors copied whole from the image.
    pub present: u64,
    /// Descriptors copied through a sector bitmap.
    pub partial: u64,
    /// Sector runs emitted for bitmap-backed descriptors.
    pub bitmap_runs: u64,
    pub stats: WriteStats,
}

/// Returns what a describe-only run reports for `image`.
pub fn describe(image: &dyn SparseImage) -> DiskInfo {
    image.info()
}

/// Opens the destination for positioned writes.
///
/// With `create_len`, a missing destination is created and sized to that
/// many bytes; an existing one is opened as is. With `direct`, the file is
/// opened with `O_DIRECT` where the platform has it.
pub fn open_destination(path: &Path, direct: bool, create_len: Option<u64>) -> Result<File> {
    if let Some(len) = create_len {
        if !path.exists() {
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| Error::io(e, path))?;
            file.set_len(len).map_err(|e| Error::io(e, path))?;
            debug!(path = %path.display(), len, "created destination");
        }
    }

    let mut options = OpenOptions::new();
    options.write(true);
    if direct {
        set_direct(&mut options);
    }
    options.open(path).map_err(|e| Error::io(e, path))
}

#[cfg(target_os = "linux")]
fn set_direct(options: &mut OpenOptions) {
    use std::os::unix::fs::OpenOptionsExt;
    options.custom_flags(libc::O_DIRECT);
}

#[cfg(not(target_os = "linux"))]
fn set_direct(_options: &mut OpenOptions) {}

/// Pushes the extents one descriptor expands to. Returns the number of
/// sector runs for bitmap-backed descriptors.
fn expand<W: WriteAt>(
    writer: &mut ExtentWriter<'_, W>,
    data: &[u8],
    descriptor: &Descriptor,
) -> Result<u64> {
    let Descriptor {
        index,
        virtual_offset,
        length,
        kind,
    } = *descriptor;

    match kind {
        ChunkKind::Skip => Ok(0),
        ChunkKind::ZeroFill => {
            writer.push(Extent::zero(virtual_offset, length, index))?;
            Ok(0)
        }
        ChunkKind::Present { offset } => {
            writer.push(Extent::image(virtual_offset, length, offset, index))?;
            Ok(0)
        }
        ChunkKind::PresentWithBitmap {
            bitmap,
            data: base,
            order,
        } => {
            let sectors = length.div_ceil(SECTOR_SIZE);
            let bitmap = slice_at(data, bitmap, bitmap_len(sectors), index)?;
            let mut runs = 0;
            for run in SectorRuns::new(bitmap, order, sectors) {
                let start = run.start * SECTOR_SIZE;
                let len = (run.count * SECTOR_SIZE).min(length - start);
                let offset = base
                    .checked_add(start)
                    .ok_or_else(|| Error::out_of_bounds(index, base, len, data.len() as u64))?;
                writer.push(Extent::image(virtual_offset + start, len, offset, index))?;
                runs += 1;
            }
            Ok(runs)
        }
    }
}

/// Converts `image` into `target`.
///
/// Descriptors are decoded lazily and written in virtual offset order. The
/// first error aborts the run; the destination may then hold a partial
/// copy. On success the destination has been synced with `fdatasync`.
pub fn convert<W: WriteAt>(
    image: &dyn SparseImage,
    target: W,
    options: &ConvertOptions,
    progress_callback: Option<ProgressCallback>,
) -> Result<ConvertReport> {
    let report_progress = |progress: ConvertProgress| {
        if let Some(ref callback) = progress_callback {
            callback(progress);
        }
    };

    let data = image.data();
    let virtual_size = image.virtual_size();
    let zero_len = image.chunk_size().min(options.max_batch_bytes).max(1) as usize;
    let mut writer = ExtentWriter::new(target, data, zero_len, options.writer_config())?;
    let mut report = ConvertReport::default();

    for descriptor in image.descriptors() {
        let descriptor = descriptor?;
        match descriptor.kind {
            ChunkKind::Skip => report.skipped += 1,
            ChunkKind::ZeroFill => report.zero_filled += 1,
            ChunkKind::Present { .. } => report.present += 1,
            ChunkKind::PresentWithBitmap { .. } => report.partial += 1,
        }
        report.bitmap_runs += expand(&mut writer, data, &descriptor)?;

        report_progress(ConvertProgress {
            virtual_offset: descriptor.end().min(virtual_size),
            virtual_size,
            bytes_written: writer.stats().bytes_written,
        });
    }

    let (_, stats) = writer.finish()?;
    report.stats = stats;
    report_progress(ConvertProgress {
        virtual_offset: virtual_size,
        virtual_size,
        bytes_written: stats.bytes_written,
    });

    info!(
        format = %image.format(),
        skipped = report.skipped,
        zero_filled = report.zero_filled,
        present = report.present,
        partial = report.partial,
        writes = stats.writes,
        bytes = stats.bytes_written,
        "conversion complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::BitOrder;
    use crate::formats::Format;
    use std::io::{self, IoSlice};
    use std::sync::{Arc, Mutex};

    fn desc(index: u64, virtual_offset: u64, length: u64, kind: ChunkKind) -> Descriptor {
        Descriptor {
            index,
            virtual_offset,
            length,
            kind,
        }
    }

    /// A fixed descriptor list over an in-memory image.
    struct Fixture {
        data: Vec<u8>,
        chunk: u64,
        descriptors: Vec<Descriptor>,
    }

    impl SparseImage for Fixture {
        fn format(&self) -> Format {
            Format::Vhd
        }
        fn virtual_size(&self) -> u64 {
            self.descriptors.last().map_or(0, Descriptor::end)
        }
        fn chunk_size(&self) -> u64 {
            self.chunk
        }
        fn data(&self) -> &[u8] {
            &self.data
        }
        fn info(&self) -> DiskInfo {
            DiskInfo {
                format: Format::Vhd,
                virtual_size: self.virtual_size(),
                disk_id: None,
                name: None,
                parent: None,
            }
        }
        fn descriptors(&self) -> crate::formats::Descriptors<'_> {
            Box::new(self.descriptors.iter().copied().map(Ok))
        }
    }

    #[derive(Default)]
    struct Sink {
        writes: Vec<(u64, Vec<u8>)>,
        synced: bool,
    }

    impl WriteAt for Sink {
        fn write_vectored_at(&mut self, bufs: &[IoSlice<'_>], offset: u64) -> io::Result<usize> {
            let bytes: Vec<u8> = bufs.iter().flat_map(|b| b.iter().copied()).collect();
            let len = bytes.len();
            self.writes.push((offset, bytes));
            Ok(len)
        }
        fn sync_data(&mut self) -> io::Result<()> {
            self.synced = true;
            Ok(())
        }
    }

    #[test]
    fn test_bitmap_runs_become_separate_writes() {
        // Block of 16 sectors at 1024, bitmap at 0 marking sectors 0-2, 5, 7-9.
        let mut data = vec![0u8; 1024 + 16 * 512];
        data[0] = 0b1110_0101;
        data[1] = 0b1100_0000;
        for (sector, chunk) in data[1024..].chunks_mut(512).enumerate() {
            chunk.fill(sector as u8 + 1);
        }
        let image = Fixture {
            data,
            chunk: 16 * 512,
            descriptors: vec![Descriptor {
                index: 0,
                virtual_offset: 0,
                length: 16 * 512,
                kind: ChunkKind::PresentWithBitmap {
                    bitmap: 0,
                    data: 1024,
                    order: BitOrder::MsbFirst,
                },
            }],
        };

        let mut sink = Sink::default();
        let report = convert(&image, &mut sink, &ConvertOptions::default(), None).unwrap();

        assert_eq!(report.bitmap_runs, 3);
        assert_eq!(report.stats.writes, 3);
        let layout: Vec<(u64, usize)> = sink.writes.iter().map(|(o, b)| (*o, b.len())).collect();
        assert_eq!(layout, vec![(0, 3 * 512), (5 * 512, 512), (7 * 512, 3 * 512)]);
        assert!(sink.writes[1].1.iter().all(|&b| b == 6));
        assert!(sink.synced);
    }

    #[test]
    fn test_skip_splits_batches() {
        let image = Fixture {
            data: vec![0x11u8; 4096],
            chunk: 512,
            descriptors: vec![
                desc(0, 0, 512, ChunkKind::Present { offset: 0 }),
                desc(1, 512, 512, ChunkKind::ZeroFill),
                desc(2, 1024, 512, ChunkKind::Skip),
                desc(3, 1536, 512, ChunkKind::Present { offset: 512 }),
            ],
        };

        let mut sink = Sink::default();
        let report = convert(&image, &mut sink, &ConvertOptions::default(), None).unwrap();

        assert_eq!(report.present, 2);
        assert_eq!(report.zero_filled, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(sink.writes.len(), 2);
        assert_eq!(sink.writes[0].0, 0);
        assert_eq!(&sink.writes[0].1[..512], &[0x11; 512][..]);
        assert_eq!(&sink.writes[0].1[512..], &[0u8; 512][..]);
        assert_eq!(sink.writes[1].0, 1536);
        assert_eq!(report.stats.zero_bytes, 512);
    }

    #[test]
    fn test_bitmap_outside_image() {
        let image = Fixture {
            data: vec![0u8; 1024],
            chunk: 4096,
            descriptors: vec![Descriptor {
                index: 7,
                virtual_offset: 0,
                length: 4096,
                kind: ChunkKind::PresentWithBitmap {
                    bitmap: 1024,
                    data: 0,
                    order: BitOrder::LsbFirst,
                },
            }],
        };
        let err = convert(&image, Sink::default(), &ConvertOptions::default(), None).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { index: 7, .. }));
    }

    #[test]
    fn test_progress_reaches_end() {
        let image = Fixture {
            data: vec![0u8; 2048],
            chunk: 1024,
            descriptors: vec![
                desc(0, 0, 1024, ChunkKind::Skip),
                desc(1, 1024, 1024, ChunkKind::Present { offset: 1024 }),
            ],
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let callback: ProgressCallback = Box::new(move |p| sink_seen.lock().unwrap().push(p));

        convert(&image, Sink::default(), &ConvertOptions::default(), Some(callback)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first().unwrap().virtual_offset, 1024);
        let last = seen.last().unwrap();
        assert_eq!(last.virtual_offset, 2048);
        assert_eq!(last.bytes_written, 1024);
        assert_eq!(last.percent_complete(), 100.0);
    }

    #[test]
    fn test_create_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.raw");

        let file = open_destination(&path, false, Some(1 << 20)).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 1 << 20);

        // An existing destination is left at its size.
        drop(file);
        let file = open_destination(&path, false, Some(4096)).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 1 << 20);
    }

    #[test]
    fn test_missing_destination_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_destination(&dir.path().join("absent"), false, None).unwrap_err();
        assert!(matches!(err, Error::Io { path: Some(_), .. }));
    }
}
