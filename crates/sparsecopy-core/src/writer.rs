//! Extent coalescing and positioned vectored writes.
//!
//! [`ExtentWriter`] accepts extents in increasing destination order and
//! batches runs of contiguous extents into a single `pwritev` call. Image
//! bytes are never copied: each batch segment points straight into the
//! mapped image or into the writer's zero buffer.

use std::fs::File;
use std::io::{self, IoSlice};

use memmap2::{Mmap, MmapMut};
use tracing::trace;

use crate::bounds::checked_range;
use crate::error::{Error, Result};
use crate::extent::{Extent, Source};

/// Default maximum number of segments in one vectored write.
pub const DEFAULT_MAX_SEGMENTS: usize = 256;

/// Upper bound on segments per vectored write (`IOV_MAX` on Linux).
pub const MAX_SEGMENTS: usize = 1024;

/// Default maximum number of bytes in one vectored write.
///
/// Linux caps a single write well below 2 GiB and returns a short count
/// beyond that, so batches stay far under the cap.
pub const DEFAULT_MAX_BATCH_BYTES: u64 = 64 * 1024 * 1024;

/// A destination that accepts positioned vectored writes.
pub trait WriteAt {
    /// Writes `bufs` back to back starting at `offset`, returning the number
    /// of bytes written.
    fn write_vectored_at(&mut self, bufs: &[IoSlice<'_>], offset: u64) -> io::Result<usize>;

    /// Flushes written data to stable storage.
    fn sync_data(&mut self) -> io::Result<()>;
}

#[cfg(target_os = "linux")]
impl WriteAt for File {
    fn write_vectored_at(&mut self, bufs: &[IoSlice<'_>], offset: u64) -> io::Result<usize> {
        use std::os::unix::io::AsRawFd;

        let count = libc::c_int::try_from(bufs.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many segments"))?;
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;

        // Safety: `IoSlice` is guaranteed ABI compatible with `iovec` on Unix,
        // and every slice outlives the call.
        let res = unsafe {
            libc::pwritev(
                self.as_raw_fd(),
                bufs.as_ptr() as *const libc::iovec,
                count,
                offset,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res as usize)
    }

    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
impl WriteAt for File {
    fn write_vectored_at(&mut self, bufs: &[IoSlice<'_>], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;

        let mut written = 0usize;
        for buf in bufs {
            let n = self.write_at(buf, offset + written as u64)?;
            written += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(written)
    }

    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }
}

impl<W: WriteAt + ?Sized> WriteAt for &mut W {
    fn write_vectored_at(&mut self, bufs: &[IoSlice<'_>], offset: u64) -> io::Result<usize> {
        (**self).write_vectored_at(bufs, offset)
    }

    fn sync_data(&mut self) -> io::Result<()> {
        (**self).sync_data()
    }
}

/// A zero-filled, page-aligned buffer allocated once per writer.
///
/// Zero extents reference it instead of allocating their own zeros. Page
/// alignment keeps it usable on destinations opened for direct I/O.
pub struct ZeroBuffer {
    map: Mmap,
}

impl ZeroBuffer {
    const PAGE: usize = 4096;

    /// Allocates at least `len` bytes of zeros, rounded up to a page.
    pub fn new(len: usize) -> Result<Self> {
        let len = len.max(1).div_ceil(Self::PAGE) * Self::PAGE;
        let map = MmapMut::map_anon(len)?.make_read_only()?;
        Ok(Self { map })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }
}

/// Writer tuning.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum segments per vectored write.
    pub max_segments: usize,
    /// Maximum bytes per vectored write.
    pub max_batch_bytes: u64,
    /// Required alignment of every write's offset and length, if any.
    pub alignment: Option<u64>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_segments: DEFAULT_MAX_SEGMENTS,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            alignment: None,
        }
    }
}

/// Counters collected while writing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Number of vectored write calls issued.
    pub writes: u64,
    /// Number of segments across all writes.
    pub segments: u64,
    /// Total bytes written, zeros included.
    pub bytes_written: u64,
    /// Bytes written from the zero buffer.
    pub zero_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    source: Source,
    len: u64,
}

/// Coalesces offset-ordered extents into positioned vectored writes.
pub struct ExtentWriter<'a, W: WriteAt> {
    target: W,
    image: &'a [u8],
    zeros: ZeroBuffer,
    config: WriterConfig,
    pending: Vec<Segment>,
    batch_start: u64,
    batch_len: u64,
    last_end: Option<u64>,
    stats: WriteStats,
}

impl<'a, W: WriteAt> ExtentWriter<'a, W> {
    /// Creates a writer over `image` whose zero buffer holds at least
    /// `zero_len` bytes.
    pub fn new(target: W, image: &'a [u8], zero_len: usize, config: WriterConfig) -> Result<Self> {
        let max_segments = config.max_segments.clamp(1, MAX_SEGMENTS);
        Ok(Self {
            target,
            image,
            zeros: ZeroBuffer::new(zero_len)?,
            pending: Vec::with_capacity(max_segments),
            config: WriterConfig {
                max_segments,
                max_batch_bytes: config.max_batch_bytes.max(1),
                alignment: config.alignment,
            },
            batch_start: 0,
            batch_len: 0,
            last_end: None,
            stats: WriteStats::default(),
        })
    }

    /// Queues `extent`, flushing the pending batch first if the extent does
    /// not continue it or the batch is full.
    pub fn push(&mut self, extent: Extent) -> Result<()> {
        if extent.length == 0 {
            return Ok(());
        }
        if let Some(previous_end) = self.last_end {
            if extent.virtual_offset < previous_end {
                return Err(Error::OutOfOrder {
                    offset: extent.virtual_offset,
                    previous_end,
                });
            }
        }
        if let Source::Image { offset } = extent.source {
            checked_range(offset, extent.length, self.image.len() as u64, extent.index)?;
        }

        let piece_max = match extent.source {
            Source::Zero => (self.zeros.len() as u64).min(self.config.max_batch_bytes),
            Source::Image { .. } => self.config.max_batch_bytes,
        };

        let mut done = 0;
        while done < extent.length {
            let len = (extent.length - done).min(piece_max);
            let virtual_offset = extent.virtual_offset + done;

            if !self.pending.is_empty()
                && (virtual_offset != self.batch_start + self.batch_len
                    || self.pending.len() >= self.config.max_segments
                    || self.batch_len + len > self.config.max_batch_bytes)
            {
                self.flush()?;
            }
            if self.pending.is_empty() {
                self.batch_start = virtual_offset;
            }

            let source = match extent.source {
                Source::Zero => Source::Zero,
                Source::Image { offset } => Source::Image {
                    offset: offset + done,
                },
            };
            self.pending.push(Segment { source, len });
            self.batch_len += len;
            done += len;
        }

        self.last_end = Some(extent.end());
        Ok(())
    }

    /// Writes out the pending batch, if any.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let offset = self.batch_start;
        let len = self.batch_len;
        if let Some(alignment) = self.config.alignment {
            if offset % alignment != 0 || len % alignment != 0 {
                return Err(Error::Unaligned {
                    offset,
                    len,
                    alignment,
                });
            }
        }

        let zeros = self.zeros.as_slice();
        let image = self.image;
        let mut zero_bytes = 0;
        let slices: Vec<IoSlice<'_>> = self
            .pending
            .iter()
            .map(|segment| match segment.source {
                Source::Zero => {
                    zero_bytes += segment.len;
                    IoSlice::new(&zeros[..segment.len as usize])
                }
                Source::Image { offset } => {
                    let start = offset as usize;
                    IoSlice::new(&image[start..start + segment.len as usize])
                }
            })
            .collect();

        trace!(offset, len, segments = slices.len(), "pwritev");
        let written = self
            .target
            .write_vectored_at(&slices, offset)
            .map_err(|source| Error::Write {
                offset,
                len,
                source,
            })?;
        if written as u64 != len {
            return Err(Error::ShortWrite {
                offset,
                expected: len,
                written: written as u64,
            });
        }

        self.stats.writes += 1;
        self.stats.segments += slices.len() as u64;
        self.stats.bytes_written += len;
        self.stats.zero_bytes += zero_bytes;

        self.pending.clear();
        self.batch_len = 0;
        Ok(())
    }

    /// Counters so far, excluding the pending batch.
    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    /// Flushes the last batch, syncs the destination, and returns it.
    pub fn finish(mut self) -> Result<(W, WriteStats)> {
        self.flush()?;
        self.target.sync_data()?;
        Ok((self.target, self.stats))
    }
}
