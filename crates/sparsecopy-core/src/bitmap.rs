//! Sector allocation bitmaps.
//!
//! Formats that allocate at sector granularity inside a larger block keep a
//! bit per sector. [`SectorRuns`] turns such a bitmap into maximal runs of
//! allocated sectors, one item per run.

/// Bit numbering inside each bitmap byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    /// Bit 7 of byte 0 is sector 0 (VHD).
    MsbFirst,
    /// Bit 0 of byte 0 is sector 0 (VHDX).
    LsbFirst,
}

impl BitOrder {
    /// Returns whether `sector` is marked in `bitmap`.
    #[inline]
    pub fn is_set(self, bitmap: &[u8], sector: u64) -> bool {
        let byte = bitmap[(sector / 8) as usize];
        let bit = (sector % 8) as u8;
        match self {
            BitOrder::MsbFirst => byte & (0x80 >> bit) != 0,
            BitOrder::LsbFirst => byte & (1 << bit) != 0,
        }
    }
}

/// A run of contiguous allocated sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRun {
    /// First sector of the run, relative to the block.
    pub start: u64,
    /// Number of sectors in the run.
    pub count: u64,
}

/// Number of bitmap bytes needed to describe `sectors` sectors.
pub fn bitmap_len(sectors: u64) -> u64 {
    sectors.div_ceil(8)
}

/// Iterator over maximal runs of set bits in a sector bitmap.
pub struct SectorRuns<'a> {
    bitmap: &'a [u8],
    order: BitOrder,
    sectors: u64,
    next: u64,
}

impl<'a> SectorRuns<'a> {
    /// Scans the first `sectors` bits of `bitmap`.
    ///
    /// `bitmap` must hold at least [`bitmap_len`]`(sectors)` bytes; shorter
    /// bitmaps are truncated to the sectors they can describe.
    pub fn new(bitmap: &'a [u8], order: BitOrder, sectors: u64) -> Self {
        let sectors = sectors.min(bitmap.len() as u64 * 8);
        Self {
            bitmap,
            order,
            sectors,
            next: 0,
        }
    }
}

impl Iterator for SectorRuns<'_> {
    type Item = SectorRun;

    fn next(&mut self) -> Option<SectorRun> {
        let mut sector = self.next;

        // Skip whole clear bytes before testing individual bits.
        while sector < self.sectors {
            if sector % 8 == 0 && self.bitmap[(sector / 8) as usize] == 0 {
                sector += 8;
                continue;
            }
            if self.order.is_set(self.bitmap, sector) {
                break;
            }
            sector += 1;
        }
        if sector >= self.sectors {
            self.next = self.sectors;
            return None;
        }

        let start = sector;
        while sector < self.sectors && self.order.is_set(self.bitmap, sector) {
            sector += 1;
        }
        self.next = sector;
        Some(SectorRun {
            start,
            count: sector - start,
        })
    }
}
