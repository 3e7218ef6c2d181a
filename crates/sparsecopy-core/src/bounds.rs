//! Bounds checking for reads out of the mapped image.
//!
//! Every offset decoded from an indirection table passes through here before
//! it is used to index the image. Violations are reported, never clamped.

use std::ops::Range;

use crate::error::{Error, Result};

/// Validates `offset + len <= image_len` and returns the byte range.
///
/// `index` identifies the table entry that produced the offset and is only
/// used for the diagnostic.
pub fn checked_range(offset: u64, len: u64, image_len: u64, index: u64) -> Result<Range<usize>> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| Error::out_of_bounds(index, offset, len, image_len))?;
    if end > image_len {
        return Err(Error::out_of_bounds(index, offset, len, image_len));
    }
    // image_len came from a slice length, so both ends fit in usize.
    Ok(offset as usize..end as usize)
}

/// Returns `data[offset..offset + len]` after a bounds check.
pub fn slice_at(data: &[u8], offset: u64, len: u64, index: u64) -> Result<&[u8]> {
    let range = checked_range(offset, len, data.len() as u64, index)?;
    Ok(&data[range])
}

/// Multiplies a table value by a unit size, reporting overflow as a bounds
/// violation of entry `index`.
pub fn scaled(value: u64, unit: u64, index: u64, image_len: u64) -> Result<u64> {
    value
        .checked_mul(unit)
        .ok_or_else(|| Error::out_of_bounds(index, u64::MAX, unit, image_len))
}

// Fixed-offset field readers. Callers pass a structure slice that has already
// been obtained through `slice_at`, so the indexing below cannot fail.

pub(crate) fn le_u16(buf: &[u8], off: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&buf[off..off + 2]);
    u16::from_le_bytes(b)
}

pub(crate) fn le_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn le_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

pub(crate) fn be_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_be_bytes(b)
}

pub(crate) fn be_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(b)
}

pub(crate) fn bytes16(buf: &[u8], off: usize) -> [u8; 16] {
    let mut b = [0u8; 16];
    b.copy_from_slice(&buf[off..off + 16]);
    b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_inside_image() {
        assert_eq!(checked_range(512, 512, 1024, 0).unwrap(), 512..1024);
    }

    #[test]
    fn test_range_past_end_is_rejected() {
        let err = checked_range(513, 512, 1024, 3).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfBounds {
                index: 3,
                offset: 513,
                len: 512,
                image_len: 1024
            }
        ));
    }

    #[test]
    fn test_range_overflow_is_rejected() {
        assert!(checked_range(u64::MAX - 1, 16, u64::MAX, 0).is_err());
    }

    #[test]
    fn test_zero_length_at_end() {
        assert_eq!(checked_range(1024, 0, 1024, 0).unwrap(), 1024..1024);
    }

    #[test]
    fn test_slice_at() {
        let data: Vec<u8> = (0u8..16).collect();
        assert_eq!(slice_at(&data, 4, 4, 0).unwrap(), &[4, 5, 6, 7]);
        assert!(slice_at(&data, 14, 4, 0).is_err());
    }

    #[test]
    fn test_scaled_overflow() {
        assert_eq!(scaled(3, 512, 0, 0).unwrap(), 1536);
        assert!(scaled(u64::MAX, 512, 9, 0).is_err());
    }

    #[test]
    fn test_field_readers() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(le_u16(&buf, 0), 0x0201);
        assert_eq!(le_u32(&buf, 0), 0x0403_0201);
        assert_eq!(be_u32(&buf, 0), 0x0102_0304);
        assert_eq!(le_u64(&buf, 0), 0x0807_0605_0403_0201);
        assert_eq!(be_u64(&buf, 0), 0x0102_0304_0506_0708);
    }
}
