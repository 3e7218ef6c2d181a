//! Shared helpers for the format integration tests.

#![allow(dead_code)]

use std::fs;
use std::io::Write;

use sparsecopy_core::{
    convert, open_destination, open_image, ConvertOptions, ConvertReport, DiskInfo, SourceImage,
};
use tempfile::NamedTempFile;

/// Byte the destination is pre-filled with, so untouched ranges are visible.
pub const UNTOUCHED: u8 = 0x5A;

pub fn put_u16_le(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u32_le(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u64_le(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u32_be(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

pub fn put_u64_be(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_be_bytes());
}

/// Writes `bytes` to a temp file.
pub fn write_temp(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(bytes).expect("Failed to write test data");
    file.flush().expect("Failed to flush");
    file
}

/// Opens `image` from a temp file and returns what a describe-only run reports.
pub fn describe_bytes(image: &[u8]) -> sparsecopy_core::Result<DiskInfo> {
    let file = write_temp(image);
    let source = SourceImage::open(file.path())?;
    let image = open_image(source.data(), None)?;
    Ok(sparsecopy_core::describe(image.as_ref()))
}

/// Converts `image` onto a destination of `dest_len` bytes pre-filled with
/// [`UNTOUCHED`], returning the destination contents and the report.
pub fn convert_bytes(
    image: &[u8],
    dest_len: u64,
) -> sparsecopy_core::Result<(Vec<u8>, ConvertReport)> {
    let input = write_temp(image);
    let output = write_temp(&vec![UNTOUCHED; dest_len as usize]);

    let source = SourceImage::open(input.path())?;
    let image = open_image(source.data(), None)?;
    let mut target = open_destination(output.path(), false, None)?;
    let report = convert(image.as_ref(), &mut target, &ConvertOptions::default(), None)?;
    drop(target);

    let contents = fs::read(output.path()).expect("Failed to read destination");
    Ok((contents, report))
}

/// Asserts `range` of `buf` holds only `byte`.
pub fn assert_filled(buf: &[u8], range: std::ops::Range<usize>, byte: u8) {
    let start = range.start;
    if let Some(pos) = buf[range].iter().position(|&b| b != byte) {
        panic!(
            "byte at {} is {:#04x}, expected {:#04x}",
            start + pos,
            buf[start + pos],
            byte
        );
    }
}

/// Builds a VMFS sparse (COWD) image of `num_sectors` with one grain table
/// for directory entry 0 and the given (table index, fill byte) grains.
///
/// Layout: header sectors 0-3, directory at sector 4, table at sector 5,
/// grains from sector 37 in the order given.
pub fn build_cowd(num_sectors: u32, grains: &[(usize, u8)]) -> Vec<u8> {
    const GD_SECTOR: u32 = 4;
    const TABLE_SECTOR: u32 = GD_SECTOR + 1;
    const FIRST_GRAIN: u32 = TABLE_SECTOR + 32;

    let mut data = vec![0u8; (FIRST_GRAIN as usize + grains.len()) * 512];
    data[0..4].copy_from_slice(b"COWD");
    put_u32_le(&mut data, 4, 1);
    put_u32_le(&mut data, 8, 3);
    put_u32_le(&mut data, 12, num_sectors);
    put_u32_le(&mut data, 16, 1);
    put_u32_le(&mut data, 20, GD_SECTOR);
    put_u32_le(&mut data, 24, num_sectors.div_ceil(4096));
    data[1064..1072].copy_from_slice(b"testdisk");

    put_u32_le(&mut data, GD_SECTOR as usize * 512, TABLE_SECTOR);
    for (n, &(index, fill)) in grains.iter().enumerate() {
        let sector = FIRST_GRAIN + n as u32;
        put_u32_le(&mut data, TABLE_SECTOR as usize * 512 + index * 4, sector);
        let at = sector as usize * 512;
        data[at..at + 512].fill(fill);
    }
    data
}
