//! End-to-end tests across the library surface: image opening, format
//! selection, destination handling and progress reporting.

mod common;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::*;
use sparsecopy_core::{
    convert, open_destination, open_image, ConvertOptions, ConvertProgress, Error, Format,
    ProgressCallback, SourceImage,
};
use tempfile::tempdir;

const SECTORS: u32 = 4096;
const VIRTUAL_SIZE: u64 = SECTORS as u64 * 512;

#[test]
fn test_unrecognized_signature() {
    let err = describe_bytes(b"KDMV\x01\0\0\0 not a supported container").unwrap_err();
    assert!(matches!(err, Error::Format { .. }), "unexpected error: {err}");
}

#[test]
fn test_explicit_format_overrides_detection() {
    let image = build_cowd(SECTORS, &[]);
    let file = write_temp(&image);
    let source = SourceImage::open(file.path()).unwrap();

    assert_eq!(Format::detect(source.data()), Some(Format::VmfsSparse));
    let err = open_image(source.data(), Some(Format::Vhd)).err().unwrap();
    assert!(matches!(err, Error::Format { .. }), "unexpected error: {err}");
    assert!(open_image(source.data(), Some(Format::VmfsSparse)).is_ok());
}

#[test]
fn test_missing_input_reports_path() {
    let err = SourceImage::open(Path::new("/nonexistent/disk.vhdx")).err().unwrap();
    assert!(matches!(err, Error::Io { path: Some(_), .. }));
    assert!(err.to_string().contains("/nonexistent/disk.vhdx"));
}

#[test]
fn test_empty_input_rejected() {
    let file = write_temp(&[]);
    let err = SourceImage::open(file.path()).err().unwrap();
    assert!(matches!(err, Error::Format { .. }), "unexpected error: {err}");
}

#[test]
fn test_create_destination_sized_to_virtual_size() {
    let input = write_temp(&build_cowd(SECTORS, &[(10, 0xAB)]));
    let dir = tempdir().unwrap();
    let output = dir.path().join("disk.raw");

    let source = SourceImage::open(input.path()).unwrap();
    let image = open_image(source.data(), None).unwrap();
    let mut target = open_destination(&output, false, Some(image.virtual_size())).unwrap();
    let report = convert(image.as_ref(), &mut target, &ConvertOptions::default(), None).unwrap();
    drop(target);

    let out = fs::read(&output).unwrap();
    assert_eq!(out.len() as u64, VIRTUAL_SIZE);
    assert_filled(&out, 0..5120, 0);
    assert_filled(&out, 5120..5632, 0xAB);
    assert_filled(&out, 5632..out.len(), 0);
    assert_eq!(report.stats.bytes_written, 512);
}

#[test]
fn test_existing_destination_left_intact_with_create() {
    let input = write_temp(&build_cowd(SECTORS, &[(0, 0x11)]));
    let output = write_temp(&vec![UNTOUCHED; 2 * VIRTUAL_SIZE as usize]);

    let source = SourceImage::open(input.path()).unwrap();
    let image = open_image(source.data(), None).unwrap();
    let mut target = open_destination(output.path(), false, Some(VIRTUAL_SIZE)).unwrap();
    convert(image.as_ref(), &mut target, &ConvertOptions::default(), None).unwrap();
    drop(target);

    let out = fs::read(output.path()).unwrap();
    assert_eq!(out.len() as u64, 2 * VIRTUAL_SIZE);
    assert_filled(&out, 0..512, 0x11);
    assert_filled(&out, 512..out.len(), UNTOUCHED);
}

#[test]
fn test_progress_callback() {
    let input = write_temp(&build_cowd(SECTORS, &[(1, 0x01), (7, 0x07), (9, 0x09)]));
    let output = write_temp(&vec![UNTOUCHED; VIRTUAL_SIZE as usize]);

    let calls = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(Mutex::new(None::<ConvertProgress>));
    let calls_clone = Arc::clone(&calls);
    let last_clone = Arc::clone(&last);
    let callback: ProgressCallback = Box::new(move |progress: ConvertProgress| {
        calls_clone.fetch_add(1, Ordering::SeqCst);
        let mut last = last_clone.lock().unwrap();
        if let Some(previous) = *last {
            assert!(progress.virtual_offset >= previous.virtual_offset);
        }
        *last = Some(progress);
    });

    let source = SourceImage::open(input.path()).unwrap();
    let image = open_image(source.data(), None).unwrap();
    let mut target = open_destination(output.path(), false, None).unwrap();
    convert(
        image.as_ref(),
        &mut target,
        &ConvertOptions::default(),
        Some(callback),
    )
    .unwrap();

    assert!(calls.load(Ordering::SeqCst) >= 3);
    let last = last.lock().unwrap().expect("progress was reported");
    assert_eq!(last.virtual_offset, VIRTUAL_SIZE);
    assert_eq!(last.virtual_size, VIRTUAL_SIZE);
    assert_eq!(last.bytes_written, 3 * 512);
    assert_eq!(last.percent_complete(), 100.0);
}

#[test]
fn test_alignment_violation_aborts() {
    // One 512-byte grain cannot satisfy a 4 KiB alignment requirement.
    let input = write_temp(&build_cowd(SECTORS, &[(10, 0xAB)]));
    let output = write_temp(&vec![UNTOUCHED; VIRTUAL_SIZE as usize]);

    let source = SourceImage::open(input.path()).unwrap();
    let image = open_image(source.data(), None).unwrap();
    let mut target = open_destination(output.path(), false, None).unwrap();
    let options = ConvertOptions {
        alignment: Some(4096),
        ..ConvertOptions::default()
    };
    let err = convert(image.as_ref(), &mut target, &options, None).unwrap_err();
    assert!(
        matches!(
            err,
            Error::Unaligned {
                offset: 5120,
                len: 512,
                alignment: 4096
            }
        ),
        "unexpected error: {err}"
    );
}

#[test]
fn test_sector_granular_runs_satisfy_direct_io_alignment() {
    let input = write_temp(&build_cowd(SECTORS, &[(3, 0x03), (10, 0xAB)]));
    let output = write_temp(&vec![UNTOUCHED; VIRTUAL_SIZE as usize]);

    let source = SourceImage::open(input.path()).unwrap();
    let image = open_image(source.data(), None).unwrap();
    let mut target = open_destination(output.path(), false, None).unwrap();
    let report = convert(image.as_ref(), &mut target, &ConvertOptions::direct_io(), None).unwrap();
    assert_eq!(report.stats.writes, 2);
}
