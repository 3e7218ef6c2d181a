//! VHDX metadata region: file parameters, sizes and the parent locator.

use tracing::debug;
use uuid::{uuid, Uuid};

use crate::bounds::{bytes16, le_u16, le_u32, le_u64, slice_at};
use crate::error::{Error, Result};
use crate::formats::ParentLink;

use super::header::Region;

pub const METADATA_SIGNATURE: &[u8; 8] = b"metadata";

pub const FILE_PARAMETERS: Uuid = uuid!("CAA16737-FA36-4D43-B3B6-33F0AA44E76B");
pub const VIRTUAL_DISK_SIZE: Uuid = uuid!("2FA54224-CD1B-4876-B211-5DBED83BF4B8");
pub const VIRTUAL_DISK_ID: Uuid = uuid!("BECA12AB-B2E6-4523-93EF-C309E000C746");
pub const LOGICAL_SECTOR_SIZE: Uuid = uuid!("8141BF1D-A96F-4709-BA47-F233A8FAAB5F");
pub const PHYSICAL_SECTOR_SIZE: Uuid = uuid!("CDA348C7-445D-4471-9CC9-E9885251C556");
pub const PARENT_LOCATOR: Uuid = uuid!("A8D35F2D-B30B-454D-ABF7-D3D84834AB0C");

/// Locator type of a VHDX parent.
pub const VHDX_PARENT_LOCATOR_TYPE: Uuid = uuid!("B04AEFB7-D19E-4A81-B789-25B8E9445913");

const TABLE_HEADER_SIZE: usize = 32;
const ENTRY_SIZE: usize = 32;
const MAX_ENTRIES: u16 = 2047;
const ENTRY_REQUIRED: u32 = 1 << 2;
const HAS_PARENT: u32 = 1 << 1;

const LOCATOR_HEADER_SIZE: u64 = 20;
const LOCATOR_ENTRY_SIZE: u64 = 12;

/// Decoded metadata items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub block_size: u32,
    pub has_parent: bool,
    pub virtual_disk_size: u64,
    pub virtual_disk_id: Option<Uuid>,
    pub parent: Option<ParentLink>,
}

/// Reads a metadata item, which must lie inside the metadata region.
fn item<'a>(data: &'a [u8], region: Region, offset: u32, len: u32, index: u64) -> Result<&'a [u8]> {
    let (offset, len) = (u64::from(offset), u64::from(len));
    if offset + len > region.length {
        return Err(Error::out_of_bounds(index, offset, len, region.length));
    }
    slice_at(data, region.file_offset + offset, len, index)
}

fn expect_len(name: &str, actual: u32, expected: u32) -> Result<()> {
    if actual != expected {
        return Err(Error::format(format!(
            "VHDX {name} metadata item is {actual} bytes, expected {expected}"
        )));
    }
    Ok(())
}

/// Decodes the metadata table at `region`.
pub fn read_metadata(data: &[u8], region: Region) -> Result<Metadata> {
    let table = slice_at(data, region.file_offset, region.length, 0)?;
    if table.len() < TABLE_HEADER_SIZE || !table.starts_with(METADATA_SIGNATURE) {
        return Err(Error::format("VHDX metadata table signature mismatch"));
    }

    let count = le_u16(table, 10);
    if count > MAX_ENTRIES || TABLE_HEADER_SIZE + usize::from(count) * ENTRY_SIZE > table.len() {
        return Err(Error::format(format!("VHDX metadata table has {count} entries")));
    }

    let mut block_size = None;
    let mut has_parent = false;
    let mut virtual_disk_size = None;
    let mut virtual_disk_id = None;
    let mut parent = None;

    for i in 0..usize::from(count) {
        let at = TABLE_HEADER_SIZE + i * ENTRY_SIZE;
        let entry = &table[at..at + ENTRY_SIZE];
        let id = Uuid::from_bytes_le(bytes16(entry, 0));
        let offset = le_u32(entry, 16);
        let len = le_u32(entry, 20);
        let flags = le_u32(entry, 24);
        let raw = || item(data, region, offset, len, i as u64);

        if id == FILE_PARAMETERS {
            expect_len("file parameters", len, 8)?;
            let raw = raw()?;
            block_size = Some(le_u32(raw, 0));
            has_parent = le_u32(raw, 4) & HAS_PARENT != 0;
        } else if id == VIRTUAL_DISK_SIZE {
            expect_len("virtual disk size", len, 8)?;
            virtual_disk_size = Some(le_u64(raw()?, 0));
        } else if id == VIRTUAL_DISK_ID {
            expect_len("virtual disk id", len, 16)?;
            virtual_disk_id = Some(Uuid::from_bytes_le(bytes16(raw()?, 0)));
        } else if id == LOGICAL_SECTOR_SIZE {
            expect_len("logical sector size", len, 4)?;
            let size = le_u32(raw()?, 0);
            if size != 512 {
                return Err(Error::unsupported(format!("virtual sector size {size}")));
            }
        } else if id == PHYSICAL_SECTOR_SIZE {
            expect_len("physical sector size", len, 4)?;
            let size = le_u32(raw()?, 0);
            if size != 512 && size != 4096 {
                return Err(Error::unsupported(format!("physical sector size {size}")));
            }
        } else if id == PARENT_LOCATOR {
            parent = Some(read_parent_locator(raw()?, i as u64)?);
        } else if flags & ENTRY_REQUIRED != 0 {
            return Err(Error::unsupported(format!("required VHDX metadata item {id}")));
        } else {
            debug!("skipping VHDX metadata item {id}");
        }
    }

    let (Some(block_size), Some(virtual_disk_size)) = (block_size, virtual_disk_size) else {
        return Err(Error::format("VHDX file parameters or virtual disk size missing"));
    };

    if has_parent {
        let complete = parent
            .as_ref()
            .is_some_and(|p| p.linkage.is_some() && p.path.is_some() && p.volume_path.is_some());
        if !complete {
            return Err(Error::format(
                "VHDX has a parent but no parent linkage, path or volume path",
            ));
        }
    } else {
        parent = None;
    }

    Ok(Metadata {
        block_size,
        has_parent,
        virtual_disk_size,
        virtual_disk_id,
        parent,
    })
}

fn utf16le(raw: &[u8]) -> Result<String> {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| Error::format("invalid UTF-16 in VHDX parent locator"))
}

/// Decodes a parent locator item. Unknown keys are ignored.
pub fn read_parent_locator(locator: &[u8], index: u64) -> Result<ParentLink> {
    let header = slice_at(locator, 0, LOCATOR_HEADER_SIZE, index)?;
    let kind = Uuid::from_bytes_le(bytes16(header, 0));
    if kind != VHDX_PARENT_LOCATOR_TYPE {
        return Err(Error::unsupported(format!("parent locator type {kind}")));
    }

    let count = u64::from(le_u16(header, 18));
    let mut link = ParentLink::default();
    for n in 0..count {
        let entry = slice_at(
            locator,
            LOCATOR_HEADER_SIZE + n * LOCATOR_ENTRY_SIZE,
            LOCATOR_ENTRY_SIZE,
            index,
        )?;
        let key = slice_at(locator, le_u32(entry, 0).into(), le_u16(entry, 8).into(), index)?;
        let value = slice_at(locator, le_u32(entry, 4).into(), le_u16(entry, 10).into(), index)?;

        match utf16le(key)?.as_str() {
            "parent_linkage" => {
                let text = utf16le(value)?;
                if !text.starts_with('{') {
                    return Err(Error::format(format!("invalid parent linkage: {text}")));
                }
                let guid = Uuid::parse_str(&text)
                    .map_err(|_| Error::format(format!("invalid parent linkage: {text}")))?;
                link.linkage = Some(guid);
            }
            "absolute_win32_path" => link.path = Some(utf16le(value)?.replace('\\', "/")),
            "volume_path" => link.volume_path = Some(utf16le(value)?),
            other => debug!("ignoring parent locator key {other}"),
        }
    }
    Ok(link)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    fn locator(pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut raw = vec![0u8; LOCATOR_HEADER_SIZE as usize];
        raw[..16].copy_from_slice(&VHDX_PARENT_LOCATOR_TYPE.to_bytes_le());
        raw[18..20].copy_from_slice(&(pairs.len() as u16).to_le_bytes());
        let mut strings = Vec::new();
        let strings_at = LOCATOR_HEADER_SIZE as usize + pairs.len() * LOCATOR_ENTRY_SIZE as usize;
        for (k, v) in pairs {
            let (k, v) = (utf16(k), utf16(v));
            let key_at = strings_at + strings.len();
            strings.extend_from_slice(&k);
            let value_at = strings_at + strings.len();
            strings.extend_from_slice(&v);
            raw.extend_from_slice(&(key_at as u32).to_le_bytes());
            raw.extend_from_slice(&(value_at as u32).to_le_bytes());
            raw.extend_from_slice(&(k.len() as u16).to_le_bytes());
            raw.extend_from_slice(&(v.len() as u16).to_le_bytes());
        }
        raw.extend_from_slice(&strings);
        raw
    }

    #[test]
    fn test_guid_byte_layout() {
        assert_eq!(
            FILE_PARAMETERS.to_bytes_le(),
            [
                0x37, 0x67, 0xa1, 0xca, 0x36, 0xfa, 0x43, 0x4d, 0xb3, 0xb6, 0x33, 0xf0, 0xaa,
                0x44, 0xe7, 0x6b
            ]
        );
        assert_eq!(PARENT_LOCATOR.to_bytes_le()[..4], [0x2d, 0x5f, 0xd3, 0xa8]);
    }

    #[test]
    fn test_parent_locator() {
        let raw = locator(&[
            ("parent_linkage", "{01234567-89ab-cdef-0123-456789abcdef}"),
            ("relative_path", "..\\base.vhdx"),
            ("absolute_win32_path", "C:\\disks\\base.vhdx"),
            ("volume_path", "\\\\?\\Volume{x}\\disks\\base.vhdx"),
        ]);
        let link = read_parent_locator(&raw, 0).unwrap();
        assert_eq!(
            link.linkage.unwrap().to_string(),
            "01234567-89ab-cdef-0123-456789abcdef"
        );
        assert_eq!(link.path.as_deref(), Some("C:/disks/base.vhdx"));
        assert_eq!(
            link.volume_path.as_deref(),
            Some("\\\\?\\Volume{x}\\disks\\base.vhdx")
        );
    }

    #[test]
    fn test_unbraced_linkage_rejected() {
        let raw = locator(&[("parent_linkage", "01234567-89ab-cdef-0123-456789abcdef")]);
        assert!(matches!(
            read_parent_locator(&raw, 0).unwrap_err(),
            Error::Format { .. }
        ));
    }

    #[test]
    fn test_locator_value_out_of_bounds() {
        let mut raw = locator(&[("volume_path", "x")]);
        // Point the value far past the locator.
        raw[24..28].copy_from_slice(&0x1000u32.to_le_bytes());
        assert!(matches!(
            read_parent_locator(&raw, 3).unwrap_err(),
            Error::OutOfBounds { index: 3, .. }
        ));
    }
}
