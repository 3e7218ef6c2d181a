//! VHDX header section: file type identifier, the two headers and the two
//! region table copies.

use tracing::warn;
use uuid::{uuid, Uuid};

use crate::bounds::{bytes16, le_u16, le_u32, le_u64, slice_at};
use crate::checksum::crc32c_skip;
use crate::error::{Error, Result};

/// File type identifier signature at offset 0.
pub const FILE_SIGNATURE: &[u8; 8] = b"vhdxfile";

/// "head" as a little-endian u32.
pub const HEADER_SIGNATURE: u32 = 0x6461_6568;

/// "regi" as a little-endian u32.
pub const REGION_SIGNATURE: u32 = 0x6967_6572;

/// Offsets of the two header copies.
pub const HEADER_OFFSETS: [u64; 2] = [64 * 1024, 128 * 1024];

/// Offsets of the two region table copies.
pub const REGION_TABLE_OFFSETS: [u64; 2] = [192 * 1024, 256 * 1024];

pub const HEADER_SIZE: u64 = 4096;
pub const REGION_TABLE_SIZE: u64 = 64 * 1024;

/// Block Allocation Table region.
pub const BAT_REGION: Uuid = uuid!("2DC27766-F623-4200-9D64-115E9BFD4A08");

/// Metadata region.
pub const METADATA_REGION: Uuid = uuid!("8B7CA206-4790-4B9A-B8FE-575F050F886E");

const HEADER_VERSION: u16 = 1;
const MAX_REGION_ENTRIES: u32 = 2047;
const REGION_ENTRY_SIZE: usize = 32;
const CHECKSUM_OFFSET: usize = 4;

/// The active VHDX header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdxHeader {
    pub sequence_number: u64,
    pub version: u16,
    pub file_write_guid: Uuid,
    pub data_write_guid: Uuid,
    pub log_guid: Uuid,
}

/// Location of one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub file_offset: u64,
    pub length: u64,
}

/// The two regions every supported image carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Regions {
    pub bat: Region,
    pub metadata: Region,
}

/// Checks the file type identifier.
pub fn check_identifier(data: &[u8]) -> Result<()> {
    if data.starts_with(FILE_SIGNATURE) {
        Ok(())
    } else {
        Err(Error::format("missing VHDX file type identifier"))
    }
}

/// Reads a self-checksummed structure, or says why it is unusable.
fn verified<'a>(
    data: &'a [u8],
    offset: u64,
    len: u64,
    signature: u32,
    structure: &'static str,
) -> Result<&'a [u8]> {
    let raw = slice_at(data, offset, len, 0)?;
    let found = le_u32(raw, 0);
    if found != signature {
        return Err(Error::format(format!(
            "{structure} at {offset:#x} has signature {found:#x}"
        )));
    }
    let stored = le_u32(raw, CHECKSUM_OFFSET);
    let computed = crc32c_skip(raw, Some(CHECKSUM_OFFSET));
    if stored != computed {
        return Err(Error::Checksum {
            structure,
            stored,
            computed,
        });
    }
    Ok(raw)
}

/// Picks the first usable copy in `candidates`, or returns the first copy's
/// failure when neither is usable.
fn first_valid<T>(
    candidates: impl IntoIterator<Item = Result<T>>,
    structure: &str,
) -> Result<T> {
    let mut first_error = None;
    for (copy, candidate) in candidates.into_iter().enumerate() {
        match candidate {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{structure} copy {copy} skipped: {e}");
                first_error.get_or_insert(e);
            }
        }
    }
    Err(first_error.unwrap_or_else(|| Error::format(format!("no valid {structure}"))))
}

fn read_header_copy(data: &[u8], offset: u64) -> Result<VhdxHeader> {
    let raw = verified(data, offset, HEADER_SIZE, HEADER_SIGNATURE, "VHDX header")?;
    Ok(VhdxHeader {
        sequence_number: le_u64(raw, 8),
        version: le_u16(raw, 66),
        file_write_guid: Uuid::from_bytes_le(bytes16(raw, 16)),
        data_write_guid: Uuid::from_bytes_le(bytes16(raw, 32)),
        log_guid: Uuid::from_bytes_le(bytes16(raw, 48)),
    })
}

/// Selects the valid header copy with the higher sequence number.
///
/// A copy is valid when its signature and checksum match; the version is
/// checked on the selected copy only.
pub fn read_header(data: &[u8]) -> Result<VhdxHeader> {
    let header = match HEADER_OFFSETS.map(|offset| read_header_copy(data, offset)) {
        // Ties go to the second copy.
        [Ok(first), Ok(second)] => {
            if first.sequence_number > second.sequence_number {
                first
            } else {
                second
            }
        }
        copies => first_valid(copies, "VHDX header")?,
    };

    if header.version != HEADER_VERSION {
        return Err(Error::unsupported(format!(
            "VHDX header version {}",
            header.version
        )));
    }

    if !header.log_guid.is_nil() {
        return Err(Error::unsupported("VHDX log replay"));
    }
    Ok(header)
}

fn parse_region_table(raw: &[u8]) -> Result<Regions> {
    let count = le_u32(raw, 8);
    if count > MAX_REGION_ENTRIES {
        return Err(Error::format(format!("VHDX region table has {count} entries")));
    }

    let mut bat = None;
    let mut metadata = None;
    for i in 0..count as usize {
        let entry = &raw[16 + i * REGION_ENTRY_SIZE..16 + (i + 1) * REGION_ENTRY_SIZE];
        let guid = Uuid::from_bytes_le(bytes16(entry, 0));
        let region = Region {
            file_offset: le_u64(entry, 16),
            length: le_u32(entry, 24).into(),
        };
        let required = le_u32(entry, 28) & 1 != 0;

        if guid == BAT_REGION {
            bat = Some(region);
        } else if guid == METADATA_REGION {
            metadata = Some(region);
        } else if required {
            return Err(Error::unsupported(format!("required VHDX region {guid}")));
        }
    }

    match (bat, metadata) {
        (Some(bat), Some(metadata)) => Ok(Regions { bat, metadata }),
        _ => Err(Error::format("VHDX BAT or metadata region missing")),
    }
}

/// Reads the region table, falling back to the second copy when the first
/// fails its signature or checksum.
pub fn read_regions(data: &[u8]) -> Result<Regions> {
    let copies = REGION_TABLE_OFFSETS.iter().map(|&offset| {
        verified(
            data,
            offset,
            REGION_TABLE_SIZE,
            REGION_SIGNATURE,
            "VHDX region table",
        )
    });
    let raw = first_valid(copies, "VHDX region table")?;
    parse_region_table(raw)
}
