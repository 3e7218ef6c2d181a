//! CRC-32C (Castagnoli) used by self-checksummed VHDX structures.

/// Reflected form of the CRC-32C polynomial 0x1EDC6F41.
pub const CRC32C_POLYNOMIAL_REV: u32 = 0x82F6_3B78;

static TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut v = i as u32;
        let mut bit = 0;
        while bit < 8 {
            v = if v & 1 != 0 {
                (v >> 1) ^ CRC32C_POLYNOMIAL_REV
            } else {
                v >> 1
            };
            bit += 1;
        }
        table[i] = v;
        i += 1;
    }
    table
}

/// Computes the CRC-32C of `data`.
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c_skip(data, None)
}

/// Computes the CRC-32C of `data` with the 4-byte window containing byte
/// offset `skip` read as zeros.
///
/// Structures that store their own checksum are hashed with the checksum
/// field zeroed; the field's bytes still take part in the computation.
pub fn crc32c_skip(data: &[u8], skip: Option<usize>) -> u32 {
    let window = skip.map(|s| s / 4);
    let mut crc = u32::MAX;
    for (i, &byte) in data.iter().enumerate() {
        let val = if Some(i / 4) == window { 0 } else { byte };
        crc = (crc >> 8) ^ TABLE[((crc as u8) ^ val) as usize];
    }
    !crc
}
