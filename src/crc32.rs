/// Reflected CRC-32C (Castagnoli) polynomial used for all E57 page checksums.
#[cfg(any(test, not(feature = "crc32c")))]
const POLYNOMIAL: u32 = 0x82_F6_3B_78;

#[cfg(not(feature = "crc32c"))]
const TABLE: [u32; 256] = build_table();

#[cfg(not(feature = "crc32c"))]
const fn build_table() -> [u32; 256] {
    let mut table = [0_u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut val = i as u32;
        let mut bit = 0;
        while bit < 8 {
            val = if val & 1 == 0 {
                val >> 1
            } else {
                (val >> 1) ^ POLYNOMIAL
            };
            bit += 1;
        }
        table[i] = val;
        i += 1;
    }
    table
}

/// Calculates the CRC-32C checksum of the given data.
pub fn checksum(data: &[u8]) -> u32 {
    // Simple & slower default included SW implementation
    #[cfg(not(feature = "crc32c"))]
    let sum = !data.iter().fold(!0_u32, |sum, &next| {
        TABLE[((sum ^ next as u32) & 0xFF) as usize] ^ (sum >> 8)
    });

    // Optional faster external crate with HW support
    #[cfg(feature = "crc32c")]
    let sum = crc32c::crc32c(data);

    sum
}

/// Checksum bytes as they are stored at the end of each physical page.
///
/// All other binary values in E57 files are little endian,
/// but the page checksum is stored in big endian order.
pub fn checksum_bytes(data: &[u8]) -> [u8; 4] {
    checksum(data).to_be_bytes()
}
