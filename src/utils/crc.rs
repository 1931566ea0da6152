//! CRC validation for container pages.
//!
//! Provides the table-driven CRC-32 used to validate page integrity.
//!
//! Note: the page CRC is not a standard reflected CRC-32. It is computed
//! MSB-first with an initial value of zero and no final XOR, over the whole
//! page with the CRC field itself zeroed.

/// CRC algorithm specification with polynomial and initial value.
pub struct Algorithm<T> {
    poly: T,
    init: T,
}

/// CRC-32 algorithm for page validation.
///
/// Generator polynomial 0x04C11DB7, initial value 0, no final XOR,
/// MSB-first bit order.
pub const CRC_PAGE_ALG: Algorithm<u32> = Algorithm {
    poly: 0x04C1_1DB7,
    init: 0x0000_0000,
};

/// Computes an MSB-first CRC-32 over `len` bits of `value`.
#[inline(always)]
pub const fn crc32(poly: u32, mut value: u32, len: usize) -> u32 {
    value <<= 24;

    let mut i = 0;
    while i < len {
        value = (value << 1) ^ (((value >> 31) & 1) * poly);
        i += 1;
    }

    value
}

#[inline(always)]
const fn crc32_table(poly: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < table.len() {
        table[i] = crc32(poly, i as u32, 8);
        i += 1;
    }

    table
}

#[derive(Debug)]
pub struct Crc32 {
    pub poly: u32,
    pub init: u32,
    table: [u32; 256],
}

impl Crc32 {
    pub const fn new(algorithm: &Algorithm<u32>) -> Self {
        Self {
            poly: algorithm.poly,
            init: algorithm.init,
            table: crc32_table(algorithm.poly),
        }
    }

    const fn table_entry(&self, index: u32) -> u32 {
        self.table[(index & 0xFF) as usize]
    }

    #[inline(always)]
    pub const fn update(&self, mut crc: u32, bytes: &[u8]) -> u32 {
        let mut i = 0;

        while i < bytes.len() {
            crc = self.table_entry((crc >> 24) ^ bytes[i] as u32) ^ (crc << 8);
            i += 1;
        }

        crc
    }

    /// Computes the checksum of `bytes` from the algorithm's initial value.
    #[inline(always)]
    pub const fn checksum(&self, bytes: &[u8]) -> u32 {
        self.update(self.init, bytes)
    }
}

#[test]
fn page_crc_known_vector() {
    let crc = Crc32::new(&CRC_PAGE_ALG);

    // MSB-first CRC-32 of "123456789" with init 0 and no final XOR.
    assert_eq!(crc.checksum(b"123456789"), 0x89A1_897F);

    // Empty input stays at the initial value.
    assert_eq!(crc.checksum(&[]), 0);
}

#[test]
fn crc_update_is_incremental() {
    let crc = Crc32::new(&CRC_PAGE_ALG);

    let whole = crc.checksum(b"audiopipe");
    let split = crc.update(crc.update(crc.init, b"audio"), b"pipe");
    assert_eq!(whole, split);
}
