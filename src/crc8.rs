//! Table-driven CRC-8 used by the fixture's control protocol.
//!
//! Polynomial 0xD5, initial value 0x00, no input/output reflection and no
//! final xor. Because nothing is xored out, running the checksum over a
//! buffer followed by its own CRC always yields [`CHECK_SENTINEL`].

/// Generator polynomial of the fixture protocol.
pub const POLYNOMIAL: u8 = 0xD5;

/// Value produced by `checksum(data ++ [checksum(data)])` for any `data`.
pub const CHECK_SENTINEL: u8 = 0x00;

const fn generate_table(polynomial: u8) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ polynomial
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static TABLE: [u8; 256] = generate_table(POLYNOMIAL);

/// Computes the CRC-8 of `data`.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |crc, &byte| TABLE[(crc ^ byte) as usize])
}

/// Returns true if the last byte of `frame` is the CRC of everything before it.
pub fn verify(frame: &[u8]) -> bool {
    match frame.split_last() {
        Some((&crc, body)) => checksum(body) == crc,
        None => false,
    }
}
