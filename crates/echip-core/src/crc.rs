//! Cyclic redundancy checks used by 1-Wire chips
//!
//! Both checks are from the Maxim/Dallas reflected family:
//! - CRC16 (polynomial 0xA001, LSB first) protects each memory page
//! - CRC8 (polynomial 0x8C, LSB first) protects each ROM id

use crate::image::{Page, PAGE_DATA_SIZE};

/// Register value left after running the CRC16 over a page whose trailing
/// two bytes hold the complemented checksum.
pub const CRC16_RESIDUE: u16 = 0xB001;

/// Accumulate a slice of bytes into a CRC16 value.
pub fn crc16(init: u16, data: &[u8]) -> u16 {
    data.iter().fold(init, |acc, b| crc16_byte(acc, *b))
}

/// Accumulate a single byte into a CRC16 value, one nibble at a time.
fn crc16_byte(mut crc: u16, b: u8) -> u16 {
    const CRC_TABLE: [u16; 16] = [
        0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
        0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
    ];

    let tmp = CRC_TABLE[(crc & 0xF) as usize];
    crc = (crc >> 4) & 0x0FFF;
    crc = crc ^ tmp ^ CRC_TABLE[(b & 0xF) as usize];

    let tmp = CRC_TABLE[(crc & 0xF) as usize];
    crc = (crc >> 4) & 0x0FFF;
    crc ^ tmp ^ CRC_TABLE[((b >> 4) & 0xF) as usize]
}

/// Check a page against the checksum stored in its last two bytes.
pub fn crc16_valid(page: &Page) -> bool {
    crc16(0, page) == CRC16_RESIDUE
}

/// Compute and store the checksum of a page's first 30 bytes.
pub fn stamp_crc16(page: &mut Page) {
    let crc = crc16(0, &page[..PAGE_DATA_SIZE]) ^ 0xFFFF;
    page[PAGE_DATA_SIZE..].copy_from_slice(&crc.to_le_bytes());
}

/// Dallas/Maxim CRC8 of a byte slice.
///
/// Running it over a complete ROM id (CRC byte included) yields zero.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |mut crc, &byte| {
        let mut b = byte;
        for _ in 0..8 {
            let mix = (crc ^ b) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            b >>= 1;
        }
        crc
    })
}
