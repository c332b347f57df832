//! 1-Wire ROM ids

use std::fmt;

use crate::crc::crc8;

/// 8-byte identifier of a device on the bus
///
/// Byte 0 is the family code, bytes 1–6 the serial number and byte 7 the
/// CRC8 of the first seven bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RomId([u8; 8]);

impl RomId {
    /// Wrap raw id bytes as read from the bus.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Build an id for the given family and serial number, computing its CRC.
    pub fn new(family: u8, serial: [u8; 6]) -> Self {
        let mut bytes = [0u8; 8];
        bytes[0] = family;
        bytes[1..7].copy_from_slice(&serial);
        bytes[7] = crc8(&bytes[..7]);
        Self(bytes)
    }

    /// Raw id bytes, family code first.
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Family code byte.
    pub const fn family_code(&self) -> u8 {
        self.0[0]
    }

    /// Family of chip this id belongs to, if it is one we handle.
    pub fn family(&self) -> Option<ChipFamily> {
        ChipFamily::from_code(self.family_code())
    }

    /// Whether the CRC byte matches and the family code is non-zero.
    pub fn is_valid(&self) -> bool {
        self.0[0] != 0 && crc8(&self.0) == 0
    }
}

impl From<[u8; 8]> for RomId {
    fn from(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for RomId {
    /// Most significant (CRC) byte first, as printed on the chip's can.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter().rev() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// Chip families found in exercise-machine consoles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipFamily {
    /// 64 kbit memory chip carrying workout data (family 0x0C)
    Data,
    /// Real-time clock chip (family 0x24)
    Clock,
    /// EEPROM chip carrying the console's timezone (family 0x2D)
    Timezone,
}

impl ChipFamily {
    /// Look up a family code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x0C => Some(ChipFamily::Data),
            0x24 => Some(ChipFamily::Clock),
            0x2D => Some(ChipFamily::Timezone),
            _ => None,
        }
    }

    /// Family code byte.
    pub fn code(self) -> u8 {
        match self {
            ChipFamily::Data => 0x0C,
            ChipFamily::Clock => 0x24,
            ChipFamily::Timezone => 0x2D,
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChipFamily::Data => write!(f, "Data chip"),
            ChipFamily::Clock => write!(f, "(RTC) Blue chip"),
            ChipFamily::Timezone => write!(f, "(Timezone) Green chip"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rom_is_valid() {
        let rom = RomId::new(0x0C, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert!(rom.is_valid());
        assert_eq!(rom.family(), Some(ChipFamily::Data));
    }

    #[test]
    fn test_zero_family_is_invalid() {
        assert!(!RomId::from_bytes([0; 8]).is_valid());
    }

    #[test]
    fn test_display_reverses_bytes() {
        let rom = RomId::from_bytes([0x0C, 1, 2, 3, 4, 5, 6, 0xAB]);
        assert_eq!(rom.to_string(), "AB0605040302010C");
    }

    #[test]
    fn test_family_codes() {
        for family in [ChipFamily::Data, ChipFamily::Clock, ChipFamily::Timezone] {
            assert_eq!(ChipFamily::from_code(family.code()), Some(family));
        }
        assert_eq!(ChipFamily::from_code(0x28), None);
    }
}
