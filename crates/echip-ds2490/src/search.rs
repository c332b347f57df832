//! 1-Wire ROM search
//!
//! Binary-tree walk over the 64 id bits of every device on the bus (Maxim
//! application note 187). Each pass resets the bus, then for every bit reads
//! the wired-AND of all remaining devices' bit and of its complement and
//! writes back the branch to follow. Devices on the other branch drop out
//! until the next reset. The last branch point where 0 was taken is
//! remembered, so the next pass takes 1 there and finds the next device.

use std::future::Future;

use echip_core::RomId;
use log::trace;

use crate::error::Result;

/// Bit-level bus access needed by a ROM search
pub trait SearchBus {
    /// Reset the bus and send the search ROM command.
    fn begin(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Read one time slot.
    fn read_bit(&mut self) -> impl Future<Output = Result<bool>> + Send;

    /// Write one time slot.
    fn write_bit(&mut self, bit: bool) -> impl Future<Output = Result<()>> + Send;
}

/// State of an enumeration, kept between passes
#[derive(Debug, Clone, Default)]
pub struct RomSearch {
    /// Bit position (1–64) of the branch to take 1 at next; 0 before the first pass
    last_discrepancy: usize,
    /// No further devices in this enumeration
    last_device: bool,
    /// Id found by the previous pass
    rom: [u8; 8],
}

impl RomSearch {
    /// Start a new enumeration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the enumeration has ended.
    pub fn is_finished(&self) -> bool {
        self.last_device
    }

    /// Run one pass and return the next device id.
    ///
    /// Returns `None` once every device was reported, and also when a pass
    /// fails (no device answered, or the assembled id has a bad CRC); a
    /// failed pass ends the enumeration.
    pub async fn next<B: SearchBus>(&mut self, bus: &mut B) -> Result<Option<RomId>> {
        if self.last_device {
            return Ok(None);
        }

        bus.begin().await?;

        let mut last_zero = 0;
        for bit_number in 1..=64 {
            let byte = (bit_number - 1) / 8;
            let mask = 1u8 << ((bit_number - 1) % 8);

            let id_bit = bus.read_bit().await?;
            let complement = bus.read_bit().await?;

            let direction = match (id_bit, complement) {
                (true, true) => {
                    trace!("ROM search: no response at bit {}", bit_number);
                    self.last_device = true;
                    return Ok(None);
                }
                (bit, complement) if bit != complement => bit,
                _ => {
                    let direction = if bit_number < self.last_discrepancy {
                        self.rom[byte] & mask != 0
                    } else {
                        bit_number == self.last_discrepancy
                    };
                    if !direction {
                        last_zero = bit_number;
                    }
                    direction
                }
            };

            if direction {
                self.rom[byte] |= mask;
            } else {
                self.rom[byte] &= !mask;
            }
            bus.write_bit(direction).await?;
        }

        let rom = RomId::from_bytes(self.rom);
        if !rom.is_valid() {
            trace!("ROM search: invalid id {}", rom);
            self.last_device = true;
            return Ok(None);
        }

        self.last_discrepancy = last_zero;
        if last_zero == 0 {
            self.last_device = true;
        }
        Ok(Some(rom))
    }

    /// Run passes until the enumeration ends and collect every id found.
    pub async fn all<B: SearchBus>(mut self, bus: &mut B) -> Result<Vec<RomId>> {
        let mut found = Vec::new();
        while let Some(rom) = self.next(bus).await? {
            if found.contains(&rom) {
                break;
            }
            found.push(rom);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wired-AND bus of ideal devices
    struct MockBus {
        devices: Vec<RomId>,
        active: Vec<bool>,
        bit: usize,
        complement_next: bool,
        passes: usize,
    }

    impl MockBus {
        fn new(devices: Vec<RomId>) -> Self {
            let active = vec![true; devices.len()];
            Self {
                devices,
                active,
                bit: 0,
                complement_next: false,
                passes: 0,
            }
        }

        fn device_bit(rom: &RomId, bit: usize) -> bool {
            rom.as_bytes()[bit / 8] & (1 << (bit % 8)) != 0
        }
    }

    impl SearchBus for MockBus {
        async fn begin(&mut self) -> Result<()> {
            self.active = vec![true; self.devices.len()];
            self.bit = 0;
            self.complement_next = false;
            self.passes += 1;
            Ok(())
        }

        async fn read_bit(&mut self) -> Result<bool> {
            let complement = self.complement_next;
            self.complement_next = !complement;
            Ok(self
                .devices
                .iter()
                .zip(&self.active)
                .filter(|(_, active)| **active)
                .all(|(rom, _)| Self::device_bit(rom, self.bit) != complement))
        }

        async fn write_bit(&mut self, bit: bool) -> Result<()> {
            for (rom, active) in self.devices.iter().zip(self.active.iter_mut()) {
                if Self::device_bit(rom, self.bit) != bit {
                    *active = false;
                }
            }
            self.bit += 1;
            Ok(())
        }
    }

    fn population() -> Vec<RomId> {
        vec![
            RomId::new(0x0C, [0x01, 0, 0, 0, 0, 0]),
            RomId::new(0x0C, [0x02, 0, 0, 0, 0, 0]),
            RomId::new(0x24, [0x01, 0, 0, 0, 0, 0]),
            RomId::new(0x2D, [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]),
            RomId::new(0x0C, [0x03, 0x80, 0, 0, 0x10, 0]),
        ]
    }

    #[tokio::test]
    async fn test_enumerates_each_device_once() {
        let devices = population();
        let mut bus = MockBus::new(devices.clone());

        let mut found = RomSearch::new().all(&mut bus).await.unwrap();
        found.sort();
        let mut expected = devices;
        expected.sort();

        assert_eq!(found, expected);
        assert_eq!(bus.passes, expected.len());
    }

    #[tokio::test]
    async fn test_last_device_flag() {
        let mut bus = MockBus::new(population());
        let mut search = RomSearch::new();

        for _ in 0..population().len() {
            assert!(!search.is_finished());
            assert!(search.next(&mut bus).await.unwrap().is_some());
        }
        assert!(search.is_finished());
        assert_eq!(search.next(&mut bus).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_single_device() {
        let rom = RomId::new(0x0C, [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
        let mut bus = MockBus::new(vec![rom]);
        let mut search = RomSearch::new();

        assert_eq!(search.next(&mut bus).await.unwrap(), Some(rom));
        assert!(search.is_finished());
    }

    #[tokio::test]
    async fn test_empty_bus() {
        let mut bus = MockBus::new(Vec::new());
        let mut search = RomSearch::new();

        assert_eq!(search.next(&mut bus).await.unwrap(), None);
        assert!(search.is_finished());
    }

    #[tokio::test]
    async fn test_bad_crc_ends_search() {
        let mut bytes = *RomId::new(0x0C, [1, 2, 3, 4, 5, 6]).as_bytes();
        bytes[7] ^= 0xFF;
        let mut bus = MockBus::new(vec![RomId::from_bytes(bytes)]);

        assert!(RomSearch::new().all(&mut bus).await.unwrap().is_empty());
    }
}
