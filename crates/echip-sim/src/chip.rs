//! Emulated 1-Wire memory chip
//!
//! Byte-level model of a scratchpad memory chip after it has been
//! addressed by a ROM command. Every byte the master sends gets the byte
//! the chip drives back; the wire carries the AND of both.

use std::mem;

use echip_core::image::{Page, MEMORY_SIZE, PAGE_SIZE};
use echip_core::RomId;
use log::trace;

/// Scratchpad size in bytes
pub const SCRATCHPAD_SIZE: usize = 32;

const WRITE_SCRATCHPAD: u8 = 0x0F;
const READ_SCRATCHPAD: u8 = 0xAA;
const COPY_SCRATCHPAD: u8 = 0x55;
const READ_MEMORY: u8 = 0xF0;

/// Authorization accepted flag of the E/S byte
const ES_AA: u8 = 0x80;
/// Ending offset bits of the E/S byte
const ES_OFFSET: u8 = 0x1F;

/// What the chip expects next after being addressed
#[derive(Debug, Clone)]
enum Function {
    Command,
    WriteAddress(Vec<u8>),
    WriteData { offset: usize },
    ReadScratchpad { position: usize, corrupt: bool },
    CopyAuthorization(Vec<u8>),
    Copied,
    ReadAddress(Vec<u8>),
    ReadMemory { address: usize },
    Ignored,
}

/// Memory chip on the emulated bus
#[derive(Debug, Clone)]
pub struct SimChip {
    id: RomId,
    memory: Vec<u8>,
    scratchpad: [u8; SCRATCHPAD_SIZE],
    target: u16,
    end_status: u8,
    function: Function,
    corrupt_reads: usize,
    copies: Vec<u16>,
}

impl SimChip {
    /// Chip with `size` bytes of erased (0xFF) memory
    pub fn new(id: RomId, size: usize) -> Self {
        Self {
            id,
            memory: vec![0xFF; size],
            scratchpad: [0xFF; SCRATCHPAD_SIZE],
            target: 0,
            end_status: 0,
            function: Function::Ignored,
            corrupt_reads: 0,
            copies: Vec::new(),
        }
    }

    /// 8 KiB data chip (family 0x0C) holding `pages`
    pub fn data_chip(serial: [u8; 6], pages: &[Page]) -> Self {
        let mut chip = Self::new(RomId::new(0x0C, serial), MEMORY_SIZE);
        chip.load(pages);
        chip
    }

    /// Overwrite memory from page 0 with `pages`.
    pub fn load(&mut self, pages: &[Page]) {
        for (dst, src) in self.memory.chunks_mut(PAGE_SIZE).zip(pages) {
            dst.copy_from_slice(&src[..dst.len()]);
        }
    }

    /// ROM id of the chip
    pub fn id(&self) -> RomId {
        self.id
    }

    /// Committed memory contents
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Committed memory as pages
    pub fn pages(&self) -> Vec<Page> {
        self.memory
            .chunks_exact(PAGE_SIZE)
            .map(|chunk| {
                let mut page = [0u8; PAGE_SIZE];
                page.copy_from_slice(chunk);
                page
            })
            .collect()
    }

    /// Target addresses of all committed scratchpad copies, in order
    pub fn copies(&self) -> &[u16] {
        &self.copies
    }

    /// Forget the recorded copies.
    pub fn clear_copies(&mut self) {
        self.copies.clear();
    }

    /// Corrupt the payload of the next `count` scratchpad reads.
    pub fn corrupt_scratchpad_reads(&mut self, count: usize) {
        self.corrupt_reads = count;
    }

    /// The chip was addressed by a ROM command.
    pub(crate) fn select(&mut self) {
        self.function = Function::Command;
    }

    /// The bus was reset.
    pub(crate) fn deselect(&mut self) {
        self.function = Function::Ignored;
    }

    /// One byte time slot: returns what the chip drives on the wire.
    pub(crate) fn exchange(&mut self, byte: u8) -> u8 {
        let (next, output) = match mem::replace(&mut self.function, Function::Ignored) {
            Function::Command => (self.start(byte), 0xFF),
            Function::WriteAddress(mut address) => {
                address.push(byte);
                if address.len() < 2 {
                    (Function::WriteAddress(address), 0xFF)
                } else {
                    self.target = u16::from_le_bytes([address[0], address[1]]);
                    let offset = usize::from(self.target) % SCRATCHPAD_SIZE;
                    self.end_status = offset as u8;
                    (Function::WriteData { offset }, 0xFF)
                }
            }
            Function::WriteData { offset } => {
                if offset < SCRATCHPAD_SIZE {
                    self.scratchpad[offset] = byte;
                    self.end_status = offset as u8;
                    (Function::WriteData { offset: offset + 1 }, 0xFF)
                } else {
                    (Function::Ignored, 0xFF)
                }
            }
            Function::ReadScratchpad { position, corrupt } => {
                let output = self.scratchpad_byte(position, corrupt);
                (
                    Function::ReadScratchpad {
                        position: position + 1,
                        corrupt,
                    },
                    output,
                )
            }
            Function::CopyAuthorization(mut authorization) => {
                authorization.push(byte);
                if authorization.len() < 3 {
                    (Function::CopyAuthorization(authorization), 0xFF)
                } else if self.copy(&authorization) {
                    (Function::Copied, 0xFF)
                } else {
                    (Function::Ignored, 0xFF)
                }
            }
            Function::Copied => (Function::Copied, 0xAA),
            Function::ReadAddress(mut address) => {
                address.push(byte);
                if address.len() < 2 {
                    (Function::ReadAddress(address), 0xFF)
                } else {
                    let address = usize::from(u16::from_le_bytes([address[0], address[1]]));
                    (Function::ReadMemory { address }, 0xFF)
                }
            }
            Function::ReadMemory { address } => {
                let output = self.memory.get(address).copied().unwrap_or(0xFF);
                (Function::ReadMemory { address: address + 1 }, output)
            }
            Function::Ignored => (Function::Ignored, 0xFF),
        };
        self.function = next;
        output
    }

    fn start(&mut self, command: u8) -> Function {
        trace!("{}: function {:#04x}", self.id, command);
        match command {
            WRITE_SCRATCHPAD => {
                self.end_status &= !ES_AA;
                Function::WriteAddress(Vec::with_capacity(2))
            }
            READ_SCRATCHPAD => {
                let corrupt = self.corrupt_reads > 0;
                self.corrupt_reads = self.corrupt_reads.saturating_sub(1);
                Function::ReadScratchpad {
                    position: 0,
                    corrupt,
                }
            }
            COPY_SCRATCHPAD => Function::CopyAuthorization(Vec::with_capacity(3)),
            READ_MEMORY => Function::ReadAddress(Vec::with_capacity(2)),
            _ => Function::Ignored,
        }
    }

    /// Byte `position` of a scratchpad read: TA1, TA2, E/S, then the data
    /// from the target offset to the ending offset.
    fn scratchpad_byte(&self, position: usize, corrupt: bool) -> u8 {
        let [ta1, ta2] = self.target.to_le_bytes();
        match position {
            0 => ta1,
            1 => ta2,
            2 => self.end_status,
            _ => {
                let index = usize::from(self.target) % SCRATCHPAD_SIZE + position - 3;
                if index > usize::from(self.end_status & ES_OFFSET) {
                    return 0xFF;
                }
                let byte = self.scratchpad[index];
                if corrupt && position == 3 {
                    byte ^ 0xFF
                } else {
                    byte
                }
            }
        }
    }

    /// Commit the scratchpad when the authorization matches.
    fn copy(&mut self, authorization: &[u8]) -> bool {
        let [ta1, ta2] = self.target.to_le_bytes();
        if authorization != [ta1, ta2, self.end_status] {
            trace!("{}: copy authorization {:02x?} rejected", self.id, authorization);
            return false;
        }

        let base = usize::from(self.target) & !(SCRATCHPAD_SIZE - 1);
        let start = usize::from(self.target) % SCRATCHPAD_SIZE;
        let end = usize::from(self.end_status & ES_OFFSET);
        for offset in start..=end {
            if let Some(cell) = self.memory.get_mut(base + offset) {
                *cell = self.scratchpad[offset];
            }
        }
        self.end_status |= ES_AA;
        self.copies.push(self.target);
        trace!("{}: copied scratchpad to {:#06x}", self.id, self.target);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(chip: &mut SimChip, bytes: &[u8]) -> Vec<u8> {
        bytes.iter().map(|&b| b & chip.exchange(b)).collect()
    }

    fn chip() -> SimChip {
        SimChip::new(RomId::new(0x0C, [1, 2, 3, 4, 5, 6]), MEMORY_SIZE)
    }

    #[test]
    fn test_scratchpad_cycle() {
        let mut chip = chip();

        chip.select();
        send(&mut chip, &[WRITE_SCRATCHPAD, 0x40, 0x00, 0xDE, 0xAD]);

        chip.select();
        let readback = send(&mut chip, &[READ_SCRATCHPAD, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&readback[1..], &[0x40, 0x00, 0x01, 0xDE, 0xAD, 0xFF]);

        chip.select();
        let tail = send(&mut chip, &[COPY_SCRATCHPAD, 0x40, 0x00, 0x01, 0xFF]);
        assert_eq!(tail[4], 0xAA);
        assert_eq!(&chip.memory()[0x40..0x42], &[0xDE, 0xAD]);
        assert_eq!(chip.copies(), &[0x40]);
    }

    #[test]
    fn test_copy_needs_matching_authorization() {
        let mut chip = chip();

        chip.select();
        send(&mut chip, &[WRITE_SCRATCHPAD, 0x20, 0x00, 0x11]);
        chip.select();
        send(&mut chip, &[COPY_SCRATCHPAD, 0x20, 0x00, 0x05]);

        assert_eq!(chip.memory()[0x20], 0xFF);
        assert!(chip.copies().is_empty());
    }

    #[test]
    fn test_corrupted_scratchpad_read() {
        let mut chip = chip();
        chip.corrupt_scratchpad_reads(1);

        chip.select();
        send(&mut chip, &[WRITE_SCRATCHPAD, 0x00, 0x00, 0x12]);
        chip.select();
        let first = send(&mut chip, &[READ_SCRATCHPAD, 0xFF, 0xFF, 0xFF, 0xFF]);
        chip.select();
        let second = send(&mut chip, &[READ_SCRATCHPAD, 0xFF, 0xFF, 0xFF, 0xFF]);

        assert_eq!(first[4], 0x12 ^ 0xFF);
        assert_eq!(second[4], 0x12);
    }

    #[test]
    fn test_read_memory() {
        let mut page = [0x55; PAGE_SIZE];
        page[0] = 0x01;
        let mut chip = SimChip::data_chip([9; 6], &[[0u8; PAGE_SIZE], page]);

        chip.select();
        let data = send(&mut chip, &[READ_MEMORY, 0x1F, 0x00, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&data[3..], &[0x00, 0x01, 0x55]);
    }

    #[test]
    fn test_unaddressed_chip_stays_passive() {
        let mut chip = chip();
        assert_eq!(
            send(&mut chip, &[READ_MEMORY, 0x00, 0x00, 0xFF]),
            vec![READ_MEMORY, 0, 0, 0xFF]
        );
    }
}
