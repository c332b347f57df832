//! DS2490 protocol constants
//!
//! The DS2490 takes its commands as vendor control requests on endpoint 0.
//! The request number picks the command class, `value` carries the command
//! code plus flag bits and `index` its parameter. Bus data moves through the
//! bulk pipes, status through the interrupt pipe.

#![allow(dead_code)]

use std::time::Duration;

// USB device identifiers
pub const DS2490_USB_VENDOR: u16 = 0x04FA;
pub const DS2490_USB_PRODUCT: u16 = 0x2490;

// Configuration 1, interface 0, alternate setting 1 (large bulk packets)
pub const CONFIGURATION: u8 = 1;
pub const INTERFACE: u8 = 0;
pub const ALTERNATE_SETTING: u8 = 1;

// Endpoints of alternate setting 1
pub const STATUS_EP: u8 = 0x81;
pub const BULK_OUT_EP: u8 = 0x02;
pub const BULK_IN_EP: u8 = 0x83;

/// Bytes requested from the status endpoint
pub const STATUS_LEN: usize = 32;

// Request numbers (command classes)
pub const CONTROL_CMD: u8 = 0x00;
pub const COMM_CMD: u8 = 0x01;
pub const MODE_CMD: u8 = 0x02;

// CONTROL_CMD values
pub const CTL_RESET_DEVICE: u16 = 0x0000;
pub const CTL_START_EXE: u16 = 0x0001;
pub const CTL_RESUME_EXE: u16 = 0x0002;
pub const CTL_HALT_EXE_IDLE: u16 = 0x0003;
pub const CTL_FLUSH_COMM_CMDS: u16 = 0x0007;
pub const CTL_FLUSH_RCV_BUFFER: u16 = 0x0008;
pub const CTL_FLUSH_XMT_BUFFER: u16 = 0x0009;

// MODE_CMD values
pub const MOD_PULSE_EN: u16 = 0x0000;
pub const MOD_SPEED_CHANGE_EN: u16 = 0x0001;
pub const MOD_1WIRE_SPEED: u16 = 0x0002;

// MOD_1WIRE_SPEED parameters
pub const SPEED_STANDARD: u16 = 0x0001;
pub const SPEED_OVERDRIVE: u16 = 0x0002;

// COMM_CMD command codes
pub const COMM_BIT_IO: u16 = 0x0020;
pub const COMM_1_WIRE_RESET: u16 = 0x0042;
pub const COMM_BYTE_IO: u16 = 0x0052;
pub const COMM_MATCH_ACCESS: u16 = 0x0064;
pub const COMM_BLOCK_IO: u16 = 0x0074;
pub const COMM_SEARCH_ACCESS: u16 = 0x00F4;

/// Bits of a COMM_CMD value naming the command
pub const COMM_CMD_MASK: u16 = 0x00F6;

// COMM_CMD flag bits
pub const COMM_IM: u16 = 0x0001;
pub const COMM_D: u16 = 0x0008;
pub const COMM_SE: u16 = 0x0008;
pub const COMM_RST: u16 = 0x0100;
pub const COMM_ICP: u16 = 0x0200;
pub const COMM_NTF: u16 = 0x0400;
pub const COMM_F: u16 = 0x0800;
pub const COMM_SPU: u16 = 0x1000;

/// 1-Wire reset with presence detect, speed change enabled
pub const RESET_VALUE: u16 = COMM_1_WIRE_RESET | COMM_F | COMM_NTF | COMM_SE | COMM_IM;
/// Parameter of the 1-Wire reset request
pub const RESET_INDEX: u16 = 0x0001;
/// Block transfer of the bytes queued on the bulk OUT pipe
pub const BLOCK_IO_VALUE: u16 = COMM_BLOCK_IO | COMM_SPU | COMM_IM;
/// Match access; the ROM id follows on the bulk OUT pipe
pub const MATCH_ACCESS_VALUE: u16 = COMM_MATCH_ACCESS | COMM_IM;

// ROM function commands, as MATCH_ACCESS parameters
pub const ROM_MATCH: u8 = 0x55;
pub const ROM_SKIP: u8 = 0xCC;
pub const ROM_SEARCH: u8 = 0xF0;
pub const ROM_OVERDRIVE_MATCH: u8 = 0x69;
pub const ROM_OVERDRIVE_SKIP: u8 = 0x3C;

// Memory function commands
pub const MEM_WRITE_SCRATCHPAD: u8 = 0x0F;
pub const MEM_READ_SCRATCHPAD: u8 = 0xAA;
pub const MEM_COPY_SCRATCHPAD: u8 = 0x55;
pub const MEM_READ_MEMORY: u8 = 0xF0;

/// Scratchpad size of the memory chips
pub const SCRATCHPAD_SIZE: usize = 32;
/// Largest payload sent or received in one bulk transfer
pub const CHUNK_SIZE: usize = 16;
/// Scratchpad write/verify cycles before giving up on a page
pub const VERIFY_CYCLES: usize = 3;

/// Status polls before a busy command buffer is reported
pub const STATUS_POLLS: usize = 20;
/// Pause between status polls
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// ROM command to address a chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RomCommand {
    /// Address one chip by id
    Match,
    /// Address every chip on the bus
    Skip,
    /// Start a ROM search
    Search,
    /// Address one chip by id and switch it to overdrive
    OverdriveMatch,
    /// Address every chip and switch them to overdrive
    OverdriveSkip,
}

impl RomCommand {
    /// Function byte sent on the bus
    pub fn code(self) -> u8 {
        match self {
            RomCommand::Match => ROM_MATCH,
            RomCommand::Skip => ROM_SKIP,
            RomCommand::Search => ROM_SEARCH,
            RomCommand::OverdriveMatch => ROM_OVERDRIVE_MATCH,
            RomCommand::OverdriveSkip => ROM_OVERDRIVE_SKIP,
        }
    }

    /// Match command at the requested speed
    pub fn matching(overdrive: bool) -> Self {
        if overdrive {
            RomCommand::OverdriveMatch
        } else {
            RomCommand::Match
        }
    }

    /// Whether the command carries a target id
    pub fn addresses_one(self) -> bool {
        matches!(self, RomCommand::Match | RomCommand::OverdriveMatch)
    }

    /// Whether the command leaves the bus at overdrive speed
    pub fn is_overdrive(self) -> bool {
        matches!(self, RomCommand::OverdriveMatch | RomCommand::OverdriveSkip)
    }
}

/// Bit I/O request value
pub const fn bit_io_value(bit: bool, read_back: bool) -> u16 {
    let mut value = COMM_BIT_IO | COMM_IM;
    if bit {
        value |= COMM_D;
    }
    if !read_back {
        value |= COMM_ICP;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_values() {
        assert_eq!(RESET_VALUE, 0x0C4B);
        assert_eq!(BLOCK_IO_VALUE, 0x1075);
        assert_eq!(RESET_VALUE & COMM_CMD_MASK, COMM_1_WIRE_RESET);
        assert_eq!(BLOCK_IO_VALUE & COMM_CMD_MASK, COMM_BLOCK_IO);
        assert_eq!(MATCH_ACCESS_VALUE & COMM_CMD_MASK, COMM_MATCH_ACCESS);
        assert_eq!(bit_io_value(true, true) & COMM_CMD_MASK, COMM_BIT_IO);
    }

    #[test]
    fn test_bit_io_flags() {
        assert_eq!(bit_io_value(true, true), 0x0029);
        assert_eq!(bit_io_value(false, false), 0x0221);
        assert_eq!(bit_io_value(true, false), 0x0229);
    }
}
