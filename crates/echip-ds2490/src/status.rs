//! DS2490 status register
//!
//! The interrupt pipe returns 16 fixed bytes of device state followed by
//! up to 16 result codes of completed commands.

use bitflags::bitflags;

/// Offset of the device status flags
const DEVICE_FLAGS_OFFSET: usize = 8;
/// Offset of the command buffer fill level
const COMMAND_BUFFER_OFFSET: usize = 11;
/// Offset of the bulk OUT FIFO fill level
const WRITE_BUFFER_OFFSET: usize = 12;
/// Offset of the bulk IN FIFO fill level
const READ_BUFFER_OFFSET: usize = 13;
/// Offset of the first result code
const RESULTS_OFFSET: usize = 16;

/// Result code reporting a newly arrived 1-Wire device
pub const DEVICE_DETECT: u8 = 0xA5;

bitflags! {
    /// Device status flags (byte 8)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u8 {
        /// Strong pull-up to 5V active
        const SPUA = 0x01;
        /// 12V programming pulse active
        const PRGA = 0x02;
        /// 12V present
        const PMOD_12V = 0x04;
        /// Power mode: external supply
        const PMOD = 0x08;
        /// Command execution halted
        const HALT = 0x10;
        /// Idle
        const IDLE = 0x20;
        /// Endpoint 0 FIFO full
        const EP0F = 0x80;
    }
}

bitflags! {
    /// Error bits of a command result code
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResultFlags: u8 {
        /// No presence pulse after a reset
        const NRS = 0x01;
        /// Short to ground detected
        const SH = 0x02;
        /// Alarming presence pulse
        const APP = 0x04;
        /// 12V missing for a programming pulse
        const VPP = 0x08;
        /// Compare error on a write verify
        const CMP = 0x10;
        /// CRC error
        const CRC = 0x20;
        /// Redirected page
        const RDP = 0x40;
        /// End of search: no further devices
        const EOS = 0x80;
    }
}

/// One decoded result code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// A device was attached to the bus
    DeviceDetect,
    /// A command finished with these error bits
    Completed(ResultFlags),
}

/// Snapshot of the adapter's status register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Device state flags
    pub flags: DeviceFlags,
    /// Commands still queued
    pub command_buffer: u8,
    /// Bytes waiting in the bulk OUT FIFO
    pub write_buffer: u8,
    /// Bytes waiting in the bulk IN FIFO
    pub read_buffer: u8,
    /// Result codes of commands completed since the last poll
    pub results: Vec<ResultCode>,
}

impl Status {
    /// Decode a status transfer. Returns `None` when it is too short to
    /// carry the fixed part.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < RESULTS_OFFSET {
            return None;
        }

        let results = raw[RESULTS_OFFSET..]
            .iter()
            .map(|&code| match code {
                DEVICE_DETECT => ResultCode::DeviceDetect,
                bits => ResultCode::Completed(ResultFlags::from_bits_retain(bits)),
            })
            .collect();

        Some(Self {
            flags: DeviceFlags::from_bits_retain(raw[DEVICE_FLAGS_OFFSET]),
            command_buffer: raw[COMMAND_BUFFER_OFFSET],
            write_buffer: raw[WRITE_BUFFER_OFFSET],
            read_buffer: raw[READ_BUFFER_OFFSET],
            results,
        })
    }

    /// No commands left in the command buffer
    pub fn is_buffer_clear(&self) -> bool {
        self.command_buffer == 0
    }

    /// Error bits of all completed commands, merged
    pub fn errors(&self) -> ResultFlags {
        self.results
            .iter()
            .fold(ResultFlags::empty(), |acc, code| match code {
                ResultCode::Completed(flags) => acc | *flags,
                ResultCode::DeviceDetect => acc,
            })
    }

    /// A completed command reported a short on the bus
    pub fn short_detected(&self) -> bool {
        self.errors().contains(ResultFlags::SH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(command_buffer: u8, results: &[u8]) -> Vec<u8> {
        let mut raw = vec![0u8; RESULTS_OFFSET];
        raw[DEVICE_FLAGS_OFFSET] = DeviceFlags::IDLE.bits();
        raw[COMMAND_BUFFER_OFFSET] = command_buffer;
        raw.extend_from_slice(results);
        raw
    }

    #[test]
    fn test_idle_status() {
        let status = Status::parse(&raw(0, &[])).unwrap();
        assert!(status.is_buffer_clear());
        assert!(status.flags.contains(DeviceFlags::IDLE));
        assert!(!status.short_detected());
        assert!(status.results.is_empty());
    }

    #[test]
    fn test_result_codes() {
        let status = Status::parse(&raw(2, &[DEVICE_DETECT, 0x01, 0x02])).unwrap();
        assert!(!status.is_buffer_clear());
        assert_eq!(status.results[0], ResultCode::DeviceDetect);
        assert_eq!(status.errors(), ResultFlags::NRS | ResultFlags::SH);
        assert!(status.short_detected());
    }

    #[test]
    fn test_device_detect_is_not_a_short() {
        let status = Status::parse(&raw(0, &[DEVICE_DETECT])).unwrap();
        assert!(!status.short_detected());
    }

    #[test]
    fn test_truncated_status() {
        assert!(Status::parse(&[0u8; 15]).is_none());
    }
}
