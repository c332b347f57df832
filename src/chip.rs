//! Chip dispatch by family code

use echip_core::transport::Transport;
use echip_core::{ChipFamily, RomId};
use echip_ds2490::OneWireAdapter;
use log::debug;

use crate::clock_chip::ClockChip;
use crate::data_chip::DataChip;
use crate::error::{ChipError, Result};
use crate::timezone_chip::TimezoneChip;

/// A chip detected on the bus
pub enum Chip<T: Transport> {
    /// Workout data chip
    Data(DataChip<T>),
    /// Real-time clock chip
    Clock(ClockChip<T>),
    /// Timezone chip
    Timezone(TimezoneChip<T>),
}

impl<T: Transport> Chip<T> {
    /// Wrap a detected id. Returns `None` for families we don't handle.
    pub fn new(adapter: OneWireAdapter<T>, id: RomId) -> Option<Self> {
        let chip = match id.family()? {
            ChipFamily::Data => Chip::Data(DataChip::new(adapter, id)),
            ChipFamily::Clock => Chip::Clock(ClockChip::new(adapter, id)),
            ChipFamily::Timezone => Chip::Timezone(TimezoneChip::new(adapter, id)),
        };
        Some(chip)
    }

    /// ROM id of the chip
    pub fn id(&self) -> RomId {
        match self {
            Chip::Data(chip) => chip.id(),
            Chip::Clock(chip) => chip.id(),
            Chip::Timezone(chip) => chip.id(),
        }
    }

    /// Family of the chip
    pub fn family(&self) -> ChipFamily {
        match self {
            Chip::Data(_) => ChipFamily::Data,
            Chip::Clock(_) => ChipFamily::Clock,
            Chip::Timezone(_) => ChipFamily::Timezone,
        }
    }
}

impl<T: Transport> std::fmt::Debug for Chip<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.family(), self.id())
    }
}

/// Write a payload at a fixed address. The adapter repeats the write
/// under its retry policy; a payload it never accepted is
/// [`ChipError::Rejected`].
pub(crate) async fn write_region<T: Transport>(
    adapter: &OneWireAdapter<T>,
    id: &RomId,
    payload: &[u8],
    address: u16,
) -> Result<()> {
    if !adapter.write_fixed_region(id, payload, address).await? {
        return Err(ChipError::Rejected { address });
    }
    debug!("{} bytes committed at {:#06x} of {}", payload.len(), address, id);
    Ok(())
}
