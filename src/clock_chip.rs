//! Real-time clock chip (family 0x24)

use echip_core::transport::Transport;
use echip_core::RomId;
use echip_ds2490::OneWireAdapter;
use log::info;

use crate::chip::write_region;
use crate::error::Result;

/// Address the clock payload is written to
pub const CLOCK_ADDRESS: u16 = 0x0000;

/// Real-time clock chip
pub struct ClockChip<T: Transport> {
    adapter: OneWireAdapter<T>,
    id: RomId,
}

impl<T: Transport> ClockChip<T> {
    pub(crate) fn new(adapter: OneWireAdapter<T>, id: RomId) -> Self {
        Self { adapter, id }
    }

    /// ROM id of the chip
    pub fn id(&self) -> RomId {
        self.id
    }

    /// Write a clock payload. The bytes are written verbatim.
    pub async fn set_clock(&self, payload: &[u8]) -> Result<()> {
        write_region(&self.adapter, &self.id, payload, CLOCK_ADDRESS).await?;
        info!("Finished write (time & date) to {}", self.id);
        Ok(())
    }
}
