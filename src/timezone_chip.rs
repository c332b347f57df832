//! Timezone chip (family 0x2D)

use echip_core::transport::Transport;
use echip_core::RomId;
use echip_ds2490::OneWireAdapter;
use log::info;

use crate::chip::write_region;
use crate::error::{ChipError, Result};

/// Address of the timezone name payload
pub const NAME_ADDRESS: u16 = 0x0000;
/// Address of the UTC offset payload
pub const OFFSET_ADDRESS: u16 = 0x0008;

/// Timezone chip
pub struct TimezoneChip<T: Transport> {
    adapter: OneWireAdapter<T>,
    id: RomId,
}

impl<T: Transport> TimezoneChip<T> {
    pub(crate) fn new(adapter: OneWireAdapter<T>, id: RomId) -> Self {
        Self { adapter, id }
    }

    /// ROM id of the chip
    pub fn id(&self) -> RomId {
        self.id
    }

    /// Write the timezone name and offset payloads, name first.
    ///
    /// The name must fit below the offset region.
    pub async fn set_timezone(&self, name: &[u8], offset: &[u8]) -> Result<()> {
        let max = usize::from(OFFSET_ADDRESS - NAME_ADDRESS);
        if name.len() > max {
            return Err(ChipError::PayloadTooLong {
                len: name.len(),
                max,
            });
        }

        write_region(&self.adapter, &self.id, name, NAME_ADDRESS).await?;
        write_region(&self.adapter, &self.id, offset, OFFSET_ADDRESS).await?;
        info!("Finished write (timezone) to {}", self.id);
        Ok(())
    }
}
