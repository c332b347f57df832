//! Data chip access
//!
//! Reads are parsed and cached; writes go through the diff path and are
//! only trusted after the chip has been read back and matches the image
//! that was written.

use echip_core::{build, parse, MachineMap, Page, RomId};
use echip_core::transport::Transport;
use echip_ds2490::{OneWireAdapter, Retryable};
use log::{debug, info, warn};

use crate::error::{ChipError, Result};

/// Contents of a data chip as last read
#[derive(Debug, Clone, PartialEq)]
pub struct ChipData {
    /// Decoded machine records
    pub machines: MachineMap,
    /// Raw memory image the records were decoded from
    pub pages: Vec<Page>,
}

/// 64 kbit data chip (family 0x0C)
pub struct DataChip<T: Transport> {
    adapter: OneWireAdapter<T>,
    id: RomId,
    data: Option<ChipData>,
}

impl<T: Transport> DataChip<T> {
    pub(crate) fn new(adapter: OneWireAdapter<T>, id: RomId) -> Self {
        Self {
            adapter,
            id,
            data: None,
        }
    }

    /// ROM id of the chip
    pub fn id(&self) -> RomId {
        self.id
    }

    /// Contents from the last successful load or write, if any
    pub fn data(&self) -> Option<&ChipData> {
        self.data.as_ref()
    }

    /// Read and parse the chip, re-reading while the image is malformed.
    pub async fn load(&mut self) -> Result<&ChipData> {
        let data = read_verified(&self.adapter, &self.id, None).await?;
        debug!("Loaded {} models from {}", data.machines.len(), self.id);
        Ok(&*self.data.insert(data))
    }

    /// Cached contents, loading them first when there are none.
    pub async fn get_data(&mut self) -> Result<&ChipData> {
        let data = match self.data.take() {
            Some(data) => data,
            None => read_verified(&self.adapter, &self.id, None).await?,
        };
        Ok(&*self.data.insert(data))
    }

    /// Replace the chip's records.
    ///
    /// Only pages that differ from the last read are written. The chip is
    /// read back afterwards; a mismatch is [`ChipError::ChecksumMismatch`].
    pub async fn set_data(&mut self, machines: &MachineMap) -> Result<()> {
        let new = build(machines)?;
        let old = self.previous_image().await?;

        let written = match self.adapter.write_diff(&self.id, &new, &old, false).await {
            Ok(()) => read_verified(&self.adapter, &self.id, Some(&new)).await,
            Err(e) => Err(e.into()),
        };
        self.settle(written)
    }

    /// Erase every record from the chip.
    ///
    /// Falls back to rewriting the whole image when the diff write fails.
    pub async fn clear_data(&mut self) -> Result<()> {
        let new = build(&MachineMap::new())?;
        let written = match self.data.take() {
            Some(old) => self.adapter.write_diff(&self.id, &new, &old.pages, false).await,
            None => Err(echip_ds2490::Error::InvalidParameter(
                "no previous image to diff against".into(),
            )),
        };
        let written = match written {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Diff write to {} failed ({}), rewriting all pages", self.id, e);
                self.adapter.write_all(&self.id, &new, false).await
            }
        };

        let written = match written {
            Ok(()) => read_verified(&self.adapter, &self.id, Some(&new)).await,
            Err(e) => Err(e.into()),
        };
        self.settle(written)
    }

    async fn previous_image(&mut self) -> Result<Vec<Page>> {
        match self.data.take() {
            Some(data) => Ok(data.pages),
            None => Ok(read_verified(&self.adapter, &self.id, None).await?.pages),
        }
    }

    /// Cache the verified contents, or drop the cache after a failed write.
    fn settle(&mut self, written: Result<ChipData>) -> Result<()> {
        match written {
            Ok(data) => {
                info!("Wrote {} models to {}", data.machines.len(), self.id);
                self.data = Some(data);
                Ok(())
            }
            Err(e) => {
                self.data = None;
                Err(e)
            }
        }
    }
}

/// Read and parse a chip, checking the image against `expected` when given.
///
/// The adapter retries failed reads itself; only an image that reads back
/// malformed or different is read again, up to the policy's attempts.
async fn read_verified<T: Transport>(
    adapter: &OneWireAdapter<T>,
    id: &RomId,
    expected: Option<&Vec<Page>>,
) -> Result<ChipData> {
    let policy = adapter.config().retry;
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        let pages = adapter.read_all(id, false).await?;
        let checked = match expected {
            Some(expected) if pages != *expected => Err(ChipError::ChecksumMismatch),
            _ => parse(&pages).map_err(ChipError::from),
        };

        match checked {
            Ok(machines) => return Ok(ChipData { machines, pages }),
            Err(e) if attempt < attempts && e.is_retryable() => {
                warn!("Re-reading {} ({}/{}): {}", id, attempt, attempts, e);
                attempt += 1;
                if !policy.pause.is_zero() {
                    tokio::time::sleep(policy.pause).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}
