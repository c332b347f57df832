//! echip - Exercise-machine chip access over a DS2490 1-Wire adapter
//!
//! A thin layer over the bus engine ([`echip_ds2490`]) and the memory image
//! codec ([`echip_core`]). [`ChipReader`] claims an adapter, watches the bus
//! and reports chips as they come and go; each chip is wrapped by family:
//!
//! - [`DataChip`] (family 0x0C): workout records, read and parsed into a
//!   [`MachineMap`], written back through the diff path and verified by
//!   re-reading
//! - [`ClockChip`] (family 0x24): opaque clock payload at a fixed address
//! - [`TimezoneChip`] (family 0x2D): opaque name and offset payloads
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "usb")]
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use echip::{Chip, ChipEvent, ChipReader};
//! use echip_ds2490::{AdapterConfig, UsbTransport};
//!
//! let config = AdapterConfig::default();
//! let transport = UsbTransport::open(&config).await?;
//! let (reader, mut events) = ChipReader::open(transport, config).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ChipEvent::Connected(Chip::Data(mut chip)) = event {
//!         let id = chip.id();
//!         let data = chip.load().await?;
//!         println!("{} models on {}", data.machines.len(), id);
//!         break;
//!     }
//! }
//! reader.close().await;
//! # Ok(())
//! # }
//! ```

mod chip;
mod clock_chip;
mod data_chip;
mod error;
mod reader;
mod timezone_chip;

pub use chip::Chip;
pub use clock_chip::{ClockChip, CLOCK_ADDRESS};
pub use data_chip::{ChipData, DataChip};
pub use error::{ChipError, Result};
pub use reader::{ChipEvent, ChipReader};
pub use timezone_chip::{TimezoneChip, NAME_ADDRESS, OFFSET_ADDRESS};

pub use echip_core::{ChipFamily, MachineMap, RomId};
