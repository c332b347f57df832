//! echip-core - Memory image codec for 1-Wire data chips
//!
//! This crate contains everything about a data chip that does not need a
//! bus: the 256 × 32-byte memory image layout, the CRC16 page check, the
//! codec between that image and the structured machine records, and the
//! 8-byte ROM ids used to address chips on the bus.
//!
//! It also defines the [`transport::Transport`] trait, the seam between the
//! bus engine and whatever carries its USB transfers (real hardware or an
//! emulator).
//!
//! # Example
//!
//! ```
//! use echip_core::{build, parse, MachineMap};
//!
//! let image = build(&MachineMap::new())?;
//! assert_eq!(image.len(), echip_core::image::PAGE_COUNT);
//! assert!(parse(&image)?.is_empty());
//! # Ok::<(), echip_core::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod codec;
pub mod crc;
pub mod error;
pub mod image;
pub mod model;
pub mod rom;
pub mod transport;

pub use codec::{build, parse};
pub use error::{Error, Result};
pub use image::Page;
pub use model::{
    ForceUnit, FormatVersion, MachineMap, MachineObject, MachinePosition, MachineSet,
    MachineTest, ModelId, Precision, TestResult, TestType,
};
pub use rom::{ChipFamily, RomId};
