//! Codec between a chip's memory image and its machine records
//!
//! [`parse`] turns 256 pages into a [`MachineMap`](crate::MachineMap),
//! [`build`] goes the other way. Neither does any I/O.

mod build;
mod parse;
mod record;

pub use build::build;
pub use parse::parse;
pub use record::{SERIAL_PREFIX_LEN, SERIAL_TIME_FORMAT};
