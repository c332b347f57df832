//! echip-ds2490 - DS2490 USB 1-Wire adapter bus engine
//!
//! This crate drives a Maxim DS2490 (the chip inside the DS9490 USB
//! adapters) to talk to 1-Wire memory chips: enumerating the bus with the
//! ROM search, reading a chip's whole memory and writing pages through the
//! chip's scratchpad with read-back verification.
//!
//! # Protocol Overview
//!
//! The DS2490 takes commands as vendor control requests and moves bus data
//! through a pair of bulk pipes. Its interrupt pipe reports a status
//! register with the fill level of the command buffer and the result codes
//! of finished commands; the engine polls it after resets and copies.
//!
//! Every transfer is raced against a deadline. A failed transfer resets
//! the adapter, and whole reads and writes are retried a bounded number of
//! times before the error is surfaced.
//!
//! # Example
//!
//! ```no_run
//! use echip_ds2490::{AdapterConfig, OneWireAdapter, UsbTransport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AdapterConfig::default();
//! let transport = UsbTransport::open(&config).await?;
//! let adapter = OneWireAdapter::new(transport, config);
//! adapter.claim().await?;
//!
//! for id in adapter.search().await? {
//!     println!("Found {}", id);
//! }
//! adapter.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration Options
//!
//! - `device=N` or `index=N`: Select the Nth adapter (0-indexed)
//! - `serial=XXXX`: Select an adapter by USB serial number
//! - `transfer_timeout=200ms`: Deadline of a single USB transfer
//! - `operation_timeout=20s`: Deadline of one attempt of a read or write
//! - `attempts=3`: Attempts of a read or write
//! - `search_interval=250ms`: Pause between background ROM searches
//! - `search_timeout=2s`: Deadline of one background ROM search

mod config;
mod device;
mod error;
mod protocol;
mod retry;
mod search;
mod status;
#[cfg(feature = "usb")]
mod usb;

pub use config::{parse_options, AdapterConfig};
pub use device::{AdapterState, DetectCallback, OneWireAdapter};
pub use error::{Error, Phase, Result};
pub use protocol::RomCommand;
pub use retry::{with_retry, Retryable, RetryPolicy};
pub use search::{RomSearch, SearchBus};
pub use status::{ResultCode, ResultFlags, Status};
#[cfg(feature = "usb")]
pub use usb::{AdapterInfo, UsbTransport};
