//! USB transfer seam between the bus engine and the adapter
//!
//! The bus engine only ever needs a handful of transfer kinds from the
//! adapter: vendor control requests without a data stage, bulk transfers on
//! the adapter's two bulk pipes, and reads of its interrupt status pipe.
//! Implementations exist for real hardware (nusb) and for an in-memory
//! emulator used by the tests.

use std::future::Future;

use thiserror::Error;

/// Failure reported by a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No matching device is attached
    #[error("Device not found")]
    NotFound,

    /// The device went away
    #[error("Device disconnected")]
    Disconnected,

    /// The endpoint answered with a stall
    #[error("Endpoint {0:#04x} stalled")]
    Stall(u8),

    /// The interface has not been claimed
    #[error("Interface not claimed")]
    NotClaimed,

    /// Any other transfer failure
    #[error("Transfer failed: {0}")]
    Transfer(String),
}

/// Transfers the bus engine issues to its adapter
///
/// Every method completes asynchronously and reports any non-ok transfer
/// status as an error. Returned futures are `Send` so an engine can drive
/// its transport from a spawned task.
pub trait Transport: Send + 'static {
    /// Select the configuration and claim the interface at the given
    /// alternate setting.
    fn claim(
        &mut self,
        configuration: u8,
        interface: u8,
        alternate: u8,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Release the claimed interface.
    fn release(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Vendor control request to the device, no data stage.
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Send bytes on a bulk OUT endpoint.
    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive up to `len` bytes from a bulk IN endpoint.
    fn bulk_in(
        &mut self,
        endpoint: u8,
        len: usize,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Receive up to `len` bytes from an interrupt IN endpoint.
    fn interrupt_in(
        &mut self,
        endpoint: u8,
        len: usize,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}
