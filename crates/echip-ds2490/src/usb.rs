//! DS2490 transport over nusb

use std::time::Duration;

use echip_core::transport::{Transport, TransportError};
use log::{debug, info};
use nusb::transfer::{
    Buffer, Bulk, ControlOut, ControlType, In, Interrupt, Out, Recipient, TransferError,
};
use nusb::Endpoint;

use crate::config::AdapterConfig;
use crate::protocol::{BULK_IN_EP, BULK_OUT_EP, DS2490_USB_PRODUCT, DS2490_USB_VENDOR, STATUS_EP};

/// Cancel whatever an endpoint still has in flight and reap it, so a
/// transfer abandoned by a timeout cannot complete a later request.
macro_rules! drain {
    ($ep:expr) => {{
        if $ep.pending() > 0 {
            $ep.cancel_all();
            while $ep.pending() > 0 {
                let _ = $ep.next_complete().await;
            }
        }
    }};
}

/// Information about a connected DS2490
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// USB bus number
    pub bus: u8,
    /// USB device address
    pub address: u8,
    /// USB serial number, if the adapter reports one
    pub serial: Option<String>,
}

impl std::fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DS2490 at bus {} address {}", self.bus, self.address)?;
        if let Some(serial) = &self.serial {
            write!(f, " (serial {})", serial)?;
        }
        Ok(())
    }
}

/// Endpoints of a claimed interface; dropping them releases the claim
struct Claimed {
    interface: nusb::Interface,
    bulk_out: Endpoint<Bulk, Out>,
    bulk_in: Endpoint<Bulk, In>,
    status: Endpoint<Interrupt, In>,
}

/// USB transport to a real DS2490
pub struct UsbTransport {
    device: nusb::Device,
    claimed: Option<Claimed>,
    control_timeout: Duration,
}

impl UsbTransport {
    /// Open the adapter selected by `config` (serial number first, then index).
    pub async fn open(config: &AdapterConfig) -> Result<Self, TransportError> {
        let devices: Vec<_> = nusb::list_devices()
            .await
            .map_err(|e| TransportError::Transfer(e.to_string()))?
            .filter(|d| d.vendor_id() == DS2490_USB_VENDOR && d.product_id() == DS2490_USB_PRODUCT)
            .collect();

        let device_info = match &config.serial {
            Some(serial) => devices
                .iter()
                .find(|d| d.serial_number() == Some(serial.as_str())),
            None => devices.get(config.device_index),
        }
        .ok_or(TransportError::NotFound)?;

        info!(
            "Opening DS2490 at bus {} address {}",
            device_info.busnum(),
            device_info.device_address()
        );

        let device = device_info
            .open()
            .await
            .map_err(|e| TransportError::Transfer(e.to_string()))?;

        Ok(Self {
            device,
            claimed: None,
            control_timeout: config.transfer_timeout,
        })
    }

    /// List all connected DS2490 adapters
    pub async fn list_adapters() -> Result<Vec<AdapterInfo>, TransportError> {
        let adapters = nusb::list_devices()
            .await
            .map_err(|e| TransportError::Transfer(e.to_string()))?
            .filter(|d| d.vendor_id() == DS2490_USB_VENDOR && d.product_id() == DS2490_USB_PRODUCT)
            .map(|d| AdapterInfo {
                bus: d.busnum(),
                address: d.device_address(),
                serial: d.serial_number().map(str::to_string),
            })
            .collect();

        Ok(adapters)
    }

    fn claimed(&mut self) -> Result<&mut Claimed, TransportError> {
        self.claimed.as_mut().ok_or(TransportError::NotClaimed)
    }
}

fn transfer_error(endpoint: u8, error: TransferError) -> TransportError {
    match error {
        TransferError::Stall => TransportError::Stall(endpoint),
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::Transfer(other.to_string()),
    }
}

/// IN transfers must request whole packets.
fn in_request_len(len: usize, max_packet_size: usize) -> usize {
    let packet = max_packet_size.max(1);
    len.max(1).div_ceil(packet) * packet
}

impl Transport for UsbTransport {
    async fn claim(
        &mut self,
        configuration: u8,
        interface: u8,
        alternate: u8,
    ) -> Result<(), TransportError> {
        let open_error = |e: nusb::Error| TransportError::Transfer(e.to_string());

        self.device
            .set_configuration(configuration)
            .await
            .map_err(open_error)?;
        let usb_interface = self
            .device
            .claim_interface(interface)
            .await
            .map_err(open_error)?;
        usb_interface
            .set_alt_setting(alternate)
            .await
            .map_err(open_error)?;

        let bulk_out = usb_interface
            .endpoint::<Bulk, Out>(BULK_OUT_EP)
            .map_err(open_error)?;
        let bulk_in = usb_interface
            .endpoint::<Bulk, In>(BULK_IN_EP)
            .map_err(open_error)?;
        let status = usb_interface
            .endpoint::<Interrupt, In>(STATUS_EP)
            .map_err(open_error)?;

        debug!(
            "Claimed interface {} alt {} of configuration {}",
            interface, alternate, configuration
        );
        self.claimed = Some(Claimed {
            interface: usb_interface,
            bulk_out,
            bulk_in,
            status,
        });
        Ok(())
    }

    async fn release(&mut self) -> Result<(), TransportError> {
        if let Some(mut claimed) = self.claimed.take() {
            drain!(claimed.bulk_out);
            drain!(claimed.bulk_in);
            drain!(claimed.status);
            debug!("Released DS2490 interface");
        }
        Ok(())
    }

    async fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
    ) -> Result<(), TransportError> {
        let timeout = self.control_timeout;
        let claimed = self.claimed()?;
        claimed
            .interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    data: &[],
                },
                timeout,
            )
            .await
            .map_err(|e| transfer_error(0, e))
    }

    async fn bulk_out(&mut self, endpoint: u8, data: &[u8]) -> Result<(), TransportError> {
        let ep = &mut self.claimed()?.bulk_out;
        drain!(ep);
        ep.submit(Buffer::from(data.to_vec()));
        let completion = ep.next_complete().await;
        completion.status.map_err(|e| transfer_error(endpoint, e))
    }

    async fn bulk_in(&mut self, endpoint: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        let ep = &mut self.claimed()?.bulk_in;
        drain!(ep);
        ep.submit(Buffer::new(in_request_len(len, ep.max_packet_size())));
        let completion = ep.next_complete().await;
        completion.status.map_err(|e| transfer_error(endpoint, e))?;
        Ok(completion.buffer[..completion.actual_len].to_vec())
    }

    async fn interrupt_in(&mut self, endpoint: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        let ep = &mut self.claimed()?.status;
        drain!(ep);
        ep.submit(Buffer::new(in_request_len(len, ep.max_packet_size())));
        let completion = ep.next_complete().await;
        completion.status.map_err(|e| transfer_error(endpoint, e))?;
        Ok(completion.buffer[..completion.actual_len].to_vec())
    }
}
