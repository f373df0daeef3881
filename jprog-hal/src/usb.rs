//! Raw USB transport for FTDI-style probes.
//!
//! Opens the device, claims interface 0, locates the bulk endpoint pair and
//! wraps the FTDI vendor control requests (reset, purge, latency timer,
//! bitmode). Both adapters sit on top of this; it knows nothing about JTAG.
//!
//! FT-style function blocks prepend two modem status bytes to every IN
//! packet, payload or not. [`UsbLink::bulk_read`] requests one max-packet at
//! a time so the header can be stripped per packet.

use std::time::{Duration, Instant};

use futures_lite::future::block_on;
use nusb::transfer::{Control, ControlType, Direction, EndpointType, Recipient, RequestBuffer};
use nusb::{DeviceInfo, Interface};

use crate::error::{Error, Result, TransferDirection};

const SIO_RESET: u8 = 0x00;
const SIO_SET_LATENCY_TIMER: u8 = 0x09;
const SIO_SET_BITMODE: u8 = 0x0B;

const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;

/// Bitmode values for [`UsbLink::set_bitmode`].
pub const BITMODE_RESET: u8 = 0x00;
pub const BITMODE_MPSSE: u8 = 0x02;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);
/// Best-effort timeout for draining stale IN data.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

pub struct UsbLink {
    interface: Interface,
    ep_in: u8,
    ep_out: u8,
    max_packet_size: usize,
    /// FTDI interface index used as wIndex in vendor requests (1-based).
    index: u16,
}

impl UsbLink {
    /// Open `info`, claim interface 0 and locate its bulk endpoint pair.
    pub fn open(info: &DeviceInfo) -> Result<Self> {
        let device = info.open().map_err(|e| Error::UsbUnavailable(e.to_string()))?;

        let config = device
            .active_configuration()
            .map_err(|e| Error::UsbUnavailable(e.to_string()))?;
        let mut ep_in = None;
        let mut ep_out = None;
        let mut max_packet_size = 64;
        for alt in config.interface_alt_settings() {
            if alt.interface_number() != 0 {
                continue;
            }
            for ep in alt.endpoints() {
                if ep.transfer_type() != EndpointType::Bulk {
                    continue;
                }
                match ep.direction() {
                    Direction::In => {
                        ep_in = Some(ep.address());
                        max_packet_size = ep.max_packet_size();
                    }
                    Direction::Out => ep_out = Some(ep.address()),
                }
            }
        }
        let (ep_in, ep_out) = match (ep_in, ep_out) {
            (Some(i), Some(o)) => (i, o),
            _ => return Err(Error::EndpointsMissing),
        };

        let interface = device
            .detach_and_claim_interface(0)
            .map_err(|e| Error::UsbUnavailable(e.to_string()))?;

        log::debug!(
            "opened {:04x}:{:04x}, bulk in {ep_in:#04x} out {ep_out:#04x}, packet {max_packet_size}",
            info.vendor_id(),
            info.product_id()
        );

        Ok(Self {
            interface,
            ep_in,
            ep_out,
            max_packet_size,
            index: 1,
        })
    }

    fn control_out(&self, request: u8, value: u16) -> Result<()> {
        self.interface
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: self.index,
                },
                &[],
                CONTROL_TIMEOUT,
            )
            .map(drop)
            .map_err(|e| Error::TransferFailed {
                direction: TransferDirection::Control,
                detail: e.to_string(),
            })
    }

    /// Full function-block reset.
    pub fn reset(&self) -> Result<()> {
        self.control_out(SIO_RESET, SIO_RESET_SIO)
    }

    pub fn purge_rx(&self) -> Result<()> {
        self.control_out(SIO_RESET, SIO_RESET_PURGE_RX)
    }

    pub fn purge_tx(&self) -> Result<()> {
        self.control_out(SIO_RESET, SIO_RESET_PURGE_TX)
    }

    pub fn set_latency_timer(&self, ms: u8) -> Result<()> {
        self.control_out(SIO_SET_LATENCY_TIMER, ms as u16)
    }

    /// Select a bitmode; `mask` marks the output pins.
    pub fn set_bitmode(&self, mask: u8, mode: u8) -> Result<()> {
        self.control_out(SIO_SET_BITMODE, (mode as u16) << 8 | mask as u16)
    }

    pub fn bulk_write(&self, bytes: &[u8]) -> Result<()> {
        log::trace!("bulk out {} bytes", bytes.len());
        let completion = block_on(self.interface.bulk_out(self.ep_out, bytes.to_vec()));
        let sent = completion
            .into_result()
            .map_err(|e| Error::TransferFailed {
                direction: TransferDirection::Out,
                detail: e.to_string(),
            })?
            .actual_length();
        if sent != bytes.len() {
            return Err(Error::TransferFailed {
                direction: TransferDirection::Out,
                detail: format!("short write: {sent} of {} bytes", bytes.len()),
            });
        }
        Ok(())
    }

    /// Read up to `max_len` payload bytes, stripping the 2 status bytes per
    /// packet. Returns whatever arrived by the deadline, which may be empty.
    pub fn bulk_read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut payload = Vec::with_capacity(max_len);
        while payload.len() < max_len {
            let buffer = RequestBuffer::new(self.max_packet_size);
            let completion = block_on(self.interface.bulk_in(self.ep_in, buffer));
            let packet = completion.into_result().map_err(|e| Error::TransferFailed {
                direction: TransferDirection::In,
                detail: e.to_string(),
            })?;
            if packet.len() > 2 {
                payload.extend_from_slice(&packet[2..]);
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        log::trace!("bulk in {} payload bytes", payload.len());
        Ok(payload)
    }

    /// Read exactly `len` payload bytes or fail with [`Error::Timeout`].
    pub fn bulk_read_exact(&self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let data = self.bulk_read(len, timeout)?;
        if data.len() < len {
            log::warn!("IN transfer returned {} of {len} bytes", data.len());
            return Err(Error::Timeout);
        }
        Ok(data)
    }

    /// Discard any stale IN payload. Best effort; stops at the first packet
    /// that carries nothing beyond its status header, and swallows errors.
    pub fn drain(&self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let buffer = RequestBuffer::new(self.max_packet_size);
            let completion = block_on(self.interface.bulk_in(self.ep_in, buffer));
            match completion.into_result() {
                Ok(packet) if packet.len() > 2 && Instant::now() < deadline => continue,
                _ => break,
            }
        }
    }
}
