//! Altera USB-Blaster adapter (FT245 legacy bit-bang protocol).
//!
//! The Blaster speaks two wire modes on the same OUT endpoint. In bit-bang
//! mode every TCK edge costs two bytes, a setup byte with TCK low and a
//! clock byte with TCK high; pin states ride in fixed bit positions. In
//! byte-shift mode a `0x80 | n` command byte is followed by `n` data bytes
//! that are shifted out 8 bits apiece with TMS held low, LSB first.
//!
//! The FT245 read path is too unreliable for bulk capture, so TDO sampling
//! is offered only for short shifts; longer capture requests are declined.

use std::time::Duration;

use nusb::DeviceInfo;

use crate::adapter::Adapter;
use crate::bits::{bytes_for_bits, get_bit, set_bit};
use crate::error::Result;
use crate::usb::UsbLink;

pub const USB_BLASTER_VID: u16 = 0x09FB;
pub const USB_BLASTER_PID: u16 = 0x6001;

// Bit-bang byte layout. The base value keeps the Blaster's nCE/nCS lines
// deasserted.
const OUT_BASE: u8 = 0x2C;
const BIT_TCK: u8 = 1 << 0;
const BIT_TMS: u8 = 1 << 1;
const BIT_TDI: u8 = 1 << 4;
const BIT_READ: u8 = 1 << 6;

// Byte-shift command: 0x80 | count, count in 1..=63.
const SHIFT_CMD: u8 = 0x80;
const SHIFT_MAX_BYTES: usize = 63;

/// Largest capture the FT245 read path is trusted with.
const CAPTURE_LIMIT_BITS: usize = 64;

/// OUT bytes sent between best-effort IN drains on long bursts.
const PACE_CHUNK: usize = 4096;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct UsbBlaster {
    link: UsbLink,
    /// OUT bytes since the last pacing drain.
    since_drain: usize,
}

impl UsbBlaster {
    /// Open the Blaster and run its init sequence: function reset, purge
    /// both FIFOs, 2 ms latency timer, drain stale input, then a long
    /// TMS-high flush so the TAP is in RESET whatever state it was left in.
    pub fn open(info: &DeviceInfo) -> Result<Self> {
        let link = UsbLink::open(info)?;

        // Some clones NAK the reset yet work fine afterwards.
        if let Err(e) = link.reset() {
            log::warn!("function reset rejected, continuing: {e}");
        }
        link.purge_rx()?;
        link.purge_tx()?;
        link.set_latency_timer(2)?;
        link.drain();

        let mut blaster = Self {
            link,
            since_drain: 0,
        };
        let mut buf = Vec::with_capacity(2 * 2000);
        for _ in 0..2000 {
            push_edge(&mut buf, true, false, false);
        }
        blaster.write_paced(&buf)?;
        Ok(blaster)
    }

    /// Write `buf`, draining the IN endpoint between large bursts so the
    /// device FIFO never backs up.
    fn write_paced(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(PACE_CHUNK) {
            if self.since_drain >= PACE_CHUNK {
                self.link.drain();
                self.since_drain = 0;
            }
            self.link.bulk_write(chunk)?;
            self.since_drain += chunk.len();
        }
        Ok(())
    }

    fn shift_capture(&mut self, tdi: &[u8], tms: &[u8], n_bits: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(2 * n_bits);
        for i in 0..n_bits {
            push_edge(&mut buf, get_bit(tms, i), get_bit(tdi, i), true);
        }
        self.link.bulk_write(&buf)?;

        // One response byte per read-enabled clock byte, TDO in bit 0.
        let reply = self.link.bulk_read_exact(n_bits, READ_TIMEOUT)?;
        let mut tdo = vec![0u8; bytes_for_bits(n_bits)];
        for (i, byte) in reply.iter().enumerate() {
            set_bit(&mut tdo, i, byte & 1 != 0);
        }
        Ok(tdo)
    }
}

/// Append the two bit-bang bytes for one TCK edge.
fn push_edge(buf: &mut Vec<u8>, tms: bool, tdi: bool, read: bool) {
    let mut setup = OUT_BASE;
    if tms {
        setup |= BIT_TMS;
    }
    if tdi {
        setup |= BIT_TDI;
    }
    buf.push(setup);
    let mut clock = setup | BIT_TCK;
    if read {
        clock |= BIT_READ;
    }
    buf.push(clock);
}

/// Append a run of byte-shift commands covering `data`.
fn push_byte_shift(buf: &mut Vec<u8>, data: &[u8]) {
    let mut offset = 0;
    while offset < data.len() {
        let n = (data.len() - offset).min(SHIFT_MAX_BYTES);
        buf.push(SHIFT_CMD | n as u8);
        buf.extend_from_slice(&data[offset..offset + n]);
        offset += n;
    }
}

/// Encode a general write-only shift. TMS-low runs of whole aligned bytes
/// go out in byte-shift mode; everything else, and always the final bit,
/// is bit-banged.
fn encode_shift(tdi: &[u8], tms: &[u8], n_bits: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 * n_bits);
    let mut i = 0;
    while i < n_bits {
        // Length of the TMS-low run from here, never consuming the final
        // bit.
        let mut run = 0;
        while i + run < n_bits - 1 && !get_bit(tms, i + run) {
            run += 1;
        }
        if run >= 8 && i % 8 == 0 {
            // Anchor with TCK low before switching modes.
            buf.push(OUT_BASE);
            let nbytes = run / 8;
            push_byte_shift(&mut buf, &tdi[i / 8..i / 8 + nbytes]);
            i += nbytes * 8;
        } else {
            push_edge(&mut buf, get_bit(tms, i), get_bit(tdi, i), false);
            i += 1;
        }
    }
    buf
}

/// Encode the write-only fast path: anchor byte, byte-shift of the whole
/// bytes, and a bit-banged tail. For a whole-byte payload the final bit is
/// clocked once more with TMS high for the exit transition.
fn encode_shift_bytes(tdi: &[u8], n_bits: usize) -> Vec<u8> {
    let full_bytes = n_bits / 8;
    let rem_bits = n_bits % 8;

    let mut buf = Vec::with_capacity(full_bytes + full_bytes / SHIFT_MAX_BYTES + 8);
    // Anchor with TCK low so the byte-shift command is not mistaken for pin
    // data.
    buf.push(OUT_BASE);
    push_byte_shift(&mut buf, &tdi[..full_bytes]);
    if rem_bits > 0 {
        for bit in 0..rem_bits {
            let i = full_bytes * 8 + bit;
            push_edge(&mut buf, bit == rem_bits - 1, get_bit(tdi, i), false);
        }
    } else if n_bits > 0 {
        push_edge(&mut buf, true, get_bit(tdi, n_bits - 1), false);
    }
    buf
}

fn encode_toggle_clock(cycles: usize) -> Vec<u8> {
    let full_bytes = cycles / 8;
    let mut buf = Vec::with_capacity(full_bytes + 16);
    buf.push(OUT_BASE);
    push_byte_shift(&mut buf, &vec![0u8; full_bytes]);
    for _ in 0..cycles % 8 {
        push_edge(&mut buf, false, false, false);
    }
    buf
}

impl Adapter for UsbBlaster {
    fn shift(
        &mut self,
        tdi: &[u8],
        tms: &[u8],
        n_bits: usize,
        capture: bool,
    ) -> Result<Option<Vec<u8>>> {
        if n_bits == 0 {
            return Ok(None);
        }
        if capture {
            if n_bits <= CAPTURE_LIMIT_BITS {
                return self.shift_capture(tdi, tms, n_bits).map(Some);
            }
            log::warn!("declining TDO capture of {n_bits} bits on the FT245 read path");
        }
        let buf = encode_shift(tdi, tms, n_bits);
        self.write_paced(&buf)?;
        Ok(None)
    }

    fn shift_bytes(&mut self, tdi: &[u8], n_bits: usize) -> Result<()> {
        if n_bits == 0 {
            return Ok(());
        }
        let buf = encode_shift_bytes(tdi, n_bits);
        self.write_paced(&buf)
    }

    fn toggle_clock(&mut self, cycles: usize) -> Result<()> {
        if cycles == 0 {
            return Ok(());
        }
        let buf = encode_toggle_clock(cycles);
        self.write_paced(&buf)
    }
}
