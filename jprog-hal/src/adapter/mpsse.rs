//! MPSSE adapter for FT2232H / FT4232H / FT232H cables.
//!
//! Shifts are split into a whole-byte body, up to seven residual bits, and
//! a TMS-carrying tail; each part maps to its own MPSSE command. Commands
//! accumulate in a local builder and flush on a size threshold, before any
//! read, and at explicit flush points. Response framing: whole bytes arrive
//! intact, `k` residual bits arrive right-justified by `8 - k`, and a
//! TMS-read bit arrives in bit 7.

use std::time::Duration;

use nusb::DeviceInfo;

use crate::adapter::Adapter;
use crate::bits::{bytes_for_bits, get_bit, set_bit};
use crate::error::Result;
use crate::mpsse::{
    ClockBits, ClockBitsOut, ClockBytes, ClockBytesOut, ClockTms, ClockTmsOut, MpsseCmdBuilder,
};
use crate::usb::{UsbLink, BITMODE_MPSSE, BITMODE_RESET};

/// ADBUS pins driven by the engine: TCK, TDI, TMS.
const PIN_MASK: u8 = 0x0B;
/// Initial ADBUS value/direction: TMS high, TCK/TDI low, outputs enabled.
const GPIO_LOW_VALUE: u8 = 0xE8;
const GPIO_LOW_DIR: u8 = 0xEB;
/// ACBUS setup for Digilent-style cables.
const GPIO_HIGH_VALUE: u8 = 0x00;
const GPIO_HIGH_DIR: u8 = 0x60;

/// Divisor for the default ~5 MHz TCK off the 60 MHz base.
const DEFAULT_DIVISOR: u16 = 0x0005;
const BASE_CLOCK_HZ: u32 = 60_000_000;

/// Local command buffer flush threshold.
const FLUSH_THRESHOLD: usize = 4096;
/// Cap on response bytes in flight before the IN endpoint is drained.
const READ_BATCH: usize = 2048;

const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// One queued capturing command, used to reframe the response stream.
enum ReadOp {
    /// Whole bytes, delivered intact.
    Bytes(usize),
    /// `k` bits delivered right-justified in one byte.
    Bits(usize),
    /// One TMS-shift bit delivered in bit 7.
    Tms,
}

pub struct MpsseAdapter {
    link: UsbLink,
    cmd: MpsseCmdBuilder,
    pending: Vec<ReadOp>,
}

impl MpsseAdapter {
    /// Open the cable and bring the engine up: function reset, MPSSE
    /// bitmode, 1 ms latency, drain, then the clocking and GPIO setup.
    pub fn open(info: &DeviceInfo) -> Result<Self> {
        let link = UsbLink::open(info)?;

        if let Err(e) = link.reset() {
            log::warn!("function reset rejected, continuing: {e}");
        }
        link.set_bitmode(0, BITMODE_RESET)?;
        link.set_bitmode(PIN_MASK, BITMODE_MPSSE)?;
        link.set_latency_timer(1)?;
        link.drain();

        let mut cmd = MpsseCmdBuilder::new();
        cmd.disable_clock_divide()
            .disable_adaptive_data_clocking()
            .disable_3phase_data_clocking()
            .disable_loopback()
            .set_clock_divisor(DEFAULT_DIVISOR)
            .set_gpio_lower(GPIO_LOW_VALUE, GPIO_LOW_DIR)
            .set_gpio_upper(GPIO_HIGH_VALUE, GPIO_HIGH_DIR);
        link.bulk_write(cmd.as_slice())?;

        Ok(Self {
            link,
            cmd: MpsseCmdBuilder::new(),
            pending: Vec::new(),
        })
    }

    /// Write out the buffered commands, if any.
    fn flush_cmds(&mut self) -> Result<()> {
        if !self.cmd.is_empty() {
            self.link.bulk_write(self.cmd.as_slice())?;
            self.cmd.clear();
        }
        Ok(())
    }

    fn flush_if_large(&mut self) -> Result<()> {
        debug_assert!(self.pending.is_empty());
        if self.cmd.len() > FLUSH_THRESHOLD {
            self.flush_cmds()?;
        }
        Ok(())
    }

    /// Flush, then collect the replies for every queued capturing command
    /// into `out` starting at bit `cursor`.
    fn drain_reads(&mut self, out: &mut [u8], cursor: &mut usize) -> Result<()> {
        if self.pending.is_empty() {
            return self.flush_cmds();
        }
        self.cmd.send_immediate();
        let expected = self.cmd.read_len();
        self.flush_cmds()?;

        let reply = self.link.bulk_read_exact(expected, READ_TIMEOUT)?;
        decode_replies(&self.pending, &reply, out, cursor);
        self.pending.clear();
        Ok(())
    }

    /// Reply bytes the queued capturing commands will produce.
    fn pending_reply_bytes(&self) -> usize {
        self.cmd.read_len()
    }
}

/// Queue the commands for `n_bits` starting at global bit `base`. TMS-low
/// runs map to data commands; everything else goes through TMS writes with
/// TDI pinned per group.
fn encode_span(
    cmd: &mut MpsseCmdBuilder,
    pending: &mut Vec<ReadOp>,
    tdi: &[u8],
    tms: &[u8],
    base: usize,
    n_bits: usize,
    capture: bool,
) {
    let mut i = base;
    let end = base + n_bits;
    while i < end {
        let mut run = 0;
        while i + run < end && !get_bit(tms, i + run) {
            run += 1;
        }
        if run >= 8 && i % 8 == 0 {
            let nbytes = run / 8;
            for chunk in tdi[i / 8..i / 8 + nbytes].chunks(FLUSH_THRESHOLD) {
                if capture {
                    cmd.clock_bytes(ClockBytes::LsbPosIn, chunk);
                    pending.push(ReadOp::Bytes(chunk.len()));
                } else {
                    cmd.clock_bytes_out(ClockBytesOut::LsbNeg, chunk);
                }
            }
            i += nbytes * 8;
        } else if run > 0 {
            let k = run.min(8);
            let mut byte = 0u8;
            for bit in 0..k {
                if get_bit(tdi, i + bit) {
                    byte |= 1 << bit;
                }
            }
            if capture {
                cmd.clock_bits(ClockBits::LsbPosIn, byte, k);
                pending.push(ReadOp::Bits(k));
            } else {
                cmd.clock_bits_out(ClockBitsOut::LsbNeg, byte, k);
            }
            i += k;
        } else {
            // TMS-carrying bits, grouped while TDI stays constant.
            let tdi_val = get_bit(tdi, i);
            let mut k = 1;
            while i + k < end && k < 7 && get_bit(tdi, i + k) == tdi_val {
                k += 1;
            }
            let mut tms_byte = 0u8;
            for bit in 0..k {
                if get_bit(tms, i + bit) {
                    tms_byte |= 1 << bit;
                }
            }
            if capture {
                for bit in 0..k {
                    cmd.clock_tms(ClockTms::NegTmsPosTdo, tms_byte >> bit & 1, tdi_val, 1);
                    pending.push(ReadOp::Tms);
                }
            } else {
                cmd.clock_tms_out(ClockTmsOut::NegEdge, tms_byte, tdi_val, k);
            }
            i += k;
        }
    }
}

/// Reframe the raw reply stream according to the queued capturing
/// commands, appending LSB-first bits to `out` at `cursor`.
fn decode_replies(pending: &[ReadOp], reply: &[u8], out: &mut [u8], cursor: &mut usize) {
    let mut offset = 0;
    for op in pending {
        match op {
            ReadOp::Bytes(n) => {
                for byte in &reply[offset..offset + n] {
                    for bit in 0..8 {
                        set_bit(out, *cursor, byte >> bit & 1 != 0);
                        *cursor += 1;
                    }
                }
                offset += n;
            }
            ReadOp::Bits(k) => {
                let byte = reply[offset] >> (8 - k);
                for bit in 0..*k {
                    set_bit(out, *cursor, byte >> bit & 1 != 0);
                    *cursor += 1;
                }
                offset += 1;
            }
            ReadOp::Tms => {
                set_bit(out, *cursor, reply[offset] >> 7 != 0);
                *cursor += 1;
                offset += 1;
            }
        }
    }
}

impl Adapter for MpsseAdapter {
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
        if !capture {
            encode_span(&mut self.cmd, &mut self.pending, tdi, tms, 0, n_bits, false);
            self.flush_if_large()?;
            return Ok(None);
        }

        // Capturing: bound the replies in flight so the engine's TX buffer
        // cannot overflow between our write and read.
        let mut out = vec![0u8; bytes_for_bits(n_bits)];
        let mut cursor = 0;
        let mut base = 0;
        while base < n_bits {
            let span = (n_bits - base).min(READ_BATCH * 8);
            encode_span(&mut self.cmd, &mut self.pending, tdi, tms, base, span, true);
            base += span;
            if self.pending_reply_bytes() >= READ_BATCH || base == n_bits {
                self.drain_reads(&mut out, &mut cursor)?;
            }
        }
        debug_assert_eq!(cursor, n_bits);
        Ok(Some(out))
    }

    fn shift_bytes(&mut self, tdi: &[u8], n_bits: usize) -> Result<()> {
        if n_bits == 0 {
            return Ok(());
        }
        let body = n_bits - 1;
        let full_bytes = body / 8;
        for chunk in tdi[..full_bytes].chunks(FLUSH_THRESHOLD) {
            self.cmd.clock_bytes_out(ClockBytesOut::LsbNeg, chunk);
        }
        let rem = body % 8;
        if rem > 0 {
            let mut byte = 0u8;
            for bit in 0..rem {
                if get_bit(tdi, full_bytes * 8 + bit) {
                    byte |= 1 << bit;
                }
            }
            self.cmd.clock_bits_out(ClockBitsOut::LsbNeg, byte, rem);
        }
        let last = get_bit(tdi, n_bits - 1);
        self.cmd.clock_tms_out(ClockTmsOut::NegEdge, 0x01, last, 1);
        self.flush_if_large()
    }

    fn toggle_clock(&mut self, cycles: usize) -> Result<()> {
        let mut full_bytes = cycles / 8;
        while full_bytes > 0 {
            let n = full_bytes.min(65536);
            self.cmd.clock_no_data_bytes(n);
            full_bytes -= n;
        }
        if cycles % 8 > 0 {
            self.cmd.clock_no_data_bits(cycles % 8);
        }
        self.flush_if_large()
    }

    fn set_frequency(&mut self, hz: u32) -> Result<()> {
        let hz = hz.clamp(458, BASE_CLOCK_HZ / 2);
        let divisor = (BASE_CLOCK_HZ / (2 * hz)).saturating_sub(1).min(0xFFFF) as u16;
        log::debug!(
            "TCK divisor {divisor} for requested {hz} Hz ({} Hz actual)",
            BASE_CLOCK_HZ / (2 * (divisor as u32 + 1))
        );
        self.cmd.set_clock_divisor(divisor);
        self.flush_cmds()
    }

    fn flush(&mut self) -> Result<()> {
        debug_assert!(self.pending.is_empty());
        self.flush_cmds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(tdi: &[u8], tms: &[u8], n_bits: usize, capture: bool) -> (Vec<u8>, Vec<ReadOp>) {
        let mut cmd = MpsseCmdBuilder::new();
        let mut pending = Vec::new();
        encode_span(&mut cmd, &mut pending, tdi, tms, 0, n_bits, capture);
        (cmd.as_slice().to_vec(), pending)
    }

    #[test]
    fn single_byte_with_tms_exit() {
        // Seven bits in bit mode, then the eighth through the TMS command
        // with its TDI value riding in bit 7.
        let (bytes, _) = encode(&[0x81], &[0x80], 8, false);
        assert_eq!(bytes, [0x1B, 0x06, 0x01, 0x4B, 0x00, 0x81]);
    }

    #[test]
    fn body_residual_and_exit_split() {
        // 19 bits ending in a TMS exit: 2 whole bytes, 2 residual bits, one
        // TMS bit.
        let tdi = [0xAA, 0x55, 0x07];
        let mut tms = [0u8; 3];
        set_bit(&mut tms, 18, true);
        let (bytes, _) = encode(&tdi, &tms, 19, false);
        let expected = [
            0x19, 0x01, 0x00, 0xAA, 0x55, // byte body, length-1 = 1
            0x1B, 0x01, 0x03, // two residual bits
            0x4B, 0x00, 0x81, // TMS exit carrying TDI=1
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn pure_tms_move_groups_bits() {
        // A five-step state move with TDI low is one TMS command.
        let (bytes, _) = encode(&[0x00], &[0x0D], 5, false);
        assert_eq!(bytes, [0x4B, 0x04, 0x0D]);
    }

    #[test]
    fn capture_queues_matching_read_ops() {
        let tdi = [0xFF; 3];
        let mut tms = [0u8; 3];
        set_bit(&mut tms, 23, true);
        let (_, pending) = encode(&tdi, &tms, 24, true);
        assert!(matches!(pending[0], ReadOp::Bytes(2)));
        assert!(matches!(pending[1], ReadOp::Bits(7)));
        assert!(matches!(pending[2], ReadOp::Tms));
    }

    #[test]
    fn reply_framing() {
        // Full byte intact, 3 residual bits right-justified, TMS bit in
        // bit 7.
        let ops = [ReadOp::Bytes(1), ReadOp::Bits(3), ReadOp::Tms];
        let reply = [0xA5, 0b1010_0000, 0x80];
        let mut out = vec![0u8; 2];
        let mut cursor = 0;
        decode_replies(&ops, &reply, &mut out, &mut cursor);
        assert_eq!(cursor, 12);
        // Bits 8..11 are 101 then 1: 0b1101 low nibble.
        assert_eq!(out, vec![0xA5, 0x0D]);
    }

    #[test]
    fn encoded_commands_conserve_tck_edges() {
        fn edges(mut bytes: &[u8]) -> usize {
            let mut n = 0;
            while let Some((&op, rest)) = bytes.split_first() {
                match op {
                    0x19 | 0x39 => {
                        let len = rest[0] as usize | (rest[1] as usize) << 8;
                        n += 8 * (len + 1);
                        bytes = &rest[2 + len + 1..];
                    }
                    0x1B | 0x3B | 0x4B | 0x6B => {
                        n += rest[0] as usize + 1;
                        bytes = &rest[2..];
                    }
                    _ => panic!("unexpected opcode {op:#04x}"),
                }
            }
            n
        }
        let tdi = [0x5Au8; 40];
        let mut tms = [0u8; 40];
        for n_bits in [1usize, 7, 8, 9, 63, 64, 65, 300] {
            set_bit(&mut tms, n_bits - 1, true);
            let (bytes, _) = encode(&tdi, &tms, n_bits, false);
            assert_eq!(edges(&bytes), n_bits, "n_bits {n_bits}");
            set_bit(&mut tms, n_bits - 1, false);
        }
    }
}
