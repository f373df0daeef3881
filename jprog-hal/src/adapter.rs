//! Wire-level JTAG adapters.
//!
//! An adapter turns shift requests into the byte stream its hardware
//! understands and runs them through the USB link. It never interprets TAP
//! states; the TMS bits it is handed are transmitted as-is.

pub mod blaster;
pub mod mpsse;

use crate::error::Result;

/// Drive state requested for the optional TRST line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrstMode {
    On,
    Off,
    Z,
    Absent,
}

pub trait Adapter {
    /// Clock `n_bits` TCK edges, presenting `tdi[i]` and `tms[i]` on edge
    /// `i` (both LSB-first packed). With `capture`, returns `n_bits` of TDO
    /// sampled on the rising edges, packed the same way; an adapter that
    /// cannot sample reliably at this size may decline and return `None`.
    ///
    /// The final bit's TMS value is transmitted like any other, so the TAP
    /// transitions on the last rising edge.
    fn shift(
        &mut self,
        tdi: &[u8],
        tms: &[u8],
        n_bits: usize,
        capture: bool,
    ) -> Result<Option<Vec<u8>>>;

    /// Write-only fast path: `n_bits - 1` bits with TMS low, then the final
    /// bit with TMS high to leave the shift state.
    fn shift_bytes(&mut self, tdi: &[u8], n_bits: usize) -> Result<()>;

    /// Clock `cycles` TCK edges with TMS and TDI held low.
    fn toggle_clock(&mut self, cycles: usize) -> Result<()>;

    /// Advisory TCK frequency request; adapters without a programmable
    /// clock ignore it.
    fn set_frequency(&mut self, hz: u32) -> Result<()> {
        log::debug!("TCK frequency request for {hz} Hz ignored");
        Ok(())
    }

    /// Drive the TRST line. Neither supported cable wires one out, so the
    /// default records the request and does nothing.
    fn set_trst(&mut self, mode: TrstMode) -> Result<()> {
        log::debug!("TRST {mode:?} ignored: no TRST line on this cable");
        Ok(())
    }

    /// Push any locally buffered command bytes to the hardware.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: Adapter + ?Sized> Adapter for Box<T> {
    fn shift(
        &mut self,
        tdi: &[u8],
        tms: &[u8],
        n_bits: usize,
        capture: bool,
    ) -> Result<Option<Vec<u8>>> {
        (**self).shift(tdi, tms, n_bits, capture)
    }

    fn shift_bytes(&mut self, tdi: &[u8], n_bits: usize) -> Result<()> {
        (**self).shift_bytes(tdi, n_bits)
    }

    fn toggle_clock(&mut self, cycles: usize) -> Result<()> {
        (**self).toggle_clock(cycles)
    }

    fn set_frequency(&mut self, hz: u32) -> Result<()> {
        (**self).set_frequency(hz)
    }

    fn set_trst(&mut self, mode: TrstMode) -> Result<()> {
        (**self).set_trst(mode)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}
