//! TAP state machine engine.
//!
//! Tracks the state the target's TAP is in, computes minimum TMS paths
//! between states and drives the adapter with them. The engine stores no
//! SVF session state; headers and trailers are handed in per scan by the
//! caller.

use std::collections::VecDeque;

use crate::adapter::Adapter;
use crate::bits::{bytes_for_bits, set_bit};
use crate::error::Result;

/// The sixteen IEEE 1149.1 TAP controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TapState {
    Reset = 0,
    Idle = 1,
    DrSelect = 2,
    DrCapture = 3,
    DrShift = 4,
    DrExit1 = 5,
    DrPause = 6,
    DrExit2 = 7,
    DrUpdate = 8,
    IrSelect = 9,
    IrCapture = 10,
    IrShift = 11,
    IrExit1 = 12,
    IrPause = 13,
    IrExit2 = 14,
    IrUpdate = 15,
}

impl TapState {
    pub const ALL: [TapState; 16] = [
        TapState::Reset,
        TapState::Idle,
        TapState::DrSelect,
        TapState::DrCapture,
        TapState::DrShift,
        TapState::DrExit1,
        TapState::DrPause,
        TapState::DrExit2,
        TapState::DrUpdate,
        TapState::IrSelect,
        TapState::IrCapture,
        TapState::IrShift,
        TapState::IrExit1,
        TapState::IrPause,
        TapState::IrExit2,
        TapState::IrUpdate,
    ];

    /// The state reached from here after one TCK edge with the given TMS.
    pub fn step(self, tms: bool) -> TapState {
        use TapState::*;
        match (self, tms) {
            (Reset, false) => Idle,
            (Reset, true) => Reset,
            (Idle, false) => Idle,
            (Idle, true) => DrSelect,
            (DrSelect, false) => DrCapture,
            (DrSelect, true) => IrSelect,
            (DrCapture, false) => DrShift,
            (DrCapture, true) => DrExit1,
            (DrShift, false) => DrShift,
            (DrShift, true) => DrExit1,
            (DrExit1, false) => DrPause,
            (DrExit1, true) => DrUpdate,
            (DrPause, false) => DrPause,
            (DrPause, true) => DrExit2,
            (DrExit2, false) => DrShift,
            (DrExit2, true) => DrUpdate,
            (DrUpdate, false) => Idle,
            (DrUpdate, true) => DrSelect,
            (IrSelect, false) => IrCapture,
            (IrSelect, true) => Reset,
            (IrCapture, false) => IrShift,
            (IrCapture, true) => IrExit1,
            (IrShift, false) => IrShift,
            (IrShift, true) => IrExit1,
            (IrExit1, false) => IrPause,
            (IrExit1, true) => IrUpdate,
            (IrPause, false) => IrPause,
            (IrPause, true) => IrExit2,
            (IrExit2, false) => IrShift,
            (IrExit2, true) => IrUpdate,
            (IrUpdate, false) => Idle,
            (IrUpdate, true) => DrSelect,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Shortest TMS sequence from one state to another, preferring TMS=0 on
/// equal-length alternatives. Empty when already there.
pub fn find_path(from: TapState, to: TapState) -> Vec<bool> {
    if from == to {
        return Vec::new();
    }
    let mut visited = [false; 16];
    let mut prev: [Option<(usize, bool)>; 16] = [None; 16];
    let mut queue = VecDeque::new();
    visited[from.index()] = true;
    queue.push_back(from);
    while let Some(state) = queue.pop_front() {
        for tms in [false, true] {
            let next = state.step(tms);
            if visited[next.index()] {
                continue;
            }
            visited[next.index()] = true;
            prev[next.index()] = Some((state.index(), tms));
            if next == to {
                let mut path = vec![tms];
                let mut cur = state.index();
                while let Some((parent, t)) = prev[cur] {
                    path.push(t);
                    cur = parent;
                }
                path.reverse();
                return path;
            }
            queue.push_back(next);
        }
    }
    unreachable!("the TAP graph is strongly connected")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Ir,
    Dr,
}

/// Fixed bits scanned before (header) or after (trailer) every payload,
/// for devices that sit around the target on the chain.
#[derive(Debug, Clone, Default)]
pub struct ScanSegment {
    pub bits: usize,
    pub tdi: Vec<u8>,
}

impl ScanSegment {
    pub fn new(bits: usize, tdi: Vec<u8>) -> Self {
        debug_assert!(tdi.len() >= bytes_for_bits(bits));
        Self { bits, tdi }
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

/// Payload sizes from which write-only whole-byte scans take the adapter's
/// byte fast path.
const FAST_PATH_BITS: usize = 128;

/// TMS-high cycles clocked by [`TapEngine::reset`]. Five suffice on paper;
/// real chains behind noisy cables appreciate a longer soak.
const RESET_CYCLES: usize = 100;

pub struct TapEngine<A: Adapter> {
    adapter: A,
    state: TapState,
}

impl<A: Adapter> TapEngine<A> {
    /// Wrap an adapter. The engine assumes nothing about the device state
    /// until [`reset`](Self::reset) has run.
    pub fn new(adapter: A) -> Self {
        Self {
            adapter,
            state: TapState::Reset,
        }
    }

    pub fn current_state(&self) -> TapState {
        self.state
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    /// Force the TAP into RESET with a long TMS-high burst, then step to
    /// IDLE.
    pub fn reset(&mut self) -> Result<()> {
        let bits = RESET_CYCLES + 1;
        let mut tms = vec![0u8; bytes_for_bits(bits)];
        for i in 0..RESET_CYCLES {
            set_bit(&mut tms, i, true);
        }
        let tdi = vec![0u8; bytes_for_bits(bits)];
        self.adapter.shift(&tdi, &tms, bits, false)?;
        self.state = TapState::Idle;
        Ok(())
    }

    /// Take the minimum TMS path to `target`.
    pub fn move_to(&mut self, target: TapState) -> Result<()> {
        if self.state == target {
            return Ok(());
        }
        let path = find_path(self.state, target);
        log::debug!("TAP {:?} -> {:?} in {} clocks", self.state, target, path.len());
        let mut tms = vec![0u8; bytes_for_bits(path.len())];
        for (i, bit) in path.iter().enumerate() {
            set_bit(&mut tms, i, *bit);
        }
        let tdi = vec![0u8; tms.len()];
        self.adapter.shift(&tdi, &tms, path.len(), false)?;
        self.state = target;
        Ok(())
    }

    /// Clock `cycles` in `run_state`, then settle in `end_state`.
    pub fn run_test(
        &mut self,
        cycles: usize,
        run_state: TapState,
        end_state: TapState,
    ) -> Result<()> {
        self.move_to(run_state)?;
        self.adapter.toggle_clock(cycles)?;
        if cycles > 0 {
            // TMS was held low, which moves RESET to IDLE and keeps the
            // other stable states put.
            self.state = self.state.step(false);
        }
        self.move_to(end_state)?;
        Ok(())
    }

    /// Scan `bits` of `tdi` through a register.
    ///
    /// An installed header is shifted first and a trailer last, both with
    /// TMS low except for the exit bit. With `end` set, the final bit of
    /// the payload (or of the trailer, if one is present) carries TMS high
    /// and the engine then moves to `end`; with `end` unset the scan stops
    /// inside the shift state for a follow-up call.
    ///
    /// Returns the captured payload TDO when `capture` was requested and
    /// the adapter honoured it.
    #[allow(clippy::too_many_arguments)]
    pub fn scan(
        &mut self,
        reg: Register,
        tdi: &[u8],
        bits: usize,
        header: Option<&ScanSegment>,
        trailer: Option<&ScanSegment>,
        end: Option<TapState>,
        capture: bool,
    ) -> Result<Option<Vec<u8>>> {
        let (shift_state, exit1) = match reg {
            Register::Ir => (TapState::IrShift, TapState::IrExit1),
            Register::Dr => (TapState::DrShift, TapState::DrExit1),
        };
        if bits == 0 {
            return Ok(None);
        }
        let header = header.filter(|h| !h.is_empty());
        let trailer = trailer.filter(|t| !t.is_empty());

        self.move_to(shift_state)?;

        if let Some(h) = header {
            let tms = vec![0u8; bytes_for_bits(h.bits)];
            self.adapter.shift(&h.tdi, &tms, h.bits, false)?;
        }

        let exit_in_payload = end.is_some() && trailer.is_none();
        let plain = !capture && header.is_none() && trailer.is_none();
        let tdo = if plain && exit_in_payload && bits >= FAST_PATH_BITS {
            self.adapter.shift_bytes(tdi, bits)?;
            None
        } else {
            let mut tms = vec![0u8; bytes_for_bits(bits)];
            if exit_in_payload {
                set_bit(&mut tms, bits - 1, true);
            }
            self.adapter.shift(tdi, &tms, bits, capture)?
        };

        if let Some(t) = trailer {
            let mut tms = vec![0u8; bytes_for_bits(t.bits)];
            if end.is_some() {
                set_bit(&mut tms, t.bits - 1, true);
            }
            self.adapter.shift(&t.tdi, &tms, t.bits, false)?;
        }

        if let Some(end_state) = end {
            self.state = exit1;
            self.move_to(end_state)?;
        }
        Ok(tdo)
    }

    /// Scan the instruction register and settle in `end`.
    pub fn shift_ir(
        &mut self,
        tdi: &[u8],
        bits: usize,
        end: TapState,
        capture: bool,
    ) -> Result<Option<Vec<u8>>> {
        self.scan(Register::Ir, tdi, bits, None, None, Some(end), capture)
    }

    /// Scan the data register and settle in `end`.
    pub fn shift_dr(
        &mut self,
        tdi: &[u8],
        bits: usize,
        end: TapState,
        capture: bool,
    ) -> Result<Option<Vec<u8>>> {
        self.scan(Register::Dr, tdi, bits, None, None, Some(end), capture)
    }
}
