//! Shared test double: an [`Adapter`] that simulates the device-side TAP.
//!
//! Every TMS bit handed to the mock is applied to a simulated TAP state,
//! which lets tests assert that the engine's bookkeeping never diverges
//! from what a real device would do. Capture requests are answered from a
//! programmable queue.

use std::collections::VecDeque;

use crate::adapter::{Adapter, TrstMode};
use crate::bits::{bytes_for_bits, get_bit};
use crate::error::Result;
use crate::tap::TapState;

#[derive(Debug, PartialEq)]
pub(crate) enum Event {
    Shift { n_bits: usize, capture: bool },
    ShiftBytes { n_bits: usize },
    ToggleClock(usize),
    Frequency(u32),
    Trst(TrstMode),
}

pub(crate) struct MockAdapter {
    state: TapState,
    tms_trace: Vec<bool>,
    tdi_trace: Vec<bool>,
    events: Vec<Event>,
    edges: usize,
    used_shift_bytes: bool,
    /// Responses handed out for capturing shifts, LSB-first packed.
    pub tdo_queue: VecDeque<Vec<u8>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            state: TapState::Reset,
            tms_trace: Vec::new(),
            tdi_trace: Vec::new(),
            events: Vec::new(),
            edges: 0,
            used_shift_bytes: false,
            tdo_queue: VecDeque::new(),
        }
    }

    fn clock(&mut self, tms: bool, tdi: bool) {
        self.state = self.state.step(tms);
        self.tms_trace.push(tms);
        self.tdi_trace.push(tdi);
        self.edges += 1;
    }

    pub fn device_state(&self) -> TapState {
        self.state
    }

    pub fn tms_trace(&self) -> Vec<bool> {
        self.tms_trace.clone()
    }

    pub fn tdi_trace(&self) -> Vec<bool> {
        self.tdi_trace.clone()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn edges(&self) -> usize {
        self.edges
    }

    pub fn clocked_cycles(&self) -> usize {
        self.events
            .iter()
            .map(|e| match e {
                Event::ToggleClock(n) => *n,
                _ => 0,
            })
            .sum()
    }

    pub fn used_shift_bytes(&self) -> bool {
        self.used_shift_bytes
    }

    pub fn clear_traces(&mut self) {
        self.tms_trace.clear();
        self.tdi_trace.clear();
        self.events.clear();
        self.edges = 0;
    }
}

impl Adapter for MockAdapter {
    fn shift(
        &mut self,
        tdi: &[u8],
        tms: &[u8],
        n_bits: usize,
        capture: bool,
    ) -> Result<Option<Vec<u8>>> {
        self.events.push(Event::Shift { n_bits, capture });
        for i in 0..n_bits {
            self.clock(get_bit(tms, i), get_bit(tdi, i));
        }
        if capture {
            let tdo = self
                .tdo_queue
                .pop_front()
                .unwrap_or_else(|| vec![0u8; bytes_for_bits(n_bits)]);
            Ok(Some(tdo))
        } else {
            Ok(None)
        }
    }

    fn shift_bytes(&mut self, tdi: &[u8], n_bits: usize) -> Result<()> {
        self.events.push(Event::ShiftBytes { n_bits });
        self.used_shift_bytes = true;
        for i in 0..n_bits {
            self.clock(i == n_bits - 1, get_bit(tdi, i));
        }
        Ok(())
    }

    fn toggle_clock(&mut self, cycles: usize) -> Result<()> {
        self.events.push(Event::ToggleClock(cycles));
        for _ in 0..cycles {
            self.clock(false, false);
        }
        Ok(())
    }

    fn set_frequency(&mut self, hz: u32) -> Result<()> {
        self.events.push(Event::Frequency(hz));
        Ok(())
    }

    fn set_trst(&mut self, mode: TrstMode) -> Result<()> {
        self.events.push(Event::Trst(mode));
        Ok(())
    }
}
