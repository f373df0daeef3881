//! Serial Vector Format support: command model, parser and executor.
//!
//! SVF is the vendor-neutral text format for canned JTAG sequences. The
//! parser resolves each statement into a [`Command`]; the executor drives a
//! [`TapEngine`](crate::tap::TapEngine) with them, honouring the session
//! state (end states, headers, trailers) the commands establish.

mod executor;
mod parser;

pub use executor::{execute, play, SessionState};
pub use parser::parse;

use std::fmt;

use crate::adapter::TrstMode;
use crate::bits::format_hex;
use crate::tap::TapState;

/// Scan data for SIR/SDR and the header/trailer commands.
///
/// All vectors are LSB-first packed and sized for `length` bits. `tdi` is
/// resolved at parse time (SVF lets a statement inherit the previous one's
/// TDI); `tdo` is only present when the statement asked for verification.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanPattern {
    pub length: usize,
    pub tdi: Vec<u8>,
    pub tdo: Option<Vec<u8>>,
    pub mask: Option<Vec<u8>>,
    pub smask: Option<Vec<u8>>,
}

/// One parsed SVF statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Walk to a stable state; only the final element is binding.
    State { path: Vec<TapState> },
    Sir(ScanPattern),
    Sdr(ScanPattern),
    RunTest {
        cycles: u64,
        run_state: TapState,
        end_state: TapState,
    },
    /// Advisory maximum TCK frequency; `None` clears it.
    Frequency(Option<f64>),
    Trst(TrstMode),
    EndIr(TapState),
    EndDr(TapState),
    Hir(ScanPattern),
    Tir(ScanPattern),
    Hdr(ScanPattern),
    Tdr(ScanPattern),
    /// A keyword the executor will log and skip.
    Unknown { keyword: String },
}

pub(crate) fn state_name(state: TapState) -> &'static str {
    match state {
        TapState::Reset => "RESET",
        TapState::Idle => "IDLE",
        TapState::DrSelect => "DRSELECT",
        TapState::DrCapture => "DRCAPTURE",
        TapState::DrShift => "DRSHIFT",
        TapState::DrExit1 => "DREXIT1",
        TapState::DrPause => "DRPAUSE",
        TapState::DrExit2 => "DREXIT2",
        TapState::DrUpdate => "DRUPDATE",
        TapState::IrSelect => "IRSELECT",
        TapState::IrCapture => "IRCAPTURE",
        TapState::IrShift => "IRSHIFT",
        TapState::IrExit1 => "IREXIT1",
        TapState::IrPause => "IRPAUSE",
        TapState::IrExit2 => "IREXIT2",
        TapState::IrUpdate => "IRUPDATE",
    }
}

fn fmt_pattern(f: &mut fmt::Formatter<'_>, keyword: &str, p: &ScanPattern) -> fmt::Result {
    write!(f, "{keyword} {}", p.length)?;
    if p.length > 0 {
        write!(f, " TDI ({})", format_hex(&p.tdi, p.length))?;
        if let Some(tdo) = &p.tdo {
            write!(f, " TDO ({})", format_hex(tdo, p.length))?;
        }
        if let Some(mask) = &p.mask {
            write!(f, " MASK ({})", format_hex(mask, p.length))?;
        }
        if let Some(smask) = &p.smask {
            write!(f, " SMASK ({})", format_hex(smask, p.length))?;
        }
    }
    f.write_str(";")
}

/// Canonical single-line rendering; parsing it back yields the same
/// command.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::State { path } => {
                f.write_str("STATE")?;
                for s in path {
                    write!(f, " {}", state_name(*s))?;
                }
                f.write_str(";")
            }
            Command::Sir(p) => fmt_pattern(f, "SIR", p),
            Command::Sdr(p) => fmt_pattern(f, "SDR", p),
            Command::Hir(p) => fmt_pattern(f, "HIR", p),
            Command::Tir(p) => fmt_pattern(f, "TIR", p),
            Command::Hdr(p) => fmt_pattern(f, "HDR", p),
            Command::Tdr(p) => fmt_pattern(f, "TDR", p),
            Command::RunTest {
                cycles,
                run_state,
                end_state,
            } => write!(
                f,
                "RUNTEST {} {cycles} TCK ENDSTATE {};",
                state_name(*run_state),
                state_name(*end_state)
            ),
            Command::Frequency(Some(hz)) => write!(f, "FREQUENCY {hz:E} HZ;"),
            Command::Frequency(None) => f.write_str("FREQUENCY;"),
            Command::Trst(mode) => {
                let mode = match mode {
                    TrstMode::On => "ON",
                    TrstMode::Off => "OFF",
                    TrstMode::Z => "Z",
                    TrstMode::Absent => "ABSENT",
                };
                write!(f, "TRST {mode};")
            }
            Command::EndIr(s) => write!(f, "ENDIR {};", state_name(*s)),
            Command::EndDr(s) => write!(f, "ENDDR {};", state_name(*s)),
            Command::Unknown { keyword } => write!(f, "{keyword};"),
        }
    }
}
