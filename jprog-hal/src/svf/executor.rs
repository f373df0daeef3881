//! Drives a [`TapEngine`] from parsed SVF commands.
//!
//! The executor owns the SVF session state: the stable states entered
//! after IR/DR scans and the installed header/trailer patterns. Scans with
//! a TDO pattern are verified byte by byte under their mask; a mismatch
//! aborts at the failing command. Progress is surfaced after every
//! command, and the cancel token is polled between commands.

use crate::adapter::Adapter;
use crate::bits::bytes_for_bits;
use crate::error::{Error, Result};
use crate::report::{CancelToken, Reporter};
use crate::svf::{parse, state_name, Command, ScanPattern};
use crate::tap::{Register, ScanSegment, TapEngine, TapState};

/// Mutable per-session SVF state.
pub struct SessionState {
    pub end_ir: TapState,
    pub end_dr: TapState,
    pub header_ir: ScanSegment,
    pub trailer_ir: ScanSegment,
    pub header_dr: ScanSegment,
    pub trailer_dr: ScanSegment,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            end_ir: TapState::Idle,
            end_dr: TapState::Idle,
            header_ir: ScanSegment::default(),
            trailer_ir: ScanSegment::default(),
            header_dr: ScanSegment::default(),
            trailer_dr: ScanSegment::default(),
        }
    }
}

/// Parse `source` and execute it command by command.
pub fn play<A: Adapter>(
    tap: &mut TapEngine<A>,
    source: &str,
    reporter: &mut Reporter,
    cancel: &CancelToken,
) -> Result<()> {
    let commands = parse(source)?;
    reporter.info(&format!("SVF: {} commands", commands.len()));
    execute(tap, &commands, reporter, cancel)
}

/// Execute already-parsed commands. The TAP is reset first so the engine
/// and the device agree on their starting state.
pub fn execute<A: Adapter>(
    tap: &mut TapEngine<A>,
    commands: &[Command],
    reporter: &mut Reporter,
    cancel: &CancelToken,
) -> Result<()> {
    let mut session = SessionState::default();
    tap.reset()?;

    let total = commands.len();
    for (index, command) in commands.iter().enumerate() {
        if cancel.is_cancelled() {
            tap.reset()?;
            return Err(Error::Cancelled);
        }
        step(tap, &mut session, command, reporter).map_err(|e| {
            reporter.error(&format!("SVF command {} failed: {e}", index + 1));
            log::debug!("failing command: {command}");
            e
        })?;
        reporter.progress((((index + 1) * 100) / total.max(1)) as u8);
    }
    tap.adapter_mut().flush()?;
    reporter.success("SVF playback complete");
    Ok(())
}

fn step<A: Adapter>(
    tap: &mut TapEngine<A>,
    session: &mut SessionState,
    command: &Command,
    reporter: &mut Reporter,
) -> Result<()> {
    match command {
        Command::State { path } => {
            // Intermediate path states are advisory; the minimum TMS path
            // to the final state is used instead.
            match path.last() {
                Some(target) => tap.move_to(*target),
                None => Ok(()),
            }
        }
        Command::EndIr(state) => {
            session.end_ir = *state;
            Ok(())
        }
        Command::EndDr(state) => {
            session.end_dr = *state;
            Ok(())
        }
        Command::Hir(p) => {
            session.header_ir = segment(p);
            Ok(())
        }
        Command::Tir(p) => {
            session.trailer_ir = segment(p);
            Ok(())
        }
        Command::Hdr(p) => {
            session.header_dr = segment(p);
            Ok(())
        }
        Command::Tdr(p) => {
            session.trailer_dr = segment(p);
            Ok(())
        }
        Command::Sir(p) => scan(tap, session, Register::Ir, p, reporter),
        Command::Sdr(p) => scan(tap, session, Register::Dr, p, reporter),
        Command::RunTest {
            cycles,
            run_state,
            end_state,
        } => tap.run_test(*cycles as usize, *run_state, *end_state),
        Command::Frequency(hz) => match hz {
            Some(hz) => tap.adapter_mut().set_frequency(*hz as u32),
            None => Ok(()),
        },
        Command::Trst(mode) => tap.adapter_mut().set_trst(*mode),
        Command::Unknown { keyword } => {
            reporter.warning(&format!("skipping unrecognised SVF command {keyword}"));
            Ok(())
        }
    }
}

fn segment(p: &ScanPattern) -> ScanSegment {
    ScanSegment::new(p.length, p.tdi.clone())
}

fn scan<A: Adapter>(
    tap: &mut TapEngine<A>,
    session: &SessionState,
    reg: Register,
    pattern: &ScanPattern,
    reporter: &mut Reporter,
) -> Result<()> {
    if pattern.length == 0 {
        return Ok(());
    }
    let (header, trailer, end) = match reg {
        Register::Ir => (&session.header_ir, &session.trailer_ir, session.end_ir),
        Register::Dr => (&session.header_dr, &session.trailer_dr, session.end_dr),
    };
    let capture = pattern.tdo.is_some();
    let tdo = tap.scan(
        reg,
        &pattern.tdi,
        pattern.length,
        Some(header),
        Some(trailer),
        Some(end),
        capture,
    )?;
    log::debug!(
        "{} {} bits, end {}",
        match reg {
            Register::Ir => "SIR",
            Register::Dr => "SDR",
        },
        pattern.length,
        state_name(end)
    );

    if let Some(expected) = &pattern.tdo {
        match tdo {
            Some(got) => verify(pattern, expected, &got)?,
            None => reporter.warning(&format!(
                "TDO verification of {} bits skipped: adapter declined capture",
                pattern.length
            )),
        }
    }
    Ok(())
}

fn verify(pattern: &ScanPattern, expected: &[u8], got: &[u8]) -> Result<()> {
    let nbytes = bytes_for_bits(pattern.length);
    for i in 0..nbytes {
        let mut mask = pattern.mask.as_ref().map_or(0xFF, |m| m[i]);
        if i == nbytes - 1 && pattern.length % 8 != 0 {
            // Bits past the scan length are unspecified.
            mask &= (1 << (pattern.length % 8)) - 1;
        }
        let got = got.get(i).copied().unwrap_or(0);
        if got & mask != expected[i] & mask {
            return Err(Error::TdoMismatch {
                byte_index: i,
                got,
                expected: expected[i],
                mask,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Event, MockAdapter};

    fn quiet() -> (Reporter, CancelToken) {
        (Reporter::new(), CancelToken::new())
    }

    #[test]
    fn sdr_honours_end_state_and_verifies_tdo() {
        let mut tap = TapEngine::new(MockAdapter::new());
        tap.adapter_mut().tdo_queue.push_back(vec![0x78, 0x56]);
        let (mut reporter, cancel) = quiet();
        play(
            &mut tap,
            "ENDDR DRPAUSE; SDR 16 TDI (0000) TDO (5678);",
            &mut reporter,
            &cancel,
        )
        .unwrap();
        assert_eq!(tap.current_state(), TapState::DrPause);
        assert_eq!(tap.adapter_mut().device_state(), TapState::DrPause);
    }

    #[test]
    fn tdo_mismatch_aborts_with_the_failing_byte() {
        let mut tap = TapEngine::new(MockAdapter::new());
        tap.adapter_mut().tdo_queue.push_back(vec![0x78, 0x16]);
        let (mut reporter, cancel) = quiet();
        let err = play(
            &mut tap,
            "SDR 16 TDI (0000) TDO (5678) MASK (F0FF);",
            &mut reporter,
            &cancel,
        )
        .unwrap_err();
        match err {
            Error::TdoMismatch {
                byte_index,
                got,
                expected,
                mask,
            } => {
                assert_eq!(byte_index, 1);
                assert_eq!(got, 0x16);
                assert_eq!(expected, 0x56);
                assert_eq!(mask, 0xF0);
            }
            other => panic!("expected TdoMismatch, got {other:?}"),
        }
    }

    #[test]
    fn masked_out_bits_do_not_fail_verification() {
        let mut tap = TapEngine::new(MockAdapter::new());
        tap.adapter_mut().tdo_queue.push_back(vec![0xFF]);
        let (mut reporter, cancel) = quiet();
        play(
            &mut tap,
            "SDR 8 TDI (00) TDO (0F) MASK (0F);",
            &mut reporter,
            &cancel,
        )
        .unwrap();
    }

    #[test]
    fn headers_and_trailers_are_applied_to_scans() {
        let mut tap = TapEngine::new(MockAdapter::new());
        let (mut reporter, cancel) = quiet();
        play(
            &mut tap,
            "HDR 4 TDI (0); TDR 2 TDI (0); SDR 8 TDI (FF);",
            &mut reporter,
            &cancel,
        )
        .unwrap();
        // The SDR must have clocked header + payload + trailer bits while
        // in DRSHIFT; count the data edges between the two TAP moves.
        let events = tap.adapter_mut().events();
        let data_bits: usize = events
            .iter()
            .filter_map(|e| match e {
                Event::Shift { n_bits, .. } => Some(*n_bits),
                _ => None,
            })
            .sum();
        // 101 reset bits + 3 move bits + 14 scan bits + 2 exit move bits.
        assert_eq!(data_bits, 101 + 3 + 4 + 8 + 2 + 2);
        assert_eq!(tap.adapter_mut().device_state(), TapState::Idle);
    }

    #[test]
    fn unknown_commands_are_skipped_with_a_warning() {
        let mut tap = TapEngine::new(MockAdapter::new());
        let (mut reporter, cancel) = quiet();
        play(&mut tap, "BOGUS; STATE IDLE;", &mut reporter, &cancel).unwrap();
    }

    #[test]
    fn trst_and_frequency_reach_the_adapter() {
        let mut tap = TapEngine::new(MockAdapter::new());
        let (mut reporter, cancel) = quiet();
        play(
            &mut tap,
            "TRST OFF; FREQUENCY 1E6 HZ;",
            &mut reporter,
            &cancel,
        )
        .unwrap();
        let events = tap.adapter_mut().events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Trst(crate::adapter::TrstMode::Off))));
        assert!(events.iter().any(|e| matches!(e, Event::Frequency(1_000_000))));
    }

    #[test]
    fn cancellation_resets_the_tap() {
        let mut tap = TapEngine::new(MockAdapter::new());
        let (mut reporter, cancel) = quiet();
        cancel.cancel();
        let err = play(&mut tap, "STATE RESET;", &mut reporter, &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(tap.adapter_mut().device_state(), TapState::Idle);
    }

    #[test]
    fn progress_reaches_one_hundred() {
        let mut tap = TapEngine::new(MockAdapter::new());
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut reporter = Reporter::new().on_progress(move |p| sink.lock().unwrap().push(p));
        let cancel = CancelToken::new();
        play(
            &mut tap,
            "STATE IDLE; RUNTEST 10 TCK; STATE RESET;",
            &mut reporter,
            &cancel,
        )
        .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(*seen.last().unwrap(), 100);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }
}
