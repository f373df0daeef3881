//! SVF text parser.
//!
//! Statements terminate at `;`, `!` (and `//`) comment to end of line,
//! keywords are case insensitive and hex literals live inside parentheses,
//! possibly split across lines. Scan statements inherit TDI/MASK/SMASK
//! from the previous statement of the same kind when omitted, so the
//! returned [`Command`]s carry fully resolved data.

use crate::adapter::TrstMode;
use crate::bits::{bytes_for_bits, parse_hex};
use crate::error::{Error, Result};
use crate::svf::{Command, ScanPattern};
use crate::tap::TapState;

pub fn parse(source: &str) -> Result<Vec<Command>> {
    let mut parser = Parser::default();
    let mut commands = Vec::new();
    for stmt in split_statements(source) {
        if let Some(cmd) = parser.statement(&stmt)? {
            commands.push(cmd);
        }
    }
    Ok(commands)
}

struct Statement {
    line: usize,
    tokens: Vec<String>,
}

/// Split the source at `;`, dropping comments, spacing out parentheses and
/// uppercasing tokens. Keeps the first line number of every statement.
fn split_statements(source: &str) -> Vec<Statement> {
    let mut out = Vec::new();
    let mut text = String::new();
    let mut line = 1;
    let mut start_line = 1;
    let mut in_comment = false;
    let mut chars = source.chars().peekable();

    let mut flush = |text: &mut String, start_line: usize| {
        let tokens: Vec<String> = text
            .split_whitespace()
            .map(|t| t.to_ascii_uppercase())
            .collect();
        text.clear();
        if !tokens.is_empty() {
            out.push(Statement {
                line: start_line,
                tokens,
            });
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '\n' => {
                line += 1;
                in_comment = false;
                text.push(' ');
            }
            _ if in_comment => {}
            '!' => in_comment = true,
            '/' if chars.peek() == Some(&'/') => {
                chars.next();
                in_comment = true;
            }
            ';' => {
                flush(&mut text, start_line);
                start_line = line;
            }
            '(' | ')' => {
                text.push(' ');
                text.push(c);
                text.push(' ');
            }
            c => {
                if text.trim().is_empty() && !c.is_whitespace() {
                    start_line = line;
                }
                text.push(c);
            }
        }
    }
    flush(&mut text, start_line);
    out
}

fn parse_state(token: &str) -> Option<TapState> {
    Some(match token {
        "RESET" => TapState::Reset,
        "IDLE" | "RUN_TEST_IDLE" => TapState::Idle,
        "DRSELECT" => TapState::DrSelect,
        "DRCAPTURE" => TapState::DrCapture,
        "DRSHIFT" => TapState::DrShift,
        "DREXIT1" => TapState::DrExit1,
        "DRPAUSE" => TapState::DrPause,
        "DREXIT2" => TapState::DrExit2,
        "DRUPDATE" => TapState::DrUpdate,
        "IRSELECT" => TapState::IrSelect,
        "IRCAPTURE" => TapState::IrCapture,
        "IRSHIFT" => TapState::IrShift,
        "IREXIT1" => TapState::IrExit1,
        "IRPAUSE" => TapState::IrPause,
        "IREXIT2" => TapState::IrExit2,
        "IRUPDATE" => TapState::IrUpdate,
        _ => return None,
    })
}

fn is_stable(state: TapState) -> bool {
    matches!(
        state,
        TapState::Reset | TapState::Idle | TapState::DrPause | TapState::IrPause
    )
}

/// Sticky scan data carried between statements of the same kind.
#[derive(Default)]
struct ScanDefaults {
    length: usize,
    tdi: Option<Vec<u8>>,
    mask: Option<Vec<u8>>,
    smask: Option<Vec<u8>>,
}

#[derive(Clone, Copy, PartialEq)]
enum ScanKind {
    Sir,
    Sdr,
    Hir,
    Tir,
    Hdr,
    Tdr,
}

#[derive(Default)]
struct Parser {
    sir: ScanDefaults,
    sdr: ScanDefaults,
    hir: ScanDefaults,
    tir: ScanDefaults,
    hdr: ScanDefaults,
    tdr: ScanDefaults,
    run_state: Option<TapState>,
    end_state: Option<TapState>,
    frequency: Option<f64>,
}

impl Parser {
    fn statement(&mut self, stmt: &Statement) -> Result<Option<Command>> {
        let line = stmt.line;
        let tokens = &stmt.tokens;
        let keyword = tokens[0].as_str();
        let cmd = match keyword {
            "STATE" => {
                let path = tokens[1..]
                    .iter()
                    .map(|t| {
                        parse_state(t).ok_or_else(|| parse_error(line, format!("bad state {t}")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                if path.is_empty() {
                    return Err(parse_error(line, "STATE needs at least one state".into()));
                }
                Command::State { path }
            }
            "ENDIR" | "ENDDR" => {
                let state = self.single_stable_state(tokens, line)?;
                if keyword == "ENDIR" {
                    Command::EndIr(state)
                } else {
                    Command::EndDr(state)
                }
            }
            "FREQUENCY" => {
                let hz = match tokens.get(1) {
                    Some(t) => {
                        let hz = parse_number(t, line)?;
                        if let Some(unit) = tokens.get(2) {
                            if unit != "HZ" {
                                return Err(parse_error(line, format!("expected HZ, got {unit}")));
                            }
                        }
                        Some(hz)
                    }
                    None => None,
                };
                self.frequency = hz;
                Command::Frequency(hz)
            }
            "TRST" => {
                let mode = match tokens.get(1).map(String::as_str) {
                    Some("ON") => TrstMode::On,
                    Some("OFF") => TrstMode::Off,
                    Some("Z") => TrstMode::Z,
                    Some("ABSENT") => TrstMode::Absent,
                    other => {
                        return Err(parse_error(line, format!("bad TRST mode {other:?}")));
                    }
                };
                Command::Trst(mode)
            }
            "RUNTEST" => self.runtest(tokens, line)?,
            "SIR" => Command::Sir(self.scan(ScanKind::Sir, tokens, line)?),
            "SDR" => Command::Sdr(self.scan(ScanKind::Sdr, tokens, line)?),
            "HIR" => Command::Hir(self.scan(ScanKind::Hir, tokens, line)?),
            "TIR" => Command::Tir(self.scan(ScanKind::Tir, tokens, line)?),
            "HDR" => Command::Hdr(self.scan(ScanKind::Hdr, tokens, line)?),
            "TDR" => Command::Tdr(self.scan(ScanKind::Tdr, tokens, line)?),
            "PIO" | "PIOMAP" => {
                return Err(Error::UnsupportedCommand {
                    cmd: keyword.into(),
                });
            }
            _ => Command::Unknown {
                keyword: keyword.into(),
            },
        };
        Ok(Some(cmd))
    }

    fn single_stable_state(&self, tokens: &[String], line: usize) -> Result<TapState> {
        let token = tokens
            .get(1)
            .ok_or_else(|| parse_error(line, "missing state".into()))?;
        let state = parse_state(token)
            .filter(|s| is_stable(*s))
            .ok_or_else(|| parse_error(line, format!("{token} is not a stable state")))?;
        Ok(state)
    }

    fn runtest(&mut self, tokens: &[String], line: usize) -> Result<Command> {
        let mut i = 1;
        let mut run_state = None;
        let mut end_state = None;
        let mut cycles = None;
        let mut seconds = None;

        if let Some(state) = tokens.get(i).and_then(|t| parse_state(t)) {
            if !is_stable(state) {
                return Err(parse_error(line, "RUNTEST run_state must be stable".into()));
            }
            run_state = Some(state);
            i += 1;
        }
        while i < tokens.len() {
            match tokens[i].as_str() {
                "ENDSTATE" => {
                    let state = tokens
                        .get(i + 1)
                        .and_then(|t| parse_state(t))
                        .filter(|s| is_stable(*s))
                        .ok_or_else(|| parse_error(line, "bad ENDSTATE".into()))?;
                    end_state = Some(state);
                    i += 2;
                }
                "MAXIMUM" => {
                    // Advisory upper bound on the run time.
                    parse_number(
                        tokens
                            .get(i + 1)
                            .ok_or_else(|| parse_error(line, "missing MAXIMUM time".into()))?,
                        line,
                    )?;
                    if tokens.get(i + 2).map(String::as_str) != Some("SEC") {
                        return Err(parse_error(line, "MAXIMUM time needs SEC".into()));
                    }
                    i += 3;
                }
                t => {
                    let value = parse_number(t, line)?;
                    match tokens.get(i + 1).map(String::as_str) {
                        Some("TCK") => cycles = Some(value as u64),
                        Some("SEC") => seconds = Some(value),
                        other => {
                            return Err(parse_error(
                                line,
                                format!("expected TCK or SEC after {t}, got {other:?}"),
                            ));
                        }
                    }
                    i += 2;
                }
            }
        }

        let cycles = match (cycles, seconds) {
            (Some(c), _) => c,
            (None, Some(sec)) => {
                // Convert a pure time to clocks at the advertised frequency,
                // or a conservative 1 MHz when none was given.
                let hz = self.frequency.unwrap_or(1e6);
                (sec * hz).ceil() as u64
            }
            (None, None) => {
                return Err(parse_error(line, "RUNTEST needs a count or a time".into()));
            }
        };

        let run_state = run_state.or(self.run_state).unwrap_or(TapState::Idle);
        self.run_state = Some(run_state);
        let end_state = end_state.or(self.end_state).unwrap_or(run_state);
        self.end_state = Some(end_state);

        Ok(Command::RunTest {
            cycles,
            run_state,
            end_state,
        })
    }

    fn defaults_mut(&mut self, kind: ScanKind) -> &mut ScanDefaults {
        match kind {
            ScanKind::Sir => &mut self.sir,
            ScanKind::Sdr => &mut self.sdr,
            ScanKind::Hir => &mut self.hir,
            ScanKind::Tir => &mut self.tir,
            ScanKind::Hdr => &mut self.hdr,
            ScanKind::Tdr => &mut self.tdr,
        }
    }

    fn scan(&mut self, kind: ScanKind, tokens: &[String], line: usize) -> Result<ScanPattern> {
        let length = parse_number(
            tokens
                .get(1)
                .ok_or_else(|| parse_error(line, "missing scan length".into()))?,
            line,
        )? as usize;

        let mut tdi = None;
        let mut tdo = None;
        let mut mask = None;
        let mut smask = None;
        let mut i = 2;
        while i < tokens.len() {
            let key = tokens[i].clone();
            let (data, next) = parse_paren_hex(tokens, i + 1, length, line)?;
            match key.as_str() {
                "TDI" => tdi = Some(data),
                "TDO" => tdo = Some(data),
                "MASK" => mask = Some(data),
                "SMASK" => smask = Some(data),
                _ => return Err(parse_error(line, format!("unexpected token {key}"))),
            }
            i = next;
        }

        let defaults = self.defaults_mut(kind);
        if length != defaults.length {
            // Sticky data dies with a length change.
            *defaults = ScanDefaults {
                length,
                ..ScanDefaults::default()
            };
        }
        let tdi = match tdi.or_else(|| defaults.tdi.clone()) {
            Some(tdi) => tdi,
            None if length == 0 => Vec::new(),
            None => return Err(parse_error(line, "TDI required".into())),
        };
        let mask = mask.or_else(|| defaults.mask.clone());
        let smask = smask.or_else(|| defaults.smask.clone());
        defaults.tdi = Some(tdi.clone());
        defaults.mask = mask.clone();
        defaults.smask = smask.clone();

        debug_assert!(tdi.len() == bytes_for_bits(length));
        Ok(ScanPattern {
            length,
            tdi,
            tdo,
            mask,
            smask,
        })
    }
}

/// Parse `( HEX... )` starting at `at`; returns the data and the index
/// after the closing parenthesis.
fn parse_paren_hex(
    tokens: &[String],
    at: usize,
    length: usize,
    line: usize,
) -> Result<(Vec<u8>, usize)> {
    if tokens.get(at).map(String::as_str) != Some("(") {
        return Err(parse_error(line, "expected (".into()));
    }
    let mut hex = String::new();
    let mut i = at + 1;
    loop {
        match tokens.get(i) {
            Some(t) if t == ")" => break,
            Some(t) => {
                hex.push_str(t);
                i += 1;
            }
            None => return Err(parse_error(line, "unterminated hex literal".into())),
        }
    }
    let data = parse_hex(&hex, length).map_err(|detail| parse_error(line, detail))?;
    Ok((data, i + 1))
}

fn parse_number(token: &str, line: usize) -> Result<f64> {
    token
        .parse::<f64>()
        .map_err(|_| parse_error(line, format!("bad number {token}")))
}

fn parse_error(line: usize, detail: String) -> Error {
    Error::Parse { line, detail }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_representative_file() {
        let src = "\
! Preamble
TRST OFF;
ENDIR IDLE;
ENDDR IDLE;
FREQUENCY 1.00E+06 HZ;
STATE RESET IDLE;
SIR 6 TDI (09);
SDR 32 TDI (00000000) TDO (12345678) MASK (0FFFFFFF);
RUNTEST IDLE 100 TCK ENDSTATE IDLE;
";
        let cmds = parse(src).unwrap();
        assert_eq!(cmds.len(), 8);
        assert_eq!(cmds[0], Command::Trst(TrstMode::Off));
        assert_eq!(cmds[3], Command::Frequency(Some(1e6)));
        match &cmds[6] {
            Command::Sdr(p) => {
                assert_eq!(p.length, 32);
                assert_eq!(p.tdi, vec![0, 0, 0, 0]);
                assert_eq!(p.tdo.as_deref(), Some(&[0x78, 0x56, 0x34, 0x12][..]));
                assert_eq!(p.mask.as_deref(), Some(&[0xFF, 0xFF, 0xFF, 0x0F][..]));
            }
            other => panic!("expected SDR, got {other:?}"),
        }
        assert_eq!(
            cmds[7],
            Command::RunTest {
                cycles: 100,
                run_state: TapState::Idle,
                end_state: TapState::Idle,
            }
        );
    }

    #[test]
    fn hex_literals_may_span_lines_and_glue_to_keywords() {
        let src = "SDR 24 TDI(AB\n  CDEF) ;";
        let cmds = parse(src).unwrap();
        match &cmds[0] {
            Command::Sdr(p) => assert_eq!(p.tdi, vec![0xEF, 0xCD, 0xAB]),
            other => panic!("expected SDR, got {other:?}"),
        }
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let cmds = parse("state reset idle; sir 8 tdi (a5);").unwrap();
        assert_eq!(
            cmds[0],
            Command::State {
                path: vec![TapState::Reset, TapState::Idle]
            }
        );
        match &cmds[1] {
            Command::Sir(p) => assert_eq!(p.tdi, vec![0xA5]),
            other => panic!("expected SIR, got {other:?}"),
        }
    }

    #[test]
    fn tdi_and_mask_are_sticky_per_kind() {
        let src = "SIR 8 TDI (AA) MASK (0F); SIR 8 TDO (55); SIR 4 TDI (01);";
        let cmds = parse(src).unwrap();
        match (&cmds[0], &cmds[1], &cmds[2]) {
            (Command::Sir(a), Command::Sir(b), Command::Sir(c)) => {
                assert_eq!(b.tdi, a.tdi);
                assert_eq!(b.mask, a.mask);
                assert_eq!(b.tdo.as_deref(), Some(&[0x55][..]));
                // A length change clears the sticky data.
                assert_eq!(c.tdi, vec![0x01]);
                assert_eq!(c.mask, None);
            }
            other => panic!("expected three SIRs, got {other:?}"),
        }
    }

    #[test]
    fn missing_tdi_is_an_error() {
        match parse("SDR 8 TDO (11);") {
            Err(Error::Parse { line: 1, .. }) => {}
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn pio_is_rejected_not_skipped() {
        match parse("PIO (HLZ);") {
            Err(Error::UnsupportedCommand { cmd }) => assert_eq!(cmd, "PIO"),
            other => panic!("expected UnsupportedCommand, got {other:?}"),
        }
    }

    #[test]
    fn unknown_keywords_are_kept_for_the_executor_to_skip() {
        let cmds = parse("BOGUS;").unwrap();
        assert_eq!(
            cmds[0],
            Command::Unknown {
                keyword: "BOGUS".into()
            }
        );
    }

    #[test]
    fn error_lines_point_at_the_statement_start() {
        let src = "STATE IDLE;\n\nSDR 8 TDI (XYZ);";
        match parse(src) {
            Err(Error::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn timed_runtest_converts_with_the_declared_frequency() {
        let cmds = parse("FREQUENCY 1E4 HZ; RUNTEST 0.5 SEC;").unwrap();
        assert_eq!(
            cmds[1],
            Command::RunTest {
                cycles: 5000,
                run_state: TapState::Idle,
                end_state: TapState::Idle,
            }
        );
    }

    #[test]
    fn formatting_then_reparsing_is_identity() {
        let src = "\
ENDIR IRPAUSE;
HIR 8 TDI (FF);
SIR 10 TDI (2A1) TDO (155) MASK (3FF);
SDR 16 TDI (ABCD);
RUNTEST DRPAUSE 42 TCK;
STATE DRPAUSE;
TRST Z;
";
        let first = parse(src).unwrap();
        let formatted: String = first
            .iter()
            .map(|c| format!("{c}\n"))
            .collect();
        let second = parse(&formatted).unwrap();
        assert_eq!(first, second);
    }
}
