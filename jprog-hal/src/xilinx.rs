//! Xilinx 7-series SRAM configuration over JTAG.
//!
//! Sits directly on the [`TapEngine`]; no SVF involved. The configuration
//! payload of a `.bit` file is MSB-first per byte while JTAG shifts LSB
//! first, so every byte is bit-reversed before it goes down the DR chain.

use std::thread;
use std::time::Duration;

use crate::adapter::Adapter;
use crate::bits::reverse_bits;
use crate::error::{Error, Result};
use crate::report::{CancelToken, Reporter};
use crate::tap::{Register, TapEngine, TapState};

const IR_LEN: usize = 6;

/// 7-series JTAG instructions.
#[repr(u8)]
#[derive(Debug, Copy, Clone)]
enum Instruction {
    Idcode = 0b001001,
    CfgIn = 0b000101,
    Jprogram = 0b001011,
    Jstart = 0b001100,
    Bypass = 0b111111,
}

/// IDCODEs of known 7-series parts, revision bits masked off.
const KNOWN_DEVICES: &[(u32, &str)] = &[
    (0x3622093, "XC7S6"),
    (0x3620093, "XC7S15"),
    (0x37C4093, "XC7S25"),
    (0x362F093, "XC7S50"),
    (0x37C8093, "XC7S75"),
    (0x37C7093, "XC7S100"),
    (0x362D093, "XC7A35T"),
    (0x3631093, "XC7A100T"),
    (0x3722093, "XC7Z010"),
    (0x3727093, "XC7Z020"),
];

/// Look up a part name by IDCODE, ignoring the revision field.
pub fn device_name(idcode: u32) -> Option<&'static str> {
    let masked = idcode & 0x0FFF_FFFF;
    KNOWN_DEVICES
        .iter()
        .find(|(id, _)| *id == masked)
        .map(|(_, name)| *name)
}

/// Parsed `.bit` container.
///
/// The header is a sequence of tagged fields: `a`-`d` carry NUL-terminated
/// strings (design name, part, date, time) behind 16-bit big-endian
/// lengths, `e` carries the configuration payload behind a 32-bit length.
/// Files that are just the raw payload are accepted as-is.
#[derive(Debug, Default)]
pub struct BitFile {
    pub design: Option<String>,
    pub part: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub data: Vec<u8>,
}

impl BitFile {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::BitstreamFormat("empty file".into()));
        }
        match Self::parse_tagged(raw) {
            Some(bit) => Ok(bit),
            None => {
                log::debug!("no bit header found, treating the whole file as payload");
                Ok(BitFile {
                    data: raw.to_vec(),
                    ..BitFile::default()
                })
            }
        }
    }

    fn parse_tagged(raw: &[u8]) -> Option<BitFile> {
        let mut offset = 0;
        let header_len = read_u16(raw, &mut offset)? as usize;
        // Skip the fixed preamble and the field-count word after it.
        offset = offset.checked_add(header_len)? + 2;

        let mut bit = BitFile::default();
        loop {
            let tag = *raw.get(offset)?;
            offset += 1;
            match tag {
                b'a'..=b'd' => {
                    let len = read_u16(raw, &mut offset)? as usize;
                    let bytes = raw.get(offset..offset + len)?;
                    offset += len;
                    let text = std::str::from_utf8(bytes)
                        .ok()?
                        .trim_end_matches('\0')
                        .to_string();
                    match tag {
                        b'a' => bit.design = Some(text),
                        b'b' => bit.part = Some(text),
                        b'c' => bit.date = Some(text),
                        _ => bit.time = Some(text),
                    }
                }
                b'e' => {
                    let len = read_u32(raw, &mut offset)? as usize;
                    bit.data = raw.get(offset..offset + len)?.to_vec();
                    return Some(bit);
                }
                _ => return None,
            }
        }
    }

    pub fn describe(&self) -> String {
        match (&self.design, &self.part) {
            (Some(design), Some(part)) => {
                format!("{design} for {part}, {} bytes", self.data.len())
            }
            _ => format!("raw payload, {} bytes", self.data.len()),
        }
    }
}

fn read_u16(raw: &[u8], offset: &mut usize) -> Option<u16> {
    let bytes = raw.get(*offset..*offset + 2)?;
    *offset += 2;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(raw: &[u8], offset: &mut usize) -> Option<u32> {
    let bytes = raw.get(*offset..*offset + 4)?;
    *offset += 4;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// DR bytes per configuration chunk.
const CHUNK_BYTES: usize = 4096;
/// Clocks in IDLE covering the post-JPROGRAM memory clear.
const CLEAR_CYCLES: usize = 120_000;
/// Clocks after JSTART for the startup sequence.
const STARTUP_CYCLES: usize = 2_000;
const INIT_POLL_TRIES: usize = 100;
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Status bits in the 6-bit IR capture read through BYPASS.
const INIT_BIT: u8 = 1 << 0;
const DONE_BIT: u8 = 1 << 5;

/// Parse `raw` as a `.bit` file and run the full configuration sequence.
pub fn program_bitstream<A: Adapter>(
    tap: &mut TapEngine<A>,
    raw: &[u8],
    reporter: &mut Reporter,
    cancel: &CancelToken,
) -> Result<()> {
    let bit = BitFile::parse(raw)?;
    reporter.info(&format!("bitstream: {}", bit.describe()));
    reporter.progress(2);
    XilinxProgrammer::new(tap, reporter, cancel).program(&bit)
}

pub struct XilinxProgrammer<'a, A: Adapter> {
    tap: &'a mut TapEngine<A>,
    reporter: &'a mut Reporter,
    cancel: &'a CancelToken,
}

impl<'a, A: Adapter> XilinxProgrammer<'a, A> {
    pub fn new(
        tap: &'a mut TapEngine<A>,
        reporter: &'a mut Reporter,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            tap,
            reporter,
            cancel,
        }
    }

    /// Read the 32-bit device IDCODE.
    pub fn read_idcode(&mut self) -> Result<Option<u32>> {
        self.shift_ir(Instruction::Idcode, TapState::Idle, false)?;
        let tdo = self
            .tap
            .shift_dr(&[0u8; 4], 32, TapState::Idle, true)?;
        Ok(tdo.map(|v| u32::from_le_bytes([v[0], v[1], v[2], v[3]])))
    }

    /// Run the SRAM configuration sequence with `bit`'s payload.
    pub fn program(&mut self, bit: &BitFile) -> Result<()> {
        self.tap.reset()?;
        self.identify()?;
        self.checkpoint()?;

        self.shift_ir(Instruction::Jprogram, TapState::Idle, false)?;
        self.reporter.progress(5);
        self.checkpoint()?;

        self.wait_for_init()?;
        self.tap
            .run_test(CLEAR_CYCLES, TapState::Idle, TapState::Idle)?;
        self.reporter.progress(10);
        self.checkpoint()?;

        self.shift_ir(Instruction::CfgIn, TapState::Idle, false)?;
        self.stream_payload(&bit.data)?;
        self.reporter.progress(90);
        self.checkpoint()?;

        self.tap.move_to(TapState::Idle)?;
        self.shift_ir(Instruction::Jstart, TapState::IrUpdate, false)?;
        self.tap
            .run_test(STARTUP_CYCLES, TapState::IrUpdate, TapState::Idle)?;
        self.reporter.progress(95);
        self.checkpoint()?;

        self.tap.reset()?;
        self.check_done()?;
        self.reporter.progress(100);
        self.reporter.success("device configured, DONE is high");
        Ok(())
    }

    fn identify(&mut self) -> Result<()> {
        match self.read_idcode()? {
            Some(idcode) => match device_name(idcode) {
                Some(name) => self.reporter.info(&format!("found {name} ({idcode:#010x})")),
                None => {
                    // Unknown parts still accept the device-independent
                    // JPROGRAM flow, so this is not fatal here.
                    let err = Error::UnknownDevice { idcode };
                    self.reporter.warning(&format!("{err}, continuing"));
                }
            },
            None => self.reporter.warning("IDCODE read not supported by adapter"),
        }
        Ok(())
    }

    /// Poll INIT_B through the IR capture pattern until the configuration
    /// memory clear has started. Times out with a warning, not an error.
    fn wait_for_init(&mut self) -> Result<()> {
        for _ in 0..INIT_POLL_TRIES {
            let status = self.shift_ir(Instruction::Bypass, TapState::Idle, true)?;
            match status {
                Some(bits) if bits & INIT_BIT != 0 => return Ok(()),
                Some(_) => thread::sleep(INIT_POLL_INTERVAL),
                None => {
                    self.reporter
                        .warning("cannot poll INIT on this adapter, continuing blind");
                    return Ok(());
                }
            }
        }
        self.reporter
            .warning("INIT did not assert within the poll window, continuing");
        Ok(())
    }

    fn stream_payload(&mut self, data: &[u8]) -> Result<()> {
        let reversed = reverse_bits(data);
        let total = reversed.len();
        let mut sent = 0;
        for chunk in reversed.chunks(CHUNK_BYTES) {
            self.checkpoint()?;
            sent += chunk.len();
            // Stay in DRSHIFT between chunks; only the last one updates.
            let end = if sent == total {
                Some(TapState::DrUpdate)
            } else {
                None
            };
            self.tap
                .scan(Register::Dr, chunk, chunk.len() * 8, None, None, end, false)?;
            self.reporter
                .progress((10 + sent * 80 / total.max(1)) as u8);
        }
        Ok(())
    }

    fn check_done(&mut self) -> Result<()> {
        match self.shift_ir(Instruction::Bypass, TapState::Idle, true)? {
            Some(bits) if bits & DONE_BIT != 0 => Ok(()),
            Some(bits) => Err(Error::ProgramFailed(format!(
                "DONE stayed low after startup (status {bits:#04x})"
            ))),
            None => {
                self.reporter
                    .warning("cannot verify DONE on this adapter");
                Ok(())
            }
        }
    }

    fn shift_ir(
        &mut self,
        insn: Instruction,
        end: TapState,
        capture: bool,
    ) -> Result<Option<u8>> {
        let tdo = self.tap.shift_ir(&[insn as u8], IR_LEN, end, capture)?;
        Ok(tdo.map(|v| v[0]))
    }

    fn checkpoint(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.tap.reset()?;
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Event, MockAdapter};

    fn bit_with_header(payload: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        // Preamble: length, 9 filler bytes, then the 0x0001 field count.
        raw.extend_from_slice(&9u16.to_be_bytes());
        raw.extend_from_slice(&[0x0F, 0xF0, 0x0F, 0xF0, 0x0F, 0xF0, 0x0F, 0xF0, 0x00]);
        raw.extend_from_slice(&[0x00, 0x01]);
        for (tag, text) in [
            (b'a', "top;UserID=0XFFFFFFFF\0"),
            (b'b', "7a35tcsg324\0"),
            (b'c', "2026/08/02\0"),
            (b'd', "12:00:00\0"),
        ] {
            raw.push(tag);
            raw.extend_from_slice(&(text.len() as u16).to_be_bytes());
            raw.extend_from_slice(text.as_bytes());
        }
        raw.push(b'e');
        raw.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        raw.extend_from_slice(payload);
        raw
    }

    #[test]
    fn bit_header_fields_are_parsed() {
        let raw = bit_with_header(&[0xFF, 0xFF, 0xAA, 0x99, 0x55, 0x66]);
        let bit = BitFile::parse(&raw).unwrap();
        assert_eq!(bit.design.as_deref(), Some("top;UserID=0XFFFFFFFF"));
        assert_eq!(bit.part.as_deref(), Some("7a35tcsg324"));
        assert_eq!(bit.date.as_deref(), Some("2026/08/02"));
        assert_eq!(bit.time.as_deref(), Some("12:00:00"));
        assert_eq!(bit.data, vec![0xFF, 0xFF, 0xAA, 0x99, 0x55, 0x66]);
    }

    #[test]
    fn headerless_payload_is_accepted_whole() {
        let raw = vec![0xFF; 64];
        let bit = BitFile::parse(&raw).unwrap();
        assert_eq!(bit.design, None);
        assert_eq!(bit.data.len(), 64);
    }

    #[test]
    fn truncated_payload_falls_back_to_raw() {
        let mut raw = bit_with_header(&[0u8; 16]);
        raw.truncate(raw.len() - 8);
        let bit = BitFile::parse(&raw).unwrap();
        // The advertised 16-byte field no longer fits, so the file is
        // taken verbatim.
        assert_eq!(bit.data.len(), raw.len());
    }

    #[test]
    fn device_names_ignore_revision_bits() {
        assert_eq!(device_name(0x1362D093), Some("XC7A35T"));
        assert_eq!(device_name(0x0362D093), Some("XC7A35T"));
        assert_eq!(device_name(0xDEADBEEF), None);
    }

    fn run_program(payload_len: usize) -> (Result<()>, TapEngine<MockAdapter>) {
        let mut adapter = MockAdapter::new();
        // IDCODE read, INIT poll, final DONE check.
        adapter.tdo_queue.push_back(vec![0x93, 0xD0, 0x62, 0x13]);
        adapter.tdo_queue.push_back(vec![0x21]);
        adapter.tdo_queue.push_back(vec![0x20]);
        let mut tap = TapEngine::new(adapter);
        let mut reporter = Reporter::new();
        let cancel = CancelToken::new();
        let raw = bit_with_header(&vec![0xA5; payload_len]);
        let result = program_bitstream(&mut tap, &raw, &mut reporter, &cancel);
        (result, tap)
    }

    #[test]
    fn full_sequence_succeeds_with_init_and_done_high() {
        let (result, mut tap) = run_program(10_000);
        result.unwrap();
        assert_eq!(tap.current_state(), TapState::Idle);
        assert_eq!(tap.adapter_mut().device_state(), TapState::Idle);

        let events = tap.adapter_mut().events();
        // Memory-clear and startup clock bursts are present.
        assert!(events.iter().any(|e| *e == Event::ToggleClock(CLEAR_CYCLES)));
        assert!(events.iter().any(|e| *e == Event::ToggleClock(STARTUP_CYCLES)));

        // ceil(10000 / 4096) = 3 chunks: two open-ended, one closing. The
        // closing chunk qualifies for the write-only byte fast path.
        let open_chunks = events
            .iter()
            .filter(|e| matches!(e, Event::Shift { n_bits, .. } if *n_bits == CHUNK_BYTES * 8))
            .count();
        let closing_chunks = events
            .iter()
            .filter(|e| matches!(e, Event::ShiftBytes { n_bits } if *n_bits == (10_000 - 2 * CHUNK_BYTES) * 8))
            .count();
        assert_eq!(open_chunks, 2);
        assert_eq!(closing_chunks, 1);
    }

    #[test]
    fn done_low_is_reported_as_failure() {
        let mut adapter = MockAdapter::new();
        adapter.tdo_queue.push_back(vec![0x93, 0xD0, 0x62, 0x13]);
        adapter.tdo_queue.push_back(vec![0x21]);
        adapter.tdo_queue.push_back(vec![0x01]);
        let mut tap = TapEngine::new(adapter);
        let mut reporter = Reporter::new();
        let cancel = CancelToken::new();
        let raw = bit_with_header(&[0xA5; 128]);
        let err = program_bitstream(&mut tap, &raw, &mut reporter, &cancel).unwrap_err();
        assert!(matches!(err, Error::ProgramFailed(_)));
    }

    #[test]
    fn init_timeout_is_tolerated() {
        let mut adapter = MockAdapter::new();
        adapter.tdo_queue.push_back(vec![0x93, 0xD0, 0x62, 0x13]);
        // Every INIT poll reads 0; the final pop answers the DONE check.
        for _ in 0..INIT_POLL_TRIES {
            adapter.tdo_queue.push_back(vec![0x00]);
        }
        adapter.tdo_queue.push_back(vec![0x20]);
        let mut tap = TapEngine::new(adapter);
        let mut reporter = Reporter::new();
        let cancel = CancelToken::new();
        let raw = bit_with_header(&[0xA5; 16]);
        program_bitstream(&mut tap, &raw, &mut reporter, &cancel).unwrap();
    }

    #[test]
    fn cancellation_recovers_through_reset() {
        let mut tap = TapEngine::new(MockAdapter::new());
        let mut reporter = Reporter::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let raw = bit_with_header(&[0xA5; 16]);
        let err = program_bitstream(&mut tap, &raw, &mut reporter, &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(tap.adapter_mut().device_state(), TapState::Idle);
    }
}
