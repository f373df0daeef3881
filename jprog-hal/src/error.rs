use std::fmt;

use thiserror::Error;

/// Which way a failed USB transfer was going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    In,
    Out,
    Control,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::In => f.write_str("IN"),
            TransferDirection::Out => f.write_str("OUT"),
            TransferDirection::Control => f.write_str("control"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB subsystem unavailable: {0}")]
    UsbUnavailable(String),
    #[error("no supported probe found")]
    DeviceNotFound,
    #[error("bulk endpoints missing on interface 0")]
    EndpointsMissing,
    #[error("USB {direction} transfer failed: {detail}")]
    TransferFailed {
        direction: TransferDirection,
        detail: String,
    },
    #[error("USB transfer timed out")]
    Timeout,
    #[error("SVF parse error at line {line}: {detail}")]
    Parse { line: usize, detail: String },
    #[error("unsupported SVF command {cmd}")]
    UnsupportedCommand { cmd: String },
    #[error(
        "TDO mismatch at byte {byte_index}: got {got:#04x}, expected {expected:#04x} \
         under mask {mask:#04x}"
    )]
    TdoMismatch {
        byte_index: usize,
        got: u8,
        expected: u8,
        mask: u8,
    },
    #[error("malformed bitstream: {0}")]
    BitstreamFormat(String),
    #[error("unknown device IDCODE {idcode:#010x}")]
    UnknownDevice { idcode: u32 },
    #[error("device did not reach the programmed state: {0}")]
    ProgramFailed(String),
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
