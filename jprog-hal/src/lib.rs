//! JTAG programming stack for FTDI-based cables.
//!
//! Drives FPGA configuration over JTAG from the host side of a USB dongle,
//! either an Altera USB-Blaster (FT245 bit-bang protocol) or an MPSSE
//! cable built on the FT2232H / FT4232H / FT232H. The layers, bottom up:
//!
//! - [`usb`]: raw USB transport and the FTDI vendor requests.
//! - [`mpsse`] and [`adapter`]: the wire protocols. [`adapter::Adapter`]
//!   is the common contract; [`adapter::blaster`] and [`adapter::mpsse`]
//!   encode it for their hardware.
//! - [`tap`]: the 16-state TAP engine with minimum-TMS-path moves.
//! - [`svf`]: SVF parsing and playback on top of the TAP engine.
//! - [`xilinx`]: `.bit` parsing and the 7-series SRAM load sequence.
//!
//! Long operations report through [`Reporter`] callbacks and poll a
//! [`CancelToken`] between commands.
//!
//! # Example
//!
//! ```no_run
//! use jprog_hal::{list_probes, CancelToken, Reporter, TapEngine};
//!
//! # fn main() -> jprog_hal::Result<()> {
//! let probe = list_probes()?.into_iter().next().expect("no probe attached");
//! let mut tap = TapEngine::new(probe.open()?);
//!
//! let mut reporter = Reporter::new().on_log(|level, msg| println!("{level:?}: {msg}"));
//! let cancel = CancelToken::new();
//! let source = std::fs::read_to_string("fpga.svf").expect("readable SVF");
//! jprog_hal::svf::play(&mut tap, &source, &mut reporter, &cancel)?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod adapter;
pub mod bits;
pub mod error;
pub mod list;
pub mod mpsse;
pub mod report;
pub mod svf;
pub mod tap;
pub mod usb;
pub mod xilinx;

#[cfg(test)]
pub(crate) mod testutil;

pub use adapter::{Adapter, TrstMode};
pub use error::{Error, Result};
pub use list::{list_probes, open_probe, ProbeInfo, ProbeKind};
pub use report::{CancelToken, LogLevel, Reporter};
pub use tap::{TapEngine, TapState};
