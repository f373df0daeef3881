//! Supported probe discovery.

use std::fmt;

use nusb::DeviceInfo;

use crate::adapter::blaster::{UsbBlaster, USB_BLASTER_PID, USB_BLASTER_VID};
use crate::adapter::mpsse::MpsseAdapter;
use crate::adapter::Adapter;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    UsbBlaster,
    Ft2232h,
    Ft4232h,
    Ft232h,
}

impl ProbeKind {
    pub fn is_mpsse(self) -> bool {
        self != ProbeKind::UsbBlaster
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::UsbBlaster => f.write_str("USB-Blaster"),
            ProbeKind::Ft2232h => f.write_str("FT2232H (MPSSE)"),
            ProbeKind::Ft4232h => f.write_str("FT4232H (MPSSE)"),
            ProbeKind::Ft232h => f.write_str("FT232H (MPSSE)"),
        }
    }
}

/// VID/PID pairs this crate knows how to drive.
const SUPPORTED_PROBES: &[((u16, u16), ProbeKind)] = &[
    ((USB_BLASTER_VID, USB_BLASTER_PID), ProbeKind::UsbBlaster),
    ((0x0403, 0x6010), ProbeKind::Ft2232h),
    ((0x0403, 0x6011), ProbeKind::Ft4232h),
    ((0x0403, 0x6014), ProbeKind::Ft232h),
];

pub struct ProbeInfo {
    pub kind: ProbeKind,
    pub info: DeviceInfo,
}

impl ProbeInfo {
    /// Open the matching adapter and run its init sequence.
    pub fn open(&self) -> Result<Box<dyn Adapter>> {
        log::info!("opening {} probe", self.kind);
        if self.kind.is_mpsse() {
            Ok(Box::new(MpsseAdapter::open(&self.info)?))
        } else {
            Ok(Box::new(UsbBlaster::open(&self.info)?))
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "{:04x}:{:04x} {} {}",
            self.info.vendor_id(),
            self.info.product_id(),
            self.kind,
            self.info.serial_number().unwrap_or("")
        )
    }
}

/// Enumerate every connected probe with a supported VID/PID.
pub fn list_probes() -> Result<Vec<ProbeInfo>> {
    let devices = nusb::list_devices().map_err(|e| Error::UsbUnavailable(e.to_string()))?;
    Ok(devices
        .filter_map(|info| {
            let id = (info.vendor_id(), info.product_id());
            SUPPORTED_PROBES
                .iter()
                .find(|(supported, _)| *supported == id)
                .map(|(_, kind)| ProbeInfo { kind: *kind, info })
        })
        .collect())
}

/// Open probe number `index` from the enumeration order.
pub fn open_probe(index: usize) -> Result<Box<dyn Adapter>> {
    let probes = list_probes()?;
    probes.get(index).ok_or(Error::DeviceNotFound)?.open()
}
