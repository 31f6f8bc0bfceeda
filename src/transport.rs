//! USB transport for a single opened Helios device
//!
//! The `Transport` trait is the seam between the protocol engine and the USB
//! stack. `UsbTransport` implements it over a claimed rusb device handle.

use std::time::Duration;

use rusb::{Context, Device, DeviceHandle};

use crate::constants::{HELIOS_ALT_SETTING, HELIOS_INTERFACE};
use crate::error::{HeliosError, Result};

/// Raw transfers against one opened device
///
/// Implementations must be usable from the session's foreground callers and
/// its status worker at the same time.
pub trait Transport: Send + Sync + 'static {
    /// Write `data` to a bulk OUT endpoint, returning the bytes written
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    /// Write `data` to an interrupt OUT endpoint, returning the bytes written
    fn write_interrupt(&self, endpoint: u8, data: &[u8], timeout: Duration)
        -> rusb::Result<usize>;

    /// Read from an interrupt IN endpoint into `buf`, returning the bytes read
    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration)
        -> rusb::Result<usize>;
}

/// rusb-backed transport owning the device handle
pub struct UsbTransport {
    handle: DeviceHandle<Context>,
    bus: u8,
    address: u8,
}

impl UsbTransport {
    /// Open `device`, claim its interface and select the streaming alternate setting
    pub fn open(device: &Device<Context>) -> Result<Self> {
        let handle = device.open()?;

        // Detach kernel driver on Linux/Unix
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if handle.kernel_driver_active(HELIOS_INTERFACE).unwrap_or(false) {
                handle
                    .detach_kernel_driver(HELIOS_INTERFACE)
                    .map_err(HeliosError::DetachKernelDriver)?;
            }
        }

        handle
            .claim_interface(HELIOS_INTERFACE)
            .map_err(HeliosError::ClaimInterface)?;
        handle
            .set_alternate_setting(HELIOS_INTERFACE, HELIOS_ALT_SETTING)
            .map_err(HeliosError::SetAlternateSetting)?;

        Ok(Self {
            handle,
            bus: device.bus_number(),
            address: device.address(),
        })
    }
}

impl Transport for UsbTransport {
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, data, timeout)
    }

    fn write_interrupt(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle.write_interrupt(endpoint, data, timeout)
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle.read_interrupt(endpoint, buf, timeout)
    }
}

impl std::fmt::Debug for UsbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbTransport")
            .field("bus", &self.bus)
            .field("address", &self.address)
            .finish()
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(HELIOS_INTERFACE);
        log::debug!(
            "released Helios handle (bus {}, addr {})",
            self.bus,
            self.address
        );
    }
}
