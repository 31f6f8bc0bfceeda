//! Device discovery and the multi-device manager
//!
//! `UsbContext` owns the process-wide libusb context. `HeliosDac` scans a
//! `Discover` source, opens a session per device and routes calls by index.

use rusb::UsbContext as _;

use crate::config::DeviceConfig;
use crate::constants::{HELIOS_PID, HELIOS_VID};
use crate::device::HeliosDevice;
use crate::error::{HeliosError, Result};
use crate::frame::Frame;
use crate::structures::{DeviceName, DeviceStatus};
use crate::transport::{Transport, UsbTransport};

/// Source of opened device transports
pub trait Discover {
    type Transport: Transport;

    /// Find and open every matching device
    ///
    /// The outer error is a failed scan. Each inner entry is one matching
    /// device, opened or not.
    fn discover(&self) -> Result<Vec<Result<Self::Transport>>>;
}

/// Check if a USB device is a Helios DAC
pub fn is_helios_device(vendor_id: u16, product_id: u16) -> bool {
    vendor_id == HELIOS_VID && product_id == HELIOS_PID
}

/// Process-wide USB context
///
/// Created once per manager and torn down when the manager is dropped.
pub struct UsbContext {
    context: rusb::Context,
}

impl UsbContext {
    /// Initialize libusb
    pub fn new() -> Result<Self> {
        Ok(Self {
            context: rusb::Context::new()?,
        })
    }
}

impl Discover for UsbContext {
    type Transport = UsbTransport;

    fn discover(&self) -> Result<Vec<Result<UsbTransport>>> {
        let mut found = Vec::new();

        for device in self.context.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };

            if is_helios_device(desc.vendor_id(), desc.product_id()) {
                found.push(UsbTransport::open(&device));
            }
        }

        Ok(found)
    }
}

/// Helios DAC manager
///
/// # Example
///
/// ```no_run
/// use helios_dac::{DeviceStatus, Frame, FrameFlags, HeliosDac, Point};
///
/// let mut dac = HeliosDac::new()?;
/// let count = dac.open_devices()?;
/// println!("Found {} DAC(s)", count);
///
/// let points: Vec<Point> = (0..1000)
///     .map(|n| Point::new((n * 4) as u16, 2048, 255, 255, 255, 255))
///     .collect();
/// let frame = Frame::new(30000, points).with_flags(FrameFlags::SINGLE_SHOT);
///
/// for index in 0..count {
///     if dac.get_status(index)? == DeviceStatus::Ready {
///         dac.write_frame(index, &frame)?;
///     }
/// }
///
/// dac.close_devices();
/// # Ok::<(), helios_dac::HeliosError>(())
/// ```
pub struct HeliosDac<D: Discover = UsbContext> {
    source: D,
    config: DeviceConfig,
    devices: Vec<HeliosDevice<D::Transport>>,
    initialized: bool,
}

impl HeliosDac<UsbContext> {
    /// Create a manager on a fresh USB context
    pub fn new() -> Result<Self> {
        Ok(Self::with_source(UsbContext::new()?))
    }
}

impl<D: Discover> HeliosDac<D> {
    /// Create a manager over a device source
    pub fn with_source(source: D) -> Self {
        Self {
            source,
            config: DeviceConfig::default(),
            devices: Vec::new(),
            initialized: false,
        }
    }

    /// Use `config` for sessions opened from now on
    pub fn with_config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// Open every connected DAC, returning how many opened
    ///
    /// A device that fails to open is skipped. To re-scan, call
    /// `close_devices` first; calling this again without closing appends
    /// duplicate sessions for devices that can be opened twice.
    pub fn open_devices(&mut self) -> Result<usize> {
        let found = self.source.discover()?;

        for (position, transport) in found.into_iter().enumerate() {
            let session = transport.and_then(|t| HeliosDevice::open(t, self.config));
            match session {
                Ok(device) => self.devices.push(device),
                Err(e) => log::warn!("skipping Helios device #{}: {}", position, e),
            }
        }

        self.initialized = true;
        log::info!("{} Helios DAC(s) open", self.devices.len());
        Ok(self.devices.len())
    }

    /// Close and release every device
    ///
    /// Does nothing if no devices are open.
    pub fn close_devices(&mut self) {
        for mut device in self.devices.drain(..) {
            device.close();
        }
        self.initialized = false;
    }

    /// Number of open devices
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Check if `open_devices` has run since the last close
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Session at `index`
    pub fn device(&self, index: usize) -> Result<&HeliosDevice<D::Transport>> {
        self.devices
            .get(index)
            .ok_or(HeliosError::InvalidDeviceIndex {
                index,
                count: self.devices.len(),
            })
    }

    /// Write a frame to the device at `index`
    pub fn write_frame(&self, index: usize, frame: &Frame) -> Result<()> {
        self.device(index)?.write_frame(frame)
    }

    /// Get the buffer status of the device at `index`
    pub fn get_status(&self, index: usize) -> Result<DeviceStatus> {
        self.device(index)?.get_status()
    }

    /// Get the cached firmware version of the device at `index`
    pub fn get_firmware_version(&self, index: usize) -> Result<u32> {
        self.device(index)?.get_firmware_version()
    }

    /// Read the name of the device at `index`
    pub fn get_name(&self, index: usize) -> Result<DeviceName> {
        self.device(index)?.get_name()
    }

    /// Store a name on the device at `index`
    pub fn set_name(&self, index: usize, name: impl AsRef<[u8]>) -> Result<()> {
        self.device(index)?.set_name(name)
    }

    /// Stop output of the device at `index` (blocks for the settle delay)
    pub fn stop(&self, index: usize) -> Result<()> {
        self.device(index)?.stop()
    }

    /// Set the shutter level of the device at `index`
    pub fn set_shutter(&self, index: usize, level: bool) -> Result<()> {
        self.device(index)?.set_shutter(level)
    }

    /// Erase the firmware of the device at `index`
    pub fn erase_firmware(&self, index: usize) -> Result<()> {
        self.device(index)?.erase_firmware()
    }
}

impl<D: Discover> Drop for HeliosDac<D> {
    fn drop(&mut self) {
        self.close_devices();
    }
}
