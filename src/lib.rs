//! Helios Laser DAC Driver for Rust
//!
//! This crate provides a host-side driver for Helios USB laser DACs. Frames of
//! XY points with color and intensity are uploaded over USB bulk transfers and
//! played back by the device at a chosen rate.
//!
//! # Features
//!
//! - Double-buffered frame output with buffer status polling
//! - Blocking and non-blocking frame writes
//! - Background status channel on the interrupt endpoint
//! - Device name, firmware version, shutter, stop and firmware erase commands
//! - Multiple devices through one manager
//!
//! The DAC is double-buffered. While one frame plays, a second frame can be
//! uploaded; it starts when the first finishes. Without a new frame the
//! device loops the last one, unless it was written with
//! `FrameFlags::SINGLE_SHOT`. `get_status` reports whether the buffer can take
//! another frame; it will not always report `Ready` on the first poll.
//!
//! # Example
//!
//! ```no_run
//! use helios_dac::{DeviceStatus, Frame, HeliosDac, Point};
//!
//! fn main() -> helios_dac::Result<()> {
//!     let mut dac = HeliosDac::new()?;
//!     if dac.open_devices()? == 0 {
//!         println!("No Helios DAC found");
//!         return Ok(());
//!     }
//!
//!     // A horizontal line sweeping upward
//!     for frame_index in 0..100u16 {
//!         let y = frame_index * 40;
//!         let points: Vec<Point> = (0..1000u16)
//!             .map(|n| Point::new(n * 4, y, 255, 0, 0, 255))
//!             .collect();
//!         let frame = Frame::new(30000, points);
//!
//!         while dac.get_status(0)? != DeviceStatus::Ready {}
//!         dac.write_frame(0, &frame)?;
//!     }
//!
//!     dac.stop(0)?;
//!     dac.close_devices();
//!     Ok(())
//! }
//! ```
//!
//! # Supported Devices
//!
//! - Helios Laser DAC (VID: 0x1209, PID: 0xE500)

pub mod completion;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod frame;
pub mod manager;
pub mod structures;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use constants::{
    // Frame flags
    HELIOS_FLAGS_DEFAULT,
    HELIOS_FLAGS_DONT_BLOCK,
    HELIOS_FLAGS_SINGLE_MODE,
    HELIOS_FLAGS_START_IMMEDIATELY,
    // Limits
    HELIOS_MAX_POINTS,
    HELIOS_MAX_RATE,
    HELIOS_MIN_RATE,
    // USB identity
    HELIOS_PID,
    HELIOS_SDK_VERSION,
    HELIOS_VID,
};

pub use config::DeviceConfig;
pub use device::HeliosDevice;
pub use error::{HeliosError, Result};
pub use frame::{Frame, FrameFlags, Point};
pub use manager::{is_helios_device, Discover, HeliosDac, UsbContext};
pub use structures::{DeviceName, DeviceStatus};
pub use transport::{Transport, UsbTransport};
pub use worker::StatusChannelStats;
