//! Error types for the Helios DAC library
//!
//! This module defines the error types used throughout the library
//! for handling USB communication, validation and protocol errors.

use thiserror::Error;

/// Result type alias for Helios operations
pub type Result<T> = std::result::Result<T, HeliosError>;

/// Error types for Helios operations
#[derive(Error, Debug)]
pub enum HeliosError {
    /// USB error from the rusb library
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Failed to claim interface
    #[error("Failed to claim USB interface: {0}")]
    ClaimInterface(rusb::Error),

    /// Failed to detach kernel driver
    #[error("Failed to detach kernel driver: {0}")]
    DetachKernelDriver(rusb::Error),

    /// Failed to select the alternate setting carrying the bulk endpoints
    #[error("Failed to set alternate setting: {0}")]
    SetAlternateSetting(rusb::Error),

    /// Frame contains no points
    #[error("Frame contains no points")]
    EmptyFrame,

    /// Frame contains more points than the device buffer holds
    #[error("Frame has {count} points (maximum {max})")]
    TooManyPoints { count: usize, max: usize },

    /// Playback rate outside the supported range
    #[error("Rate {rate} pps out of range ({min}..={max})")]
    RateOutOfRange { rate: u32, min: u32, max: u32 },

    /// Name does not fit the device name field
    #[error("Name is {len} bytes (maximum {max})")]
    NameTooLong { len: usize, max: usize },

    /// Encoded frame bytes could not be decoded
    #[error("Invalid frame data: {0}")]
    InvalidFrameData(&'static str),

    /// Bulk transfer of a frame failed
    #[error("Frame transfer failed: {0}")]
    FrameTransfer(rusb::Error),

    /// Interrupt transfer of a command failed
    #[error("Command transfer failed: {0}")]
    CommandTransfer(rusb::Error),

    /// The device did not answer a request within the reply timeout
    #[error("No reply to command 0x{opcode:02x}")]
    NoReply { opcode: u8 },

    /// The device answered with a malformed reply
    #[error("Invalid reply to command 0x{opcode:02x}")]
    InvalidReply { opcode: u8 },

    /// A non-blocking frame transfer is still running
    #[error("A frame transfer is already in flight")]
    FrameInFlight,

    /// Session is closed or was invalidated by a firmware erase
    #[error("Device is closed")]
    DeviceClosed,

    /// A session thread could not be started
    #[error("Failed to start worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// No open device at this index
    #[error("Invalid device index: {index} ({count} devices open)")]
    InvalidDeviceIndex { index: usize, count: usize },
}

impl HeliosError {
    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            HeliosError::NoReply { .. }
                | HeliosError::Usb(rusb::Error::Timeout)
                | HeliosError::FrameTransfer(rusb::Error::Timeout)
                | HeliosError::CommandTransfer(rusb::Error::Timeout)
        )
    }

    /// Check if this error is a USB error
    pub fn is_usb_error(&self) -> bool {
        matches!(
            self,
            HeliosError::Usb(_)
                | HeliosError::ClaimInterface(_)
                | HeliosError::DetachKernelDriver(_)
                | HeliosError::SetAlternateSetting(_)
                | HeliosError::FrameTransfer(_)
                | HeliosError::CommandTransfer(_)
        )
    }

    /// Check if this error was raised by argument validation, before any transfer
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            HeliosError::EmptyFrame
                | HeliosError::TooManyPoints { .. }
                | HeliosError::RateOutOfRange { .. }
                | HeliosError::NameTooLong { .. }
        )
    }
}
