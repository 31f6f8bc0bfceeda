//! Helios protocol constants
//!
//! This module contains all the constants used by the Helios DAC protocol,
//! including the USB identity, endpoints, command opcodes, limits and frame flags.

use std::time::Duration;

// ============================================================================
// USB Vendor/Product IDs
// ============================================================================

/// Helios vendor ID
pub const HELIOS_VID: u16 = 0x1209;
/// Helios product ID
pub const HELIOS_PID: u16 = 0xE500;

// ============================================================================
// USB Interface and Endpoints
// ============================================================================

/// Interface carrying all four endpoints
pub const HELIOS_INTERFACE: u8 = 0;
/// Alternate setting that enables the bulk endpoints
pub const HELIOS_ALT_SETTING: u8 = 1;

/// Bulk OUT endpoint (frame upload)
pub const EP_BULK_OUT: u8 = 0x02;
/// Bulk IN endpoint (reserved, unused by the host)
pub const EP_BULK_IN: u8 = 0x81;
/// Interrupt OUT endpoint (commands)
pub const EP_INT_OUT: u8 = 0x06;
/// Interrupt IN endpoint (status replies)
pub const EP_INT_IN: u8 = 0x83;

// ============================================================================
// Command Opcodes (first byte of an interrupt OUT packet)
// ============================================================================

/// Stop output until a new frame is written
pub const CMD_STOP: u8 = 0x01;
/// Set shutter level
pub const CMD_SET_SHUTTER: u8 = 0x02;
/// Query whether the frame buffer can accept a new frame
pub const CMD_GET_STATUS: u8 = 0x03;
/// Query firmware version
pub const CMD_GET_FIRMWARE_VERSION: u8 = 0x04;
/// Query device name
pub const CMD_GET_NAME: u8 = 0x05;
/// Store device name
pub const CMD_SET_NAME: u8 = 0x06;
/// Announce the host SDK version
pub const CMD_SDK_VERSION: u8 = 0x07;
/// Erase firmware and reboot into the bootloader
pub const CMD_ERASE_FIRMWARE: u8 = 0xDE;

/// Replies echo the request opcode with this bit set
pub const REPLY_FLAG: u8 = 0x80;

/// Size of an interrupt IN reply packet
pub const REPLY_SIZE: usize = 32;
/// Size of a set-name command packet
pub const SET_NAME_PACKET_SIZE: usize = 32;

/// Host SDK version announced to the device at open
pub const HELIOS_SDK_VERSION: u8 = 6;

// ============================================================================
// Limits
// ============================================================================

/// Maximum points per frame
pub const HELIOS_MAX_POINTS: usize = 0x1000;
/// Maximum playback rate in points per second
pub const HELIOS_MAX_RATE: u32 = 0xFFFF;
/// Minimum playback rate in points per second
pub const HELIOS_MIN_RATE: u32 = 7;

/// Largest coordinate value (12 bits)
pub const HELIOS_MAX_COORDINATE: u16 = 0x0FFF;

/// Longest name the device reports (without terminator)
pub const NAME_MAX_LEN: usize = 31;
/// Longest name accepted by `set_name` (without terminator)
pub const SET_NAME_MAX_LEN: usize = 30;

// ============================================================================
// Frame Encoding
// ============================================================================

/// Encoded size of one point
pub const POINT_SIZE: usize = 7;
/// Encoded size of the rate/count/flags trailer
pub const FRAME_TRAILER_SIZE: usize = 5;
/// Frames whose encoded length is a multiple of this are mis-transferred by firmware
pub const USB_PACKET_SIZE: usize = 64;

// ============================================================================
// Frame Flags (last byte of the frame trailer)
// ============================================================================

/// Default behavior: wait for the current frame, loop, block on write
pub const HELIOS_FLAGS_DEFAULT: u8 = 0;
/// Start output immediately instead of waiting for the current frame to finish
pub const HELIOS_FLAGS_START_IMMEDIATELY: u8 = 1 << 0;
/// Play the frame once instead of repeating it
pub const HELIOS_FLAGS_SINGLE_MODE: u8 = 1 << 1;
/// Do not block the caller while the frame transfer runs
pub const HELIOS_FLAGS_DONT_BLOCK: u8 = 1 << 2;

// ============================================================================
// Default Timing
// ============================================================================

/// Timeout of a single interrupt OUT command transfer
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(16);
/// How long a request waits for its reply to arrive on the status channel
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(32);
/// Timeout of each posted interrupt IN status transfer
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(16);
/// Pause before re-posting a status transfer that failed
pub const DEFAULT_STATUS_ERROR_BACKOFF: Duration = Duration::from_millis(10);
/// Delay after a stop command before the device has halted output
pub const DEFAULT_STOP_SETTLE: Duration = Duration::from_millis(100);
/// Timeout used while draining stale replies at open
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(5);
/// Upper bound on stale replies drained at open
pub const DRAIN_MAX_PACKETS: usize = 16;

/// Bulk transfer timeout for a frame of `len` bytes
pub fn frame_transfer_timeout(len: usize) -> Duration {
    Duration::from_millis(8 + (len as u64 >> 5))
}
