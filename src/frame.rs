//! Helios frame implementation
//!
//! This module provides the `Point`, `FrameFlags` and `Frame` types, and the
//! encoder that turns a frame into the byte layout expected on the bulk OUT
//! endpoint.

use std::ops::{BitOr, BitOrAssign};

use crate::constants::{
    FRAME_TRAILER_SIZE, HELIOS_FLAGS_DONT_BLOCK, HELIOS_FLAGS_SINGLE_MODE,
    HELIOS_FLAGS_START_IMMEDIATELY, HELIOS_MAX_COORDINATE, HELIOS_MAX_POINTS, HELIOS_MAX_RATE,
    HELIOS_MIN_RATE, POINT_SIZE, USB_PACKET_SIZE,
};
use crate::error::{HeliosError, Result};

/// A single laser point
///
/// Coordinates are 12-bit values (0..=4095) stored in 16-bit fields; the
/// upper four bits are ignored when encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point {
    pub x: u16,
    pub y: u16,
    pub r: u8,
    pub g: u8,
    pub b: u8,
    /// Intensity
    pub i: u8,
}

impl Point {
    /// Create a new point, clipping coordinates to 12 bits
    pub fn new(x: u16, y: u16, r: u8, g: u8, b: u8, i: u8) -> Self {
        Self {
            x: x & HELIOS_MAX_COORDINATE,
            y: y & HELIOS_MAX_COORDINATE,
            r,
            g,
            b,
            i,
        }
    }

    /// Create a point with the beam off
    pub fn blanked(x: u16, y: u16) -> Self {
        Self::new(x, y, 0, 0, 0, 0)
    }

    fn pack_into(&self, buf: &mut Vec<u8>) {
        let x = self.x & HELIOS_MAX_COORDINATE;
        let y = self.y & HELIOS_MAX_COORDINATE;
        buf.push((x >> 4) as u8);
        buf.push((((x & 0x0F) << 4) | (y >> 8)) as u8);
        buf.push((y & 0xFF) as u8);
        buf.push(self.r);
        buf.push(self.g);
        buf.push(self.b);
        buf.push(self.i);
    }

    fn unpack(data: &[u8]) -> Self {
        let x = ((data[0] as u16) << 4) | ((data[1] as u16) >> 4);
        let y = (((data[1] as u16) & 0x0F) << 8) | data[2] as u16;
        Self {
            x,
            y,
            r: data[3],
            g: data[4],
            b: data[5],
            i: data[6],
        }
    }
}

/// Frame flag bitset
///
/// The whole byte is sent to the device; `NON_BLOCKING` only changes host
/// behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Wait for the current frame, loop this one, block on write
    pub const DEFAULT: FrameFlags = FrameFlags(0);
    /// Start output immediately instead of waiting for the current frame
    pub const START_IMMEDIATELY: FrameFlags = FrameFlags(HELIOS_FLAGS_START_IMMEDIATELY);
    /// Play the frame once, then stop
    pub const SINGLE_SHOT: FrameFlags = FrameFlags(HELIOS_FLAGS_SINGLE_MODE);
    /// Return as soon as the transfer is submitted
    pub const NON_BLOCKING: FrameFlags = FrameFlags(HELIOS_FLAGS_DONT_BLOCK);

    /// Create flags from a raw byte
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flag byte
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Check if all flags in `other` are set
    pub fn contains(&self, other: FrameFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for FrameFlags {
    fn bitor_assign(&mut self, rhs: FrameFlags) {
        self.0 |= rhs.0;
    }
}

/// A frame request: points in playback order, a rate and flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Points in playback order
    pub points: Vec<Point>,
    /// Playback rate in points per second
    pub rate: u32,
    /// Frame flags
    pub flags: FrameFlags,
}

impl Frame {
    /// Create a new frame with default flags
    pub fn new(rate: u32, points: Vec<Point>) -> Self {
        Self {
            points,
            rate,
            flags: FrameFlags::DEFAULT,
        }
    }

    /// Replace the frame flags
    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Check point count and rate against the device limits
    pub fn validate(&self) -> Result<()> {
        if self.points.is_empty() {
            return Err(HeliosError::EmptyFrame);
        }
        if self.points.len() > HELIOS_MAX_POINTS {
            return Err(HeliosError::TooManyPoints {
                count: self.points.len(),
                max: HELIOS_MAX_POINTS,
            });
        }
        if !(HELIOS_MIN_RATE..=HELIOS_MAX_RATE).contains(&self.rate) {
            return Err(HeliosError::RateOutOfRange {
                rate: self.rate,
                min: HELIOS_MIN_RATE,
                max: HELIOS_MAX_RATE,
            });
        }
        Ok(())
    }

    /// Encoded size of a frame with `points` points
    pub fn encoded_len(points: usize) -> usize {
        points * POINT_SIZE + FRAME_TRAILER_SIZE
    }

    /// Encode the frame exactly as given
    ///
    /// Layout: one 7-byte record per point, then `[rate lo, rate hi,
    /// count lo, count hi, flags]`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(pack(&self.points, self.rate, self.flags))
    }

    /// Encode the frame for the bulk endpoint
    ///
    /// Firmware drops transfers whose length is a multiple of the USB packet
    /// size. Such frames lose their last point and have their rate scaled so
    /// the playback duration stays the same.
    pub fn encode_for_transfer(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let count = self.points.len();
        if count > 1 && Self::encoded_len(count) % USB_PACKET_SIZE == 0 {
            let shortened = count - 1;
            let rate = ((self.rate as u64 * shortened as u64 + count as u64 / 2) / count as u64)
                .max(HELIOS_MIN_RATE as u64) as u32;
            log::debug!(
                "frame of {} bytes hits packet boundary, sending {} points at {} pps",
                Self::encoded_len(count),
                shortened,
                rate
            );
            return Ok(pack(&self.points[..shortened], rate, self.flags));
        }
        Ok(pack(&self.points, self.rate, self.flags))
    }

    /// Decode a frame from its wire layout
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_TRAILER_SIZE {
            return Err(HeliosError::InvalidFrameData("shorter than trailer"));
        }
        let body_len = data.len() - FRAME_TRAILER_SIZE;
        if body_len % POINT_SIZE != 0 {
            return Err(HeliosError::InvalidFrameData("truncated point record"));
        }

        let trailer = &data[body_len..];
        let rate = u16::from_le_bytes([trailer[0], trailer[1]]) as u32;
        let count = u16::from_le_bytes([trailer[2], trailer[3]]) as usize;
        let flags = FrameFlags::from_bits(trailer[4]);

        if count != body_len / POINT_SIZE {
            return Err(HeliosError::InvalidFrameData("point count mismatch"));
        }

        let points = data[..body_len]
            .chunks_exact(POINT_SIZE)
            .map(Point::unpack)
            .collect();

        Ok(Self {
            points,
            rate,
            flags,
        })
    }
}

fn pack(points: &[Point], rate: u32, flags: FrameFlags) -> Vec<u8> {
    let mut buf = Vec::with_capacity(Frame::encoded_len(points.len()));
    for point in points {
        point.pack_into(&mut buf);
    }
    buf.extend_from_slice(&(rate as u16).to_le_bytes());
    buf.extend_from_slice(&(points.len() as u16).to_le_bytes());
    buf.push(flags.bits());
    buf
}
