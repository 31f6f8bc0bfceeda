//! Helios protocol structures
//!
//! This module contains the command packets sent on the interrupt OUT
//! endpoint, the replies read back from the interrupt IN endpoint, and the
//! value types they carry.

use crate::constants::{
    CMD_ERASE_FIRMWARE, CMD_GET_FIRMWARE_VERSION, CMD_GET_NAME, CMD_GET_STATUS, CMD_SDK_VERSION,
    CMD_SET_NAME, CMD_SET_SHUTTER, CMD_STOP, NAME_MAX_LEN, REPLY_FLAG, SET_NAME_MAX_LEN,
    SET_NAME_PACKET_SIZE,
};
use crate::error::{HeliosError, Result};

/// Device buffer status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Device is ready to receive a frame
    Ready,
    /// Device buffer is full; poll again
    NotReady,
}

impl DeviceStatus {
    /// Check if the device can accept a frame
    pub fn is_ready(&self) -> bool {
        matches!(self, DeviceStatus::Ready)
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Ready => write!(f, "ready"),
            DeviceStatus::NotReady => write!(f, "not ready"),
        }
    }
}

/// Device name, as stored in the device's name field
///
/// Holds at most 31 bytes; the terminator is added on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceName {
    bytes: Vec<u8>,
}

impl DeviceName {
    /// Create a name that can be written with `set_name`
    ///
    /// Names longer than 30 bytes (31 with the terminator) are rejected.
    pub fn new(name: impl AsRef<[u8]>) -> Result<Self> {
        let bytes = name.as_ref();
        if bytes.len() > SET_NAME_MAX_LEN {
            return Err(HeliosError::NameTooLong {
                len: bytes.len(),
                max: SET_NAME_MAX_LEN,
            });
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Read a NUL-terminated name field, keeping at most 31 bytes
    fn from_field(field: &[u8]) -> Self {
        let field = &field[..field.len().min(NAME_MAX_LEN)];
        let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        Self {
            bytes: field[..len].to_vec(),
        }
    }

    /// Name bytes, without terminator
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in bytes, without terminator
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the name is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Display for DeviceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

/// Command sent on the interrupt OUT endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Stop,
    SetShutter(bool),
    GetStatus,
    GetFirmwareVersion,
    GetName,
    SetName(DeviceName),
    SdkVersion(u8),
    EraseFirmware,
}

impl Command {
    /// Command opcode
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Stop => CMD_STOP,
            Command::SetShutter(_) => CMD_SET_SHUTTER,
            Command::GetStatus => CMD_GET_STATUS,
            Command::GetFirmwareVersion => CMD_GET_FIRMWARE_VERSION,
            Command::GetName => CMD_GET_NAME,
            Command::SetName(_) => CMD_SET_NAME,
            Command::SdkVersion(_) => CMD_SDK_VERSION,
            Command::EraseFirmware => CMD_ERASE_FIRMWARE,
        }
    }

    /// Opcode of the reply this command produces, if any
    pub fn reply_opcode(&self) -> Option<u8> {
        match self {
            Command::GetStatus | Command::GetFirmwareVersion | Command::GetName => {
                Some(self.opcode() | REPLY_FLAG)
            }
            _ => None,
        }
    }

    /// Pack into bytes for USB transfer
    pub fn pack(&self) -> Vec<u8> {
        match self {
            Command::SetShutter(level) => vec![self.opcode(), *level as u8],
            Command::SdkVersion(version) => vec![self.opcode(), *version],
            Command::SetName(name) => {
                let mut buf = vec![0u8; SET_NAME_PACKET_SIZE];
                buf[0] = self.opcode();
                buf[1..1 + name.len()].copy_from_slice(name.as_bytes());
                buf
            }
            _ => vec![self.opcode(), 0],
        }
    }
}

/// Reply read from the interrupt IN endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(DeviceStatus),
    FirmwareVersion(u32),
    Name(DeviceName),
    /// Reply with an opcode this library does not interpret
    Other(u8),
}

impl Reply {
    /// Unpack from bytes received via USB
    ///
    /// Returns `None` for a packet too short to carry its payload.
    pub fn unpack(data: &[u8]) -> Option<Self> {
        let (&opcode, payload) = data.split_first()?;
        let reply = match opcode {
            op if op == CMD_GET_STATUS | REPLY_FLAG => {
                let ready = *payload.first()? != 0;
                Reply::Status(if ready {
                    DeviceStatus::Ready
                } else {
                    DeviceStatus::NotReady
                })
            }
            op if op == CMD_GET_FIRMWARE_VERSION | REPLY_FLAG => {
                let bytes = payload.get(..4)?;
                Reply::FirmwareVersion(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            op if op == CMD_GET_NAME | REPLY_FLAG => Reply::Name(DeviceName::from_field(payload)),
            op => Reply::Other(op),
        };
        Some(reply)
    }

    /// Opcode byte of this reply
    pub fn opcode(&self) -> u8 {
        match self {
            Reply::Status(_) => CMD_GET_STATUS | REPLY_FLAG,
            Reply::FirmwareVersion(_) => CMD_GET_FIRMWARE_VERSION | REPLY_FLAG,
            Reply::Name(_) => CMD_GET_NAME | REPLY_FLAG,
            Reply::Other(op) => *op,
        }
    }
}
