// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![cfg_attr(all(not(test), not(feature = "std")), no_std)]

//! Wire types for the PLDM messages the BMC sends to the host when a dump
//! is ready to be offloaded.

pub mod file_io;

use core::fmt;
use serde::Deserialize;
use serde::Serialize;
use static_assertions::const_assert;

pub use hubpack::error::Error as HubpackError;
pub use hubpack::{deserialize, serialize, SerializedSize};

pub use file_io::*;

/// Maximum size in bytes for a serialized message.
pub const MAX_SERIALIZED_SIZE: usize = 64;

/// MCTP message type carrying PLDM.
pub const MCTP_MSG_TYPE_PLDM: u8 = 0x01;

const REQUEST_BIT: u8 = 1 << 7;
const DATAGRAM_BIT: u8 = 1 << 6;
const INSTANCE_ID_MASK: u8 = 0x1f;
const HEADER_VERSION_SHIFT: u8 = 6;
const PLDM_TYPE_MASK: u8 = 0x3f;

/// The only header version defined by DSP0240.
pub const HEADER_VERSION: u8 = 0;

/// Correlates a request with its response; scoped to one terminus.
///
/// Instance ids occupy the low five bits of the first header byte, so only
/// `0..=31` are representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u8);

impl InstanceId {
    pub const MAX: u8 = INSTANCE_ID_MASK;

    /// Number of distinct instance ids available per terminus.
    pub const COUNT: usize = Self::MAX as usize + 1;

    pub const fn get(self) -> u8 {
        self.0
    }
}

/// Error returned from `TryFrom<u8> for InstanceId` if the value does not
/// fit the header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceIdOutOfRange(pub u8);

impl fmt::Display for InstanceIdOutOfRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instance id {} out of range (max {})",
            self.0,
            InstanceId::MAX
        )
    }
}

impl TryFrom<u8> for InstanceId {
    type Error = InstanceIdOutOfRange;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value > Self::MAX {
            return Err(InstanceIdOutOfRange(value));
        }
        Ok(Self(value))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// PLDM type codes (DSP0245). We only ever originate OEM messages, but the
/// others are useful when decoding traffic for debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PldmType {
    Base = 0x00,
    Platform = 0x02,
    Bios = 0x03,
    Fru = 0x04,
    FirmwareUpdate = 0x05,
    Oem = 0x3f,
}

impl PldmType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Base),
            0x02 => Some(Self::Platform),
            0x03 => Some(Self::Bios),
            0x04 => Some(Self::Fru),
            0x05 => Some(Self::FirmwareUpdate),
            0x3f => Some(Self::Oem),
            _ => None,
        }
    }
}

/// Three-byte PLDM message header.
///
/// The first two bytes pack several bitfields; accessors unpack them.
#[derive(
    Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct Header {
    rq_d_instance: u8,
    version_type: u8,
    command: u8,
}

impl Header {
    /// Header for a request (not a datagram) of `pldm_type`/`command`.
    pub fn request(
        instance_id: InstanceId,
        pldm_type: PldmType,
        command: u8,
    ) -> Self {
        Self {
            rq_d_instance: REQUEST_BIT | instance_id.get(),
            version_type: (HEADER_VERSION << HEADER_VERSION_SHIFT)
                | (pldm_type as u8 & PLDM_TYPE_MASK),
            command,
        }
    }

    pub fn is_request(&self) -> bool {
        self.rq_d_instance & REQUEST_BIT != 0
    }

    pub fn is_datagram(&self) -> bool {
        self.rq_d_instance & DATAGRAM_BIT != 0
    }

    pub fn instance_id(&self) -> InstanceId {
        InstanceId(self.rq_d_instance & INSTANCE_ID_MASK)
    }

    pub fn version(&self) -> u8 {
        self.version_type >> HEADER_VERSION_SHIFT
    }

    pub fn pldm_type(&self) -> Option<PldmType> {
        PldmType::from_code(self.version_type & PLDM_TYPE_MASK)
    }

    pub fn command(&self) -> u8 {
        self.command
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("request", &self.is_request())
            .field("datagram", &self.is_datagram())
            .field("instance_id", &self.instance_id())
            .field("version", &self.version())
            .field("pldm_type", &self.pldm_type())
            .field("command", &self.command)
            .finish()
    }
}

// Every message we build must fit in our fixed outgoing buffer.
const_assert!(NewFileAvailable::MAX_SIZE <= MAX_SERIALIZED_SIZE);

#[derive(Debug)]
pub enum EncodeError {
    /// The instance id does not fit in the header.
    InstanceId(InstanceIdOutOfRange),
    /// The output buffer could not hold the message.
    Serialize(HubpackError),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceId(err) => write!(f, "bad header: {err}"),
            Self::Serialize(err) => write!(f, "serialization failed: {err:?}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EncodeError {}

impl From<InstanceIdOutOfRange> for EncodeError {
    fn from(err: InstanceIdOutOfRange) -> Self {
        Self::InstanceId(err)
    }
}
