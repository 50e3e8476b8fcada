// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IBM OEM file I/O messages.

use crate::EncodeError;
use crate::Header;
use crate::InstanceId;
use crate::PldmType;
use core::fmt;
use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;
use serde_repr::Deserialize_repr;
use serde_repr::Serialize_repr;
use static_assertions::const_assert_eq;

/// OEM file I/O command: the BMC has a new file the host may fetch.
pub const NEW_FILE_AVAILABLE: u8 = 0x06;

/// Size of the `NewFileAvailable` request body.
pub const NEW_FILE_REQ_BYTES: usize = 14;

/// File types the host understands for dump files.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr,
)]
#[repr(u16)]
pub enum FileType {
    BmcDump = 0x0f,
    SbeDump = 0x10,
    HostbootDump = 0x11,
    HardwareDump = 0x12,
}

// `Serialize_repr` writes the discriminant as a `u16`, not as a hubpack enum
// tag, so the derived size would be wrong.
impl SerializedSize for FileType {
    const MAX_SIZE: usize = u16::MAX_SIZE;
}

impl FileType {
    pub const fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BmcDump => "bmc-dump",
            Self::SbeDump => "sbe-dump",
            Self::HostbootDump => "hostboot-dump",
            Self::HardwareDump => "hardware-dump",
        };
        write!(f, "{name} ({:#04x})", self.code())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct NewFileAvailableRequest {
    pub file_type: FileType,
    /// The host echoes this back when it asks for the file; we use the
    /// dump id.
    pub file_handle: u32,
    /// File size in bytes.
    pub length: u64,
}

const_assert_eq!(NewFileAvailableRequest::MAX_SIZE, NEW_FILE_REQ_BYTES);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct NewFileAvailable {
    pub header: Header,
    pub request: NewFileAvailableRequest,
}

impl NewFileAvailable {
    pub fn new(
        instance_id: InstanceId,
        request: NewFileAvailableRequest,
    ) -> Self {
        Self {
            header: Header::request(
                instance_id,
                PldmType::Oem,
                NEW_FILE_AVAILABLE,
            ),
            request,
        }
    }
}

/// Encode a complete "new file available" request into `out`, returning the
/// number of bytes written.
///
/// `instance_id` is taken as a raw byte because it comes straight from the
/// instance id database; values that do not fit the header are rejected.
pub fn encode_new_file_available(
    instance_id: u8,
    request: NewFileAvailableRequest,
    out: &mut [u8],
) -> Result<usize, EncodeError> {
    let instance_id = InstanceId::try_from(instance_id)?;
    let message = NewFileAvailable::new(instance_id, request);
    hubpack::serialize(out, &message).map_err(EncodeError::Serialize)
}
