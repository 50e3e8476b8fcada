// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::DumpCategory;
use crate::Eid;
use slog_error_chain::SlogInlineError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, SlogInlineError)]
pub enum AllocError {
    #[error("no instance id available for TID {tid} after {attempts} attempts")]
    ResourceExhausted { tid: Eid, attempts: usize },
    #[error("instance id database unavailable: {reason}")]
    BackendUnavailable { reason: String },
}

#[derive(Debug, Error, SlogInlineError)]
pub enum TransportError {
    #[error("transport already open")]
    AlreadyOpen,
    #[error("failed to initialize MCTP demux transport")]
    TransportInitFailed(#[source] io::Error),
    #[error("failed to map host EID {eid}")]
    EndpointMappingFailed {
        eid: Eid,
        #[source]
        err: io::Error,
    },
    #[error("transport is not open for TID {tid}")]
    NotOpen { tid: Eid },
    #[error("failed to send {len}-byte message to TID {tid}")]
    Send {
        tid: Eid,
        len: usize,
        #[source]
        err: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum ClassifyError {
    #[error("unsupported {category} dump id {id:08X}")]
    UnsupportedDumpId { category: DumpCategory, id: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown dump category {0:?}")]
pub struct UnknownDumpCategory(pub String);

#[derive(Debug, Error, SlogInlineError)]
pub enum EncodingError {
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error("failed to encode new file request")]
    Message(#[source] pldm_messages::EncodeError),
}

#[derive(Debug, Error, SlogInlineError)]
pub enum NotifyError {
    #[error("failed to encode new file request for dump {id}")]
    EncodingFailed {
        id: u32,
        #[source]
        err: EncodingError,
    },
    #[error("failed to allocate PLDM instance id")]
    Allocate(#[from] AllocError),
    #[error("failed to open PLDM transport")]
    TransportOpenFailed(#[source] TransportError),
    #[error("failed to send new file request for dump {id}")]
    SendFailed {
        id: u32,
        #[source]
        err: TransportError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum BusError {
    #[error("property {interface}.{name} not found on {path}")]
    NotFound { path: String, interface: String, name: String },
    #[error("property {name} has unexpected type (expected {expected})")]
    UnexpectedType { name: String, expected: &'static str },
    #[error("bus request failed: {0}")]
    Backend(String),
}

#[derive(Debug, Error, SlogInlineError)]
pub enum ConfigError {
    #[error("failed to read host EID file {}", path.display())]
    EidFileRead {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("host EID file {} is empty", path.display())]
    EidFileEmpty { path: PathBuf },
    #[error("invalid host EID {value:?} in {}", path.display())]
    InvalidEid { path: PathBuf, value: String },
    #[error("failed to read management mode")]
    ManagementModeRead(#[source] BusError),
    #[error("BIOS attribute {attribute} missing")]
    MissingAttribute { attribute: &'static str },
    #[error("BIOS attribute {attribute} is not a string")]
    AttributeNotString { attribute: &'static str },
}

/// Why the offload service stopped.
///
/// None of these are failures of the service itself: each means there is
/// nothing left for it to do, and the owning process should exit cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shutdown {
    /// The system is (or became) HMC managed; dumps are offloaded by the
    /// HMC, not by us.
    HmcManaged,
    /// The management-mode configuration did not have the expected shape.
    MalformedConfiguration(String),
    /// Every event source we were consuming has closed.
    EventsClosed,
}

impl Shutdown {
    /// Process exit code for this shutdown. Always zero: supervisors must
    /// not treat any of these as a crash.
    pub fn exit_code(&self) -> i32 {
        0
    }
}

impl std::fmt::Display for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HmcManaged => f.write_str("system is HMC managed"),
            Self::MalformedConfiguration(reason) => {
                write!(f, "malformed management mode configuration: {reason}")
            }
            Self::EventsClosed => f.write_str("all event sources closed"),
        }
    }
}

impl From<ConfigError> for Shutdown {
    fn from(err: ConfigError) -> Self {
        Self::MalformedConfiguration(
            slog_error_chain::InlineErrorChain::new(&err).to_string(),
        )
    }
}
