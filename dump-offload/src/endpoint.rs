// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MCTP endpoint ids and discovery of the host's endpoint id.

use crate::error::ConfigError;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::Path;

/// Where the platform records the host's MCTP endpoint id.
pub const DEFAULT_HOST_EID_PATH: &str = "/usr/share/pldm/host_eid";

/// MCTP endpoint id.
///
/// We always map the PLDM terminus id of the host to the same value as its
/// endpoint id, so this type is used for both.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Eid(pub u8);

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Read the host endpoint id from `path`.
///
/// The file holds a single decimal integer; surrounding whitespace is
/// ignored. A missing or empty file is an error rather than a reason to
/// guess: sending to the wrong endpoint would silently lose the
/// notification.
pub fn read_host_eid(path: &Path) -> Result<Eid, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        ConfigError::EidFileRead { path: path.to_path_buf(), err }
    })?;

    let value = contents.trim();
    if value.is_empty() {
        return Err(ConfigError::EidFileEmpty { path: path.to_path_buf() });
    }

    value.parse::<u8>().map(Eid).map_err(|_| ConfigError::InvalidEid {
        path: path.to_path_buf(),
        value: value.to_string(),
    })
}
