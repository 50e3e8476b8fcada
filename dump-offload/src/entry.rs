// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dump entries as published by the dump manager.

use crate::error::UnknownDumpCategory;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

const PROGRESS_STATUS_PREFIX: &str =
    "xyz.openbmc_project.Common.Progress.OperationStatus.";

/// Kinds of dump the dump manager publishes.
///
/// `System` entries aggregate several host-side dump kinds; which one a
/// given entry is depends on its id (see [`crate::classify_dump`]).
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
#[serde(rename_all = "lowercase")]
pub enum DumpCategory {
    Bmc,
    Hostboot,
    Sbe,
    Hardware,
    System,
}

impl DumpCategory {
    pub const ALL: [Self; 5] =
        [Self::Bmc, Self::Hostboot, Self::Sbe, Self::Hardware, Self::System];

    /// D-Bus interface implemented by entries of this category.
    pub fn entry_interface(self) -> &'static str {
        match self {
            Self::Bmc => "xyz.openbmc_project.Dump.Entry.BMC",
            Self::Hostboot => "com.ibm.Dump.Entry.Hostboot",
            Self::Sbe => "com.ibm.Dump.Entry.SBE",
            Self::Hardware => "com.ibm.Dump.Entry.Hardware",
            Self::System => "xyz.openbmc_project.Dump.Entry.System",
        }
    }

    /// Object path prefix under which entries of this category live.
    pub fn entry_object_path(self) -> &'static str {
        match self {
            Self::Bmc => "/xyz/openbmc_project/dump/bmc/entry",
            Self::Hostboot => "/xyz/openbmc_project/dump/hostboot/entry",
            Self::Sbe => "/xyz/openbmc_project/dump/sbe/entry",
            Self::Hardware => "/xyz/openbmc_project/dump/hardware/entry",
            Self::System => "/xyz/openbmc_project/dump/system/entry",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bmc => "bmc",
            Self::Hostboot => "hostboot",
            Self::Sbe => "sbe",
            Self::Hardware => "hardware",
            Self::System => "system",
        }
    }
}

impl fmt::Display for DumpCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DumpCategory {
    type Err = UnknownDumpCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownDumpCategory(s.to_string()))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    #[default]
    InProgress,
    Complete,
}

impl CompletionStatus {
    /// Decode the dump manager's progress `Status` property.
    ///
    /// Only `Completed` counts as complete; `Failed` and `Aborted` dumps
    /// have nothing for the host to fetch.
    pub fn from_progress_status(status: &str) -> Self {
        let short = status.strip_prefix(PROGRESS_STATUS_PREFIX).unwrap_or(status);
        if short == "Completed" {
            Self::Complete
        } else {
            Self::InProgress
        }
    }
}

/// One dump known to the dump manager. We only ever read these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpEntry {
    pub id: u32,
    pub category: DumpCategory,
    /// Size in bytes.
    pub size: u64,
    #[serde(default)]
    pub status: CompletionStatus,
}

impl DumpEntry {
    pub fn is_complete(&self) -> bool {
        self.status == CompletionStatus::Complete
    }

    /// Key identifying this entry among all categories.
    pub fn key(&self) -> (DumpCategory, u32) {
        (self.category, self.id)
    }

    /// D-Bus object path of this entry.
    pub fn object_path(&self) -> String {
        format!("{}/{}", self.category.entry_object_path(), self.id)
    }
}
