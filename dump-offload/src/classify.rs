// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::ClassifyError;
use crate::DumpCategory;
use pldm_messages::FileType;

/// Map a dump to the file type we advertise to the host.
///
/// System dump ids encode the originating dump kind in their top hex digit
/// (the first character of the id rendered as `{:08X}`): `3` and `4` are
/// SBE dumps, `2` is hostboot and `0` is hardware. Any other digit is
/// rejected rather than guessed at.
pub fn classify_dump(
    category: DumpCategory,
    id: u32,
) -> Result<FileType, ClassifyError> {
    match category {
        DumpCategory::Bmc => Ok(FileType::BmcDump),
        DumpCategory::Hostboot => Ok(FileType::HostbootDump),
        DumpCategory::Sbe => Ok(FileType::SbeDump),
        DumpCategory::Hardware => Ok(FileType::HardwareDump),
        DumpCategory::System => match id >> 28 {
            0x3 | 0x4 => Ok(FileType::SbeDump),
            0x2 => Ok(FileType::HostbootDump),
            0x0 => Ok(FileType::HardwareDump),
            _ => Err(ClassifyError::UnsupportedDumpId { category, id }),
        },
    }
}
