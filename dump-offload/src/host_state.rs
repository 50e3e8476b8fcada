// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoding of the two host conditions that gate offload: the management
//! mode and the host's boot progress.

use crate::bus::AttributeValue;
use crate::bus::BiosTable;
use crate::bus::PropertiesChanged;
use crate::bus::PropertyStore;
use crate::bus::PropertyValue;
use crate::bus::BASE_BIOS_TABLE;
use crate::bus::BIOS_CONFIG_INTERFACE;
use crate::bus::BIOS_CONFIG_PATH;
use crate::bus::BIOS_CONFIG_SERVICE;
use crate::bus::BOOT_PROGRESS_INTERFACE;
use crate::bus::BOOT_PROGRESS_PROPERTY;
use crate::bus::HMC_MANAGED_ATTRIBUTE;
use crate::bus::HMC_MANAGED_ENABLED;
use crate::bus::HOST_STATE_PATH;
use crate::bus::HOST_STATE_SERVICE;
use crate::error::BusError;
use crate::error::ConfigError;
use slog::info;
use slog::warn;
use slog::Logger;
use std::fmt;

const PROGRESS_STAGES_PREFIX: &str =
    "xyz.openbmc_project.State.Boot.Progress.ProgressStages.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementMode {
    HmcManaged,
    Standalone,
}

/// Host boot progress, reduced to the stages we care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootProgress {
    NotStarted,
    SystemInitComplete,
    OsStart,
    OsRunning,
    Other(String),
}

impl BootProgress {
    /// Decode a `ProgressStages` value, fully qualified or not.
    pub fn parse(value: &str) -> Self {
        let short = value.strip_prefix(PROGRESS_STAGES_PREFIX).unwrap_or(value);
        match short {
            "Unspecified" => Self::NotStarted,
            "SystemInitComplete" => Self::SystemInitComplete,
            "OSStart" => Self::OsStart,
            "OSRunning" => Self::OsRunning,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the host has booted far enough to accept notifications.
    pub fn permits_offload(&self) -> bool {
        matches!(
            self,
            Self::SystemInitComplete | Self::OsStart | Self::OsRunning
        )
    }

    /// Extract the boot progress carried by a change signal, if any.
    pub fn from_signal(signal: &PropertiesChanged) -> Option<Self> {
        match signal.changed.get(BOOT_PROGRESS_PROPERTY)? {
            PropertyValue::Str(value) => Some(Self::parse(value)),
            _ => None,
        }
    }
}

impl fmt::Display for BootProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("Unspecified"),
            Self::SystemInitComplete => f.write_str("SystemInitComplete"),
            Self::OsStart => f.write_str("OSStart"),
            Self::OsRunning => f.write_str("OSRunning"),
            Self::Other(stage) => f.write_str(stage),
        }
    }
}

pub fn management_mode_from_table(
    table: &BiosTable,
) -> Result<ManagementMode, ConfigError> {
    let attribute = table.get(HMC_MANAGED_ATTRIBUTE).ok_or(
        ConfigError::MissingAttribute { attribute: HMC_MANAGED_ATTRIBUTE },
    )?;
    match &attribute.current {
        AttributeValue::String(value) if value == HMC_MANAGED_ENABLED => {
            Ok(ManagementMode::HmcManaged)
        }
        AttributeValue::String(_) => Ok(ManagementMode::Standalone),
        AttributeValue::Integer(_) => Err(ConfigError::AttributeNotString {
            attribute: HMC_MANAGED_ATTRIBUTE,
        }),
    }
}

/// Read the current management mode.
///
/// Every failure is reported; there is no default mode.
pub fn read_management_mode(
    store: &impl PropertyStore,
) -> Result<ManagementMode, ConfigError> {
    let value = store
        .get_property(
            BIOS_CONFIG_SERVICE,
            BIOS_CONFIG_PATH,
            BIOS_CONFIG_INTERFACE,
            BASE_BIOS_TABLE,
        )
        .map_err(ConfigError::ManagementModeRead)?;

    match value {
        PropertyValue::BiosTable(table) => management_mode_from_table(&table),
        other => Err(ConfigError::ManagementModeRead(BusError::UnexpectedType {
            name: format!("{BASE_BIOS_TABLE} ({})", other.type_name()),
            expected: "BIOS table",
        })),
    }
}

/// Read the host's boot progress. Failures are logged and reported as
/// `NotStarted`, which leaves us waiting for a change signal.
pub fn read_boot_progress(
    store: &impl PropertyStore,
    log: &Logger,
) -> BootProgress {
    match store.get_property(
        HOST_STATE_SERVICE,
        HOST_STATE_PATH,
        BOOT_PROGRESS_INTERFACE,
        BOOT_PROGRESS_PROPERTY,
    ) {
        Ok(PropertyValue::Str(value)) => {
            let progress = BootProgress::parse(&value);
            info!(log, "read host boot progress"; "progress" => %progress);
            progress
        }
        Ok(other) => {
            warn!(
                log, "unexpected BootProgress type";
                "type" => other.type_name(),
            );
            BootProgress::NotStarted
        }
        Err(err) => {
            warn!(log, "failed to read BootProgress"; &err);
            BootProgress::NotStarted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BiosAttribute;
    use crate::bus::InMemoryBus;
    use crate::bus::PropertyMap;
    use crate::test_util::test_logger;

    fn table(value: AttributeValue) -> BiosTable {
        let mut table = BiosTable::new();
        table.insert(
            HMC_MANAGED_ATTRIBUTE.to_string(),
            BiosAttribute { current: value },
        );
        table
    }

    #[test]
    fn boot_progress_names() {
        assert_eq!(
            BootProgress::parse(
                "xyz.openbmc_project.State.Boot.Progress.ProgressStages.OSRunning"
            ),
            BootProgress::OsRunning
        );
        assert_eq!(
            BootProgress::parse("SystemInitComplete"),
            BootProgress::SystemInitComplete
        );
        assert_eq!(
            BootProgress::parse(
                "xyz.openbmc_project.State.Boot.Progress.ProgressStages.Unspecified"
            ),
            BootProgress::NotStarted
        );
        assert_eq!(
            BootProgress::parse("PCIInit"),
            BootProgress::Other("PCIInit".to_string())
        );
    }

    #[test]
    fn only_late_stages_permit_offload() {
        for stage in ["SystemInitComplete", "OSStart", "OSRunning"] {
            assert!(BootProgress::parse(stage).permits_offload(), "{stage}");
        }
        for stage in ["Unspecified", "PrimaryProcInit", "MotherboardInit"] {
            assert!(!BootProgress::parse(stage).permits_offload(), "{stage}");
        }
    }

    #[test]
    fn boot_progress_from_signal() {
        let mut changed = PropertyMap::new();
        changed.insert(
            BOOT_PROGRESS_PROPERTY.to_string(),
            PropertyValue::Str("OSStart".to_string()),
        );
        let signal = PropertiesChanged {
            interface: BOOT_PROGRESS_INTERFACE.to_string(),
            changed,
        };
        assert_eq!(BootProgress::from_signal(&signal), Some(BootProgress::OsStart));

        let unrelated = PropertiesChanged {
            interface: BOOT_PROGRESS_INTERFACE.to_string(),
            changed: PropertyMap::new(),
        };
        assert_eq!(BootProgress::from_signal(&unrelated), None);
    }

    #[test]
    fn management_mode_decoding() {
        assert!(matches!(
            management_mode_from_table(&table(AttributeValue::String(
                "Enabled".to_string()
            ))),
            Ok(ManagementMode::HmcManaged)
        ));
        assert!(matches!(
            management_mode_from_table(&table(AttributeValue::String(
                "Disabled".to_string()
            ))),
            Ok(ManagementMode::Standalone)
        ));
        assert!(matches!(
            management_mode_from_table(&table(AttributeValue::Integer(1))),
            Err(ConfigError::AttributeNotString { .. })
        ));
        assert!(matches!(
            management_mode_from_table(&BiosTable::new()),
            Err(ConfigError::MissingAttribute { .. })
        ));
    }

    #[test]
    fn management_mode_read_failures() {
        let bus = InMemoryBus::default();
        assert!(matches!(
            read_management_mode(&bus),
            Err(ConfigError::ManagementModeRead(BusError::NotFound { .. }))
        ));

        bus.set_property(
            BIOS_CONFIG_PATH,
            BIOS_CONFIG_INTERFACE,
            BASE_BIOS_TABLE,
            PropertyValue::Bool(true),
        );
        assert!(matches!(
            read_management_mode(&bus),
            Err(ConfigError::ManagementModeRead(
                BusError::UnexpectedType { .. }
            ))
        ));
    }

    #[test]
    fn boot_progress_read_failure_means_not_started() {
        let bus = InMemoryBus::default();
        let log = test_logger();
        assert_eq!(read_boot_progress(&bus, &log), BootProgress::NotStarted);

        bus.set_property(
            HOST_STATE_PATH,
            BOOT_PROGRESS_INTERFACE,
            BOOT_PROGRESS_PROPERTY,
            PropertyValue::Str(
                "xyz.openbmc_project.State.Boot.Progress.ProgressStages.OSRunning"
                    .to_string(),
            ),
        );
        assert_eq!(read_boot_progress(&bus, &log), BootProgress::OsRunning);
    }
}
