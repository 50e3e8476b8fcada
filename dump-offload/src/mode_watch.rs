// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::bus::MatchRule;
use crate::bus::PropertiesChanged;
use crate::bus::PropertyValue;
use crate::bus::BASE_BIOS_TABLE;
use crate::bus::BIOS_CONFIG_INTERFACE;
use crate::bus::BIOS_CONFIG_PATH;
use crate::error::Shutdown;
use crate::host_state::management_mode_from_table;
use crate::host_state::ManagementMode;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::Logger;

/// Watches for the system becoming HMC managed.
///
/// Moving out of HMC management requires powering the system off, so once
/// we see the transition there is nothing left for this service to do: the
/// watch reports a [`Shutdown`] and the owner stops.
#[derive(Debug)]
pub struct ManagementModeWatch {
    log: Logger,
}

impl ManagementModeWatch {
    pub fn new(log: &Logger) -> Self {
        Self { log: log.new(o!("component" => "ManagementModeWatch")) }
    }

    pub fn rule() -> MatchRule {
        MatchRule::properties_changed(BIOS_CONFIG_PATH, BIOS_CONFIG_INTERFACE)
    }

    /// Inspect one change signal from the BIOS config manager.
    pub fn on_change(&self, signal: &PropertiesChanged) -> Option<Shutdown> {
        let Some(value) = signal.changed.get(BASE_BIOS_TABLE) else {
            debug!(
                self.log, "ignoring BIOS config change";
                "properties" => ?signal.changed.keys().collect::<Vec<_>>(),
            );
            return None;
        };

        let mode = match value {
            PropertyValue::BiosTable(table) => management_mode_from_table(table),
            other => {
                error!(
                    self.log, "unexpected BaseBIOSTable type";
                    "type" => other.type_name(),
                );
                return Some(Shutdown::MalformedConfiguration(format!(
                    "{BASE_BIOS_TABLE} has type {}",
                    other.type_name()
                )));
            }
        };

        match mode {
            Ok(ManagementMode::HmcManaged) => {
                info!(self.log, "system is now HMC managed");
                Some(Shutdown::HmcManaged)
            }
            Ok(ManagementMode::Standalone) => None,
            Err(err) => {
                error!(self.log, "malformed management mode attribute"; &err);
                Some(Shutdown::from(err))
            }
        }
    }
}
