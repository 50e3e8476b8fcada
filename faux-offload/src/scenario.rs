// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scripted system state for `faux-offload run`.
//!
//! A scenario file seeds an in-memory bus; further changes arrive as JSON
//! lines on stdin while the service runs.

use anyhow::Context;
use anyhow::Result;
use dump_offload::bus::AttributeValue;
use dump_offload::bus::BiosAttribute;
use dump_offload::bus::BiosTable;
use dump_offload::bus::InMemoryBus;
use dump_offload::bus::PropertyValue;
use dump_offload::bus::BASE_BIOS_TABLE;
use dump_offload::bus::BIOS_CONFIG_INTERFACE;
use dump_offload::bus::BIOS_CONFIG_PATH;
use dump_offload::bus::BOOT_PROGRESS_INTERFACE;
use dump_offload::bus::BOOT_PROGRESS_PROPERTY;
use dump_offload::bus::HMC_MANAGED_ATTRIBUTE;
use dump_offload::bus::HOST_STATE_PATH;
use dump_offload::DumpCategory;
use dump_offload::DumpEntry;
use dump_offload::OffloadEvent;
use serde::Deserialize;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use std::path::Path;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

const PROGRESS_STAGES_PREFIX: &str =
    "xyz.openbmc_project.State.Boot.Progress.ProgressStages.";

fn default_hmc_managed() -> Option<String> {
    Some("Disabled".to_string())
}

fn default_boot_progress() -> String {
    "Unspecified".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Scenario {
    /// Value of the `pvm_hmc_managed` BIOS attribute; `null` leaves the
    /// attribute out of the table.
    #[serde(default = "default_hmc_managed")]
    pub hmc_managed: Option<String>,
    /// `ProgressStages` name, with or without its prefix.
    #[serde(default = "default_boot_progress")]
    pub boot_progress: String,
    #[serde(default)]
    pub entries: Vec<DumpEntry>,
}

impl Scenario {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| {
            format!("failed to read scenario {}", path.display())
        })?;
        serde_json::from_str(&contents).with_context(|| {
            format!("failed to parse scenario {}", path.display())
        })
    }

    /// Seed `bus` without emitting change signals.
    pub(crate) fn install(&self, bus: &InMemoryBus) {
        bus.set_property(
            BIOS_CONFIG_PATH,
            BIOS_CONFIG_INTERFACE,
            BASE_BIOS_TABLE,
            bios_table(self.hmc_managed.as_deref()),
        );
        bus.set_property(
            HOST_STATE_PATH,
            BOOT_PROGRESS_INTERFACE,
            BOOT_PROGRESS_PROPERTY,
            boot_progress(&self.boot_progress),
        );
        for entry in &self.entries {
            bus.insert_entry(entry.clone());
        }
    }
}

fn bios_table(hmc_managed: Option<&str>) -> PropertyValue {
    let mut table = BiosTable::new();
    if let Some(value) = hmc_managed {
        table.insert(
            HMC_MANAGED_ATTRIBUTE.to_string(),
            BiosAttribute { current: AttributeValue::String(value.to_string()) },
        );
    }
    PropertyValue::BiosTable(table)
}

fn boot_progress(stage: &str) -> PropertyValue {
    if stage.starts_with(PROGRESS_STAGES_PREFIX) {
        PropertyValue::Str(stage.to_string())
    } else {
        PropertyValue::Str(format!("{PROGRESS_STAGES_PREFIX}{stage}"))
    }
}

/// One line of the stdin script.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ScriptLine {
    BootProgress(String),
    HmcManaged(Option<String>),
    DumpReady(DumpEntry),
    DumpRemoved { category: DumpCategory, id: u32 },
    SweepRequested,
}

impl ScriptLine {
    /// Apply this line to the bus, returning the entry event (if any) it
    /// produces.
    fn apply(self, bus: &InMemoryBus) -> Option<OffloadEvent> {
        match self {
            Self::BootProgress(stage) => {
                bus.update_property(
                    HOST_STATE_PATH,
                    BOOT_PROGRESS_INTERFACE,
                    BOOT_PROGRESS_PROPERTY,
                    boot_progress(&stage),
                );
                None
            }
            Self::HmcManaged(value) => {
                bus.update_property(
                    BIOS_CONFIG_PATH,
                    BIOS_CONFIG_INTERFACE,
                    BASE_BIOS_TABLE,
                    bios_table(value.as_deref()),
                );
                None
            }
            Self::DumpReady(entry) => {
                bus.insert_entry(entry.clone());
                Some(OffloadEvent::DumpReady(entry))
            }
            Self::DumpRemoved { category, id } => {
                bus.remove_entry(category, id);
                Some(OffloadEvent::DumpRemoved { category, id })
            }
            Self::SweepRequested => Some(OffloadEvent::SweepRequested),
        }
    }
}

/// Feed script lines from `input` into `bus` and `events` until `input`
/// ends, then close every subscription so the service can wind down.
pub(crate) async fn replay<R>(
    input: R,
    bus: InMemoryBus,
    events: mpsc::Sender<OffloadEvent>,
    log: Logger,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = LinesStream::new(input.lines());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(log, "failed to read script"; "err" => %err);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let script_line = match serde_json::from_str::<ScriptLine>(line) {
            Ok(script_line) => script_line,
            Err(err) => {
                warn!(
                    log, "ignoring malformed script line";
                    "line" => line,
                    "err" => %err,
                );
                continue;
            }
        };
        debug!(log, "script"; "line" => ?script_line);

        if let Some(event) = script_line.apply(&bus) {
            if events.send(event).await.is_err() {
                // The service has already stopped.
                break;
            }
        }
    }

    info!(log, "script finished");
    bus.close_subscriptions();
}
