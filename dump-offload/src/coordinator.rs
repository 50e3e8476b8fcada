// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The offload state machine.
//!
//! ```text
//!                 HMC managed
//!   (startup) ─────────────────────────────▶ BlockedHmc
//!       │                                        ▲
//!       │ standalone                             │ HMC managed at
//!       ▼                                        │ sweep time
//!   WaitingForBoot ── first qualifying ──▶ Offloading ◀──▶ Done
//!                     boot progress                  sweep
//! ```
//!
//! `Done` is a checkpoint, not a terminal state: a later sweep request
//! re-enters `Offloading` and notifies only entries we have not already
//! offloaded.

use crate::bus::EntrySource;
use crate::bus::PropertyStore;
use crate::error::Shutdown;
use crate::host_state::read_boot_progress;
use crate::host_state::read_management_mode;
use crate::host_state::BootProgress;
use crate::host_state::ManagementMode;
use crate::notifier::Notify;
use crate::DumpCategory;
use crate::DumpEntry;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadState {
    /// The system is HMC managed; we never offload.
    BlockedHmc,
    WaitingForBoot,
    Offloading,
    Done,
}

/// Counts from one sweep (or one single-entry offload).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub notified: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Notified,
    Failed,
    Skipped,
}

impl SweepSummary {
    fn record(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Notified => self.notified += 1,
            EntryOutcome::Failed => self.failed += 1,
            EntryOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Offloads the entries of one dump category.
#[derive(Debug)]
pub struct OffloadHandler {
    category: DumpCategory,
    log: Logger,
}

impl OffloadHandler {
    pub fn new(category: DumpCategory, log: &Logger) -> Self {
        let log = log.new(o!(
            "category" => category.as_str(),
            "interface" => category.entry_interface(),
        ));
        Self { category, log }
    }

    pub fn category(&self) -> DumpCategory {
        self.category
    }

    fn offload<N: Notify>(
        &self,
        entries: &[DumpEntry],
        offloaded: &mut BTreeSet<(DumpCategory, u32)>,
        notifier: &mut N,
        summary: &mut SweepSummary,
    ) {
        for entry in entries {
            summary.record(self.offload_entry(entry, offloaded, notifier));
        }
    }

    fn offload_entry<N: Notify>(
        &self,
        entry: &DumpEntry,
        offloaded: &mut BTreeSet<(DumpCategory, u32)>,
        notifier: &mut N,
    ) -> EntryOutcome {
        if !entry.is_complete() {
            debug!(self.log, "dump not complete yet"; "dump_id" => entry.id);
            return EntryOutcome::Skipped;
        }
        if offloaded.contains(&entry.key()) {
            return EntryOutcome::Skipped;
        }
        if entry.size == 0 {
            warn!(
                self.log, "skipping empty dump";
                "dump_id" => entry.id,
                "path" => entry.object_path(),
            );
            return EntryOutcome::Skipped;
        }

        match notifier.notify(entry) {
            Ok(()) => {
                info!(
                    self.log, "offloaded dump";
                    "dump_id" => entry.id,
                    "size" => entry.size,
                );
                offloaded.insert(entry.key());
                EntryOutcome::Notified
            }
            Err(err) => {
                // Left out of the offloaded set so the next sweep retries.
                warn!(
                    self.log, "failed to offload dump";
                    "dump_id" => entry.id,
                    &err,
                );
                EntryOutcome::Failed
            }
        }
    }
}

/// Decides when dumps may be offloaded and drives the sweeps that do it.
///
/// All methods run on the caller's thread; notifications are sent
/// synchronously from within them.
pub struct OffloadCoordinator<S, E, N> {
    store: S,
    entries: E,
    notifier: Option<N>,
    handlers: Vec<OffloadHandler>,
    offloaded: BTreeSet<(DumpCategory, u32)>,
    state: OffloadState,
    log: Logger,
}

impl<S, E, N> fmt::Debug for OffloadCoordinator<S, E, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadCoordinator")
            .field("state", &self.state)
            .field("handlers", &self.handlers.len())
            .field("offloaded", &self.offloaded)
            .finish()
    }
}

impl<S, E, N> OffloadCoordinator<S, E, N>
where
    S: PropertyStore,
    E: EntrySource,
    N: Notify,
{
    /// Determine the initial state from the current management mode and
    /// boot progress.
    ///
    /// On an HMC managed system neither the notifier nor any handler is
    /// built: `make_notifier` is never called.
    pub fn new<F>(
        store: S,
        entries: E,
        make_notifier: F,
        log: &Logger,
    ) -> Result<Self, Shutdown>
    where
        F: FnOnce() -> N,
    {
        let log = log.new(o!("component" => "OffloadCoordinator"));

        let mode = read_management_mode(&store).map_err(|err| {
            error!(log, "cannot determine management mode"; &err);
            Shutdown::from(err)
        })?;

        if mode == ManagementMode::HmcManaged {
            info!(log, "system is HMC managed; dumps will not be offloaded");
            return Ok(Self {
                store,
                entries,
                notifier: None,
                handlers: Vec::new(),
                offloaded: BTreeSet::new(),
                state: OffloadState::BlockedHmc,
                log,
            });
        }

        let progress = read_boot_progress(&store, &log);
        let state = if progress.permits_offload() {
            OffloadState::Offloading
        } else {
            info!(
                log, "host not booted; waiting for boot progress";
                "progress" => %progress,
            );
            OffloadState::WaitingForBoot
        };

        let handlers = DumpCategory::ALL
            .into_iter()
            .map(|category| OffloadHandler::new(category, &log))
            .collect();

        Ok(Self {
            store,
            entries,
            notifier: Some(make_notifier()),
            handlers,
            offloaded: BTreeSet::new(),
            state,
            log,
        })
    }

    pub fn state(&self) -> OffloadState {
        self.state
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_offloaded(&self, category: DumpCategory, id: u32) -> bool {
        self.offloaded.contains(&(category, id))
    }

    /// Run the first sweep if the host was already booted at startup.
    pub fn start(&mut self) -> Result<Option<SweepSummary>, Shutdown> {
        if self.state == OffloadState::Offloading {
            self.sweep().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Feed a boot progress change. Only the first qualifying value while
    /// waiting for boot triggers a sweep; everything after it is a no-op.
    pub fn on_boot_progress(
        &mut self,
        progress: &BootProgress,
    ) -> Result<Option<SweepSummary>, Shutdown> {
        if self.state != OffloadState::WaitingForBoot {
            debug!(
                self.log, "ignoring boot progress";
                "progress" => %progress,
                "state" => ?self.state,
            );
            return Ok(None);
        }
        if !progress.permits_offload() {
            debug!(self.log, "host still booting"; "progress" => %progress);
            return Ok(None);
        }

        info!(self.log, "host booted; starting offload"; "progress" => %progress);
        self.state = OffloadState::Offloading;
        self.sweep().map(Some)
    }

    /// Sweep again for entries that appeared (or failed) since the last
    /// sweep. Does nothing until the boot gate has opened.
    pub fn request_sweep(&mut self) -> Result<Option<SweepSummary>, Shutdown> {
        match self.state {
            OffloadState::Offloading | OffloadState::Done => {
                self.state = OffloadState::Offloading;
                self.sweep().map(Some)
            }
            OffloadState::BlockedHmc | OffloadState::WaitingForBoot => {
                debug!(
                    self.log, "sweep not permitted";
                    "state" => ?self.state,
                );
                Ok(None)
            }
        }
    }

    /// Offload a single entry reported ready by the entry watcher.
    ///
    /// Returns whether the host was notified. Entries that cannot be
    /// offloaded yet are left for a later sweep.
    pub fn offload_ready(&mut self, entry: &DumpEntry) -> Result<bool, Shutdown> {
        if !matches!(self.state, OffloadState::Offloading | OffloadState::Done)
        {
            debug!(
                self.log, "offload not permitted; leaving dump for later";
                "dump_id" => entry.id,
                "state" => ?self.state,
            );
            return Ok(false);
        }
        if !entry.is_complete() || self.offloaded.contains(&entry.key()) {
            return Ok(false);
        }

        self.check_management_mode()?;

        let Some(notifier) = self.notifier.as_mut() else {
            return Ok(false);
        };
        let Some(handler) =
            self.handlers.iter().find(|h| h.category == entry.category)
        else {
            return Ok(false);
        };
        let outcome = handler.offload_entry(entry, &mut self.offloaded, notifier);
        Ok(outcome == EntryOutcome::Notified)
    }

    /// Forget a dump that no longer exists.
    pub fn entry_removed(&mut self, category: DumpCategory, id: u32) -> bool {
        let removed = self.offloaded.remove(&(category, id));
        if removed {
            debug!(
                self.log, "offloaded dump removed";
                "category" => %category,
                "dump_id" => id,
            );
        }
        removed
    }

    fn check_management_mode(&mut self) -> Result<(), Shutdown> {
        match read_management_mode(&self.store) {
            Ok(ManagementMode::Standalone) => Ok(()),
            Ok(ManagementMode::HmcManaged) => {
                info!(self.log, "system became HMC managed; not offloading");
                self.state = OffloadState::BlockedHmc;
                Err(Shutdown::HmcManaged)
            }
            Err(err) => {
                error!(self.log, "cannot determine management mode"; &err);
                Err(Shutdown::from(err))
            }
        }
    }

    fn sweep(&mut self) -> Result<SweepSummary, Shutdown> {
        self.check_management_mode()?;

        let mut summary = SweepSummary::default();
        let entries = match self.entries.list_entries(None) {
            Ok(entries) => entries,
            Err(err) => {
                // Nothing was notified, so the next sweep starts over.
                warn!(self.log, "failed to enumerate dump entries"; &err);
                self.state = OffloadState::Done;
                return Ok(summary);
            }
        };

        let mut by_category: BTreeMap<DumpCategory, Vec<DumpEntry>> =
            BTreeMap::new();
        for entry in entries {
            by_category.entry(entry.category).or_default().push(entry);
        }

        if let Some(notifier) = self.notifier.as_mut() {
            for handler in &self.handlers {
                if let Some(entries) = by_category.get(&handler.category) {
                    handler.offload(
                        entries,
                        &mut self.offloaded,
                        notifier,
                        &mut summary,
                    );
                }
            }
        }

        info!(
            self.log, "offload sweep complete";
            "notified" => summary.notified,
            "failed" => summary.failed,
            "skipped" => summary.skipped,
        );
        self.state = OffloadState::Done;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::AttributeValue;
    use crate::bus::BiosAttribute;
    use crate::bus::BiosTable;
    use crate::bus::InMemoryBus;
    use crate::bus::PropertyValue;
    use crate::bus::BASE_BIOS_TABLE;
    use crate::bus::BIOS_CONFIG_INTERFACE;
    use crate::bus::BIOS_CONFIG_PATH;
    use crate::bus::BOOT_PROGRESS_INTERFACE;
    use crate::bus::BOOT_PROGRESS_PROPERTY;
    use crate::bus::HMC_MANAGED_ATTRIBUTE;
    use crate::bus::HOST_STATE_PATH;
    use crate::test_util::test_logger;
    use crate::test_util::FlakyEntries;
    use crate::test_util::FakeNotifier;
    use crate::CompletionStatus;
    use std::cell::Cell;

    type Coordinator = OffloadCoordinator<InMemoryBus, InMemoryBus, FakeNotifier>;

    fn set_hmc_managed(bus: &InMemoryBus, value: &str) {
        let mut table = BiosTable::new();
        table.insert(
            HMC_MANAGED_ATTRIBUTE.to_string(),
            BiosAttribute { current: AttributeValue::String(value.to_string()) },
        );
        bus.set_property(
            BIOS_CONFIG_PATH,
            BIOS_CONFIG_INTERFACE,
            BASE_BIOS_TABLE,
            PropertyValue::BiosTable(table),
        );
    }

    fn system(hmc: &str, boot: &str) -> InMemoryBus {
        let bus = InMemoryBus::default();
        set_hmc_managed(&bus, hmc);
        bus.set_property(
            HOST_STATE_PATH,
            BOOT_PROGRESS_INTERFACE,
            BOOT_PROGRESS_PROPERTY,
            PropertyValue::Str(format!(
                "xyz.openbmc_project.State.Boot.Progress.ProgressStages.{boot}"
            )),
        );
        bus
    }

    fn complete(category: DumpCategory, id: u32) -> DumpEntry {
        DumpEntry { id, category, size: 0x1000, status: CompletionStatus::Complete }
    }

    fn coordinator(bus: &InMemoryBus, notifier: &FakeNotifier) -> Coordinator {
        let notifier = notifier.clone();
        match OffloadCoordinator::new(
            bus.clone(),
            bus.clone(),
            move || notifier,
            &test_logger(),
        ) {
            Ok(coordinator) => coordinator,
            Err(shutdown) => panic!("unexpected shutdown {shutdown:?}"),
        }
    }

    #[test]
    fn first_qualifying_boot_progress_sweeps_once() {
        let bus = system("Disabled", "Unspecified");
        bus.insert_entry(complete(DumpCategory::Bmc, 1));
        let notifier = FakeNotifier::default();
        let mut coordinator = coordinator(&bus, &notifier);

        assert_eq!(coordinator.state(), OffloadState::WaitingForBoot);
        assert_eq!(coordinator.start().unwrap(), None);

        let mut sweeps = 0;
        for stage in [
            BootProgress::NotStarted,
            BootProgress::SystemInitComplete,
            BootProgress::OsStart,
            BootProgress::OsRunning,
        ] {
            if coordinator.on_boot_progress(&stage).unwrap().is_some() {
                sweeps += 1;
            }
        }

        assert_eq!(sweeps, 1);
        assert_eq!(bus.list_calls(), 1);
        assert_eq!(notifier.notified(), vec![(DumpCategory::Bmc, 1)]);
        assert_eq!(coordinator.state(), OffloadState::Done);
    }

    #[test]
    fn booted_host_is_swept_at_start() {
        let bus = system("Disabled", "OSRunning");
        bus.insert_entry(complete(DumpCategory::System, 0x3000_0001));
        let notifier = FakeNotifier::default();
        let mut coordinator = coordinator(&bus, &notifier);

        assert_eq!(coordinator.state(), OffloadState::Offloading);
        assert_eq!(coordinator.handler_count(), DumpCategory::ALL.len());
        let summary = coordinator.start().unwrap().unwrap();
        assert_eq!(summary.notified, 1);
        assert!(coordinator.is_offloaded(DumpCategory::System, 0x3000_0001));
    }

    #[test]
    fn one_failure_does_not_stop_the_sweep() {
        let bus = system("Disabled", "OSRunning");
        for id in 1..=3 {
            bus.insert_entry(complete(DumpCategory::Bmc, id));
        }
        let notifier = FakeNotifier::default();
        notifier.fail_for(DumpCategory::Bmc, 2);
        let mut coordinator = coordinator(&bus, &notifier);

        let summary = coordinator.start().unwrap().unwrap();
        assert_eq!(
            summary,
            SweepSummary { notified: 2, failed: 1, skipped: 0 }
        );
        assert!(coordinator.is_offloaded(DumpCategory::Bmc, 1));
        assert!(!coordinator.is_offloaded(DumpCategory::Bmc, 2));
        assert!(coordinator.is_offloaded(DumpCategory::Bmc, 3));

        // The next sweep retries only the failed entry.
        notifier.succeed_for(DumpCategory::Bmc, 2);
        let summary = coordinator.request_sweep().unwrap().unwrap();
        assert_eq!(
            summary,
            SweepSummary { notified: 1, failed: 0, skipped: 2 }
        );
        assert_eq!(
            notifier.notified(),
            vec![
                (DumpCategory::Bmc, 1),
                (DumpCategory::Bmc, 3),
                (DumpCategory::Bmc, 2)
            ]
        );
        assert_eq!(notifier.attempts(), 4);
    }

    #[test]
    fn hmc_managed_at_startup_never_offloads() {
        let bus = system("Enabled", "OSRunning");
        bus.insert_entry(complete(DumpCategory::Bmc, 1));
        let notifier = FakeNotifier::default();
        let built = Cell::new(false);

        let mut coordinator: Coordinator = match OffloadCoordinator::new(
            bus.clone(),
            bus.clone(),
            || {
                built.set(true);
                notifier.clone()
            },
            &test_logger(),
        ) {
            Ok(coordinator) => coordinator,
            Err(shutdown) => panic!("unexpected shutdown {shutdown:?}"),
        };

        assert_eq!(coordinator.state(), OffloadState::BlockedHmc);
        assert_eq!(coordinator.handler_count(), 0);
        assert!(!built.get());

        assert_eq!(coordinator.start().unwrap(), None);
        for stage in [BootProgress::SystemInitComplete, BootProgress::OsRunning]
        {
            assert_eq!(coordinator.on_boot_progress(&stage).unwrap(), None);
        }
        assert_eq!(coordinator.request_sweep().unwrap(), None);
        assert!(!coordinator.offload_ready(&complete(DumpCategory::Bmc, 1)).unwrap());

        assert_eq!(bus.list_calls(), 0);
        assert_eq!(notifier.attempts(), 0);
    }

    #[test]
    fn sweep_after_done_offloads_only_new_entries() {
        let bus = system("Disabled", "OSRunning");
        bus.insert_entry(complete(DumpCategory::Bmc, 1));
        let notifier = FakeNotifier::default();
        let mut coordinator = coordinator(&bus, &notifier);

        coordinator.start().unwrap();
        assert_eq!(coordinator.state(), OffloadState::Done);

        bus.insert_entry(complete(DumpCategory::Hostboot, 7));
        let summary = coordinator.request_sweep().unwrap().unwrap();
        assert_eq!(summary.notified, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            notifier.notified(),
            vec![(DumpCategory::Bmc, 1), (DumpCategory::Hostboot, 7)]
        );
        assert_eq!(coordinator.state(), OffloadState::Done);
    }

    #[test]
    fn becoming_hmc_managed_before_sweep_blocks() {
        let bus = system("Disabled", "Unspecified");
        bus.insert_entry(complete(DumpCategory::Bmc, 1));
        let notifier = FakeNotifier::default();
        let mut coordinator = coordinator(&bus, &notifier);

        set_hmc_managed(&bus, "Enabled");
        assert_eq!(
            coordinator.on_boot_progress(&BootProgress::OsStart),
            Err(Shutdown::HmcManaged)
        );
        assert_eq!(coordinator.state(), OffloadState::BlockedHmc);
        assert_eq!(bus.list_calls(), 0);
        assert_eq!(notifier.attempts(), 0);

        // Later boot progress cannot restart offload.
        assert_eq!(
            coordinator.on_boot_progress(&BootProgress::OsRunning),
            Ok(None)
        );
    }

    #[test]
    fn incomplete_and_empty_entries_are_skipped() {
        let bus = system("Disabled", "OSRunning");
        bus.insert_entry(DumpEntry {
            status: CompletionStatus::InProgress,
            ..complete(DumpCategory::Bmc, 1)
        });
        bus.insert_entry(DumpEntry { size: 0, ..complete(DumpCategory::Bmc, 2) });
        bus.insert_entry(complete(DumpCategory::Bmc, 3));
        let notifier = FakeNotifier::default();
        let mut coordinator = coordinator(&bus, &notifier);

        let summary = coordinator.start().unwrap().unwrap();
        assert_eq!(
            summary,
            SweepSummary { notified: 1, failed: 0, skipped: 2 }
        );
        assert_eq!(notifier.notified(), vec![(DumpCategory::Bmc, 3)]);
    }

    #[test]
    fn missing_management_mode_is_malformed() {
        let bus = InMemoryBus::default();
        let result: Result<Coordinator, _> = OffloadCoordinator::new(
            bus.clone(),
            bus.clone(),
            FakeNotifier::default,
            &test_logger(),
        );
        assert!(matches!(
            result.err(),
            Some(Shutdown::MalformedConfiguration(_))
        ));
    }

    #[test]
    fn ready_entries_are_offloaded_once() {
        let bus = system("Disabled", "Unspecified");
        let notifier = FakeNotifier::default();
        let mut coordinator = coordinator(&bus, &notifier);
        let entry = complete(DumpCategory::Sbe, 5);

        // Not booted yet; the entry waits for the boot sweep.
        assert_eq!(coordinator.offload_ready(&entry), Ok(false));
        assert_eq!(notifier.attempts(), 0);

        bus.insert_entry(entry.clone());
        coordinator.on_boot_progress(&BootProgress::OsRunning).unwrap();
        assert!(coordinator.is_offloaded(DumpCategory::Sbe, 5));

        // A duplicate ready event does not renotify.
        assert_eq!(coordinator.offload_ready(&entry), Ok(false));

        let fresh = complete(DumpCategory::Sbe, 6);
        assert_eq!(coordinator.offload_ready(&fresh), Ok(true));

        assert!(coordinator.entry_removed(DumpCategory::Sbe, 5));
        assert!(!coordinator.entry_removed(DumpCategory::Sbe, 5));
        assert!(!coordinator.is_offloaded(DumpCategory::Sbe, 5));
        assert_eq!(
            notifier.notified(),
            vec![(DumpCategory::Sbe, 5), (DumpCategory::Sbe, 6)]
        );
    }

    #[test]
    fn failed_listing_is_retried_by_next_sweep() {
        let bus = system("Disabled", "Unspecified");
        bus.insert_entry(complete(DumpCategory::Bmc, 1));
        let entries = FlakyEntries::new(&bus);
        let notifier = FakeNotifier::default();
        let mut coordinator = match OffloadCoordinator::new(
            bus.clone(),
            entries.clone(),
            {
                let notifier = notifier.clone();
                move || notifier
            },
            &test_logger(),
        ) {
            Ok(coordinator) => coordinator,
            Err(shutdown) => panic!("unexpected shutdown {shutdown:?}"),
        };

        entries.fail_next_lists(1);
        assert_eq!(
            coordinator.on_boot_progress(&BootProgress::OsRunning),
            Ok(Some(SweepSummary::default()))
        );
        assert_eq!(coordinator.state(), OffloadState::Done);
        assert!(!coordinator.is_offloaded(DumpCategory::Bmc, 1));
        assert_eq!(notifier.attempts(), 0);

        let summary = coordinator.request_sweep().unwrap().unwrap();
        assert_eq!(summary.notified, 1);
        assert_eq!(coordinator.state(), OffloadState::Done);
        assert!(coordinator.is_offloaded(DumpCategory::Bmc, 1));
        assert_eq!(notifier.notified(), vec![(DumpCategory::Bmc, 1)]);
    }
}
