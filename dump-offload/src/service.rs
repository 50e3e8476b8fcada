// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event loop connecting bus subscriptions and entry events to the
//! [`OffloadCoordinator`].

use crate::bus::EntrySource;
use crate::bus::MatchRule;
use crate::bus::PropertiesChanged;
use crate::bus::PropertyStore;
use crate::bus::Subscribe;
use crate::bus::Subscription;
use crate::bus::BOOT_PROGRESS_INTERFACE;
use crate::bus::HOST_STATE_PATH;
use crate::coordinator::OffloadCoordinator;
use crate::coordinator::OffloadState;
use crate::error::Shutdown;
use crate::host_state::BootProgress;
use crate::mode_watch::ManagementModeWatch;
use crate::notifier::Notify;
use crate::DumpCategory;
use crate::DumpEntry;
use futures::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use tokio::sync::mpsc;

/// Events from the per-entry watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffloadEvent {
    /// A dump finished collection.
    DumpReady(DumpEntry),
    DumpRemoved { category: DumpCategory, id: u32 },
    /// Sweep all entries again.
    SweepRequested,
}

fn boot_progress_rule() -> MatchRule {
    MatchRule::properties_changed(HOST_STATE_PATH, BOOT_PROGRESS_INTERFACE)
}

async fn next_signal(
    subscription: &mut Option<Subscription>,
) -> Option<PropertiesChanged> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => futures::future::pending().await,
    }
}

/// The bus subscriptions an [`OffloadService`] consumes.
///
/// Take these before constructing the [`OffloadCoordinator`]: a change
/// that lands between the coordinator's startup reads and a later
/// subscription would never be seen.
#[derive(Debug)]
pub struct HostWatches {
    mode: Subscription,
    boot: Subscription,
}

impl HostWatches {
    pub fn subscribe<B: Subscribe>(bus: &B) -> Self {
        Self {
            mode: bus.subscribe(ManagementModeWatch::rule()),
            boot: bus.subscribe(boot_progress_rule()),
        }
    }
}

pub struct OffloadService<S, E, N> {
    coordinator: OffloadCoordinator<S, E, N>,
    watch: ManagementModeWatch,
    log: Logger,
}

impl<S, E, N> OffloadService<S, E, N>
where
    S: PropertyStore,
    E: EntrySource,
    N: Notify,
{
    pub fn new(coordinator: OffloadCoordinator<S, E, N>, log: &Logger) -> Self {
        let log = log.new(o!("component" => "OffloadService"));
        Self { coordinator, watch: ManagementModeWatch::new(&log), log }
    }

    pub fn coordinator(&self) -> &OffloadCoordinator<S, E, N> {
        &self.coordinator
    }

    /// Run until there is nothing left to do, returning why.
    ///
    /// Management mode changes are always handled before anything else
    /// that is pending. The boot progress subscription is dropped as soon
    /// as the coordinator stops waiting for boot.
    pub async fn run(
        &mut self,
        watches: HostWatches,
        events: mpsc::Receiver<OffloadEvent>,
    ) -> Shutdown {
        if self.coordinator.state() == OffloadState::BlockedHmc {
            return Shutdown::HmcManaged;
        }

        // Signals queued since `watches` was taken are replayed through
        // the loop below; the coordinator ignores boot progress it has
        // already moved past.
        let mut mode_changes = Some(watches.mode);
        let mut boot_changes = Some(watches.boot);
        let mut events = Some(events);

        if let Err(shutdown) = self.coordinator.start() {
            return shutdown;
        }

        loop {
            match self.coordinator.state() {
                OffloadState::BlockedHmc => return Shutdown::HmcManaged,
                OffloadState::WaitingForBoot => (),
                OffloadState::Offloading | OffloadState::Done => {
                    if boot_changes.take().is_some() {
                        debug!(self.log, "dropping boot progress watch");
                    }
                }
            }

            let result = tokio::select! {
                biased;

                signal = next_signal(&mut mode_changes),
                    if mode_changes.is_some() =>
                {
                    match signal {
                        Some(signal) => match self.watch.on_change(&signal) {
                            Some(shutdown) => Err(shutdown),
                            None => Ok(()),
                        },
                        None => {
                            warn!(self.log, "management mode watch closed");
                            mode_changes = None;
                            Ok(())
                        }
                    }
                }

                signal = next_signal(&mut boot_changes),
                    if boot_changes.is_some() =>
                {
                    match signal {
                        Some(signal) => match BootProgress::from_signal(&signal) {
                            Some(progress) => self
                                .coordinator
                                .on_boot_progress(&progress)
                                .map(|_| ()),
                            None => Ok(()),
                        },
                        None => {
                            warn!(self.log, "boot progress watch closed");
                            boot_changes = None;
                            Ok(())
                        }
                    }
                }

                event = async {
                    match &mut events {
                        Some(events) => events.recv().await,
                        None => futures::future::pending().await,
                    }
                }, if events.is_some() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            info!(self.log, "entry event source closed");
                            events = None;
                            Ok(())
                        }
                    }
                }

                else => Err(Shutdown::EventsClosed),
            };

            if let Err(shutdown) = result {
                info!(self.log, "offload service stopping"; "reason" => %shutdown);
                return shutdown;
            }
        }
    }

    fn handle_event(&mut self, event: OffloadEvent) -> Result<(), Shutdown> {
        debug!(self.log, "entry event"; "event" => ?event);
        match event {
            OffloadEvent::DumpReady(entry) => {
                self.coordinator.offload_ready(&entry)?;
            }
            OffloadEvent::DumpRemoved { category, id } => {
                self.coordinator.entry_removed(category, id);
            }
            OffloadEvent::SweepRequested => {
                self.coordinator.request_sweep()?;
            }
        }
        Ok(())
    }
}
