// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Offloads BMC and host dumps by telling the host, over PLDM, that a new
//! file is available for it to fetch.
//!
//! The pieces, from the wire up:
//!
//! * [`InstanceIdAllocator`] hands out PLDM instance ids from a shared
//!   [`InstanceIdDb`], retrying once when they are exhausted.
//! * [`TransportSession`] owns the single MCTP transport to the host.
//! * [`DumpNotifier`] sends one "new file available" request per dump,
//!   classifying it with [`classify_dump`].
//! * [`OffloadCoordinator`] gates offload on management mode and host boot
//!   progress and sweeps dump entries through the notifier.
//! * [`OffloadService`] drives the coordinator from bus subscriptions
//!   ([`HostWatches`], taken before the coordinator is built) and entry
//!   events until it returns a [`Shutdown`].

mod classify;
mod coordinator;
mod endpoint;
mod entry;
mod host_state;
mod instance_id;
mod mode_watch;
mod notifier;
mod service;
mod transport;

#[cfg(target_os = "linux")]
pub mod backend;
pub mod bus;
pub mod error;

#[cfg(test)]
mod test_util;

pub use classify::classify_dump;
pub use coordinator::OffloadCoordinator;
pub use coordinator::OffloadHandler;
pub use coordinator::OffloadState;
pub use coordinator::SweepSummary;
pub use endpoint::read_host_eid;
pub use endpoint::Eid;
pub use endpoint::DEFAULT_HOST_EID_PATH;
pub use entry::CompletionStatus;
pub use entry::DumpCategory;
pub use entry::DumpEntry;
pub use error::Shutdown;
pub use error::UnknownDumpCategory;
pub use host_state::management_mode_from_table;
pub use host_state::read_boot_progress;
pub use host_state::read_management_mode;
pub use host_state::BootProgress;
pub use host_state::ManagementMode;
pub use instance_id::DbAllocError;
pub use instance_id::InstanceIdAllocator;
pub use instance_id::InstanceIdDb;
pub use instance_id::DEFAULT_ALLOC_RETRY_DELAY;
pub use mode_watch::ManagementModeWatch;
pub use notifier::DumpNotifier;
pub use notifier::NotifierConfig;
pub use notifier::Notify;
pub use notifier::DEFAULT_HOST_EID;
pub use service::HostWatches;
pub use service::OffloadEvent;
pub use service::OffloadService;
pub use transport::Demux;
pub use transport::Transport;
pub use transport::TransportHandle;
pub use transport::TransportSession;

pub use pldm_messages::FileType;
