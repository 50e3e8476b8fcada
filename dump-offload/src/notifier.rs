// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sends "new file available" notifications for dumps.

use crate::classify_dump;
use crate::error::EncodingError;
use crate::error::NotifyError;
use crate::instance_id::InstanceIdAllocator;
use crate::instance_id::InstanceIdDb;
use crate::instance_id::DEFAULT_ALLOC_RETRY_DELAY;
use crate::transport::Transport;
use crate::transport::TransportSession;
use crate::DumpEntry;
use crate::Eid;
use pldm_messages::encode_new_file_available;
use pldm_messages::FileType;
use pldm_messages::NewFileAvailableRequest;
use slog::error;
use slog::info;
use slog::o;
use slog::Logger;
use std::time::Duration;

/// Default MCTP endpoint id of the host, used when the platform does not
/// record one.
pub const DEFAULT_HOST_EID: Eid = Eid(9);

#[derive(Debug, Clone, Copy)]
pub struct NotifierConfig {
    /// Endpoint (and terminus) id of the host.
    pub endpoint: Eid,
    /// Delay before retrying an instance id allocation that found the
    /// database full.
    pub alloc_retry_delay: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_HOST_EID,
            alloc_retry_delay: DEFAULT_ALLOC_RETRY_DELAY,
        }
    }
}

/// Something that can tell the host a dump is ready.
pub trait Notify {
    fn notify(&mut self, entry: &DumpEntry) -> Result<(), NotifyError>;
}

impl<N: Notify + ?Sized> Notify for Box<N> {
    fn notify(&mut self, entry: &DumpEntry) -> Result<(), NotifyError> {
        (**self).notify(entry)
    }
}

/// Notifies the host about one dump per call, using one instance id and one
/// transport for the duration of that call.
///
/// Whatever step fails, `notify` returns with the instance id released and
/// the transport closed.
#[derive(Debug)]
pub struct DumpNotifier<D: InstanceIdDb, T: Transport> {
    endpoint: Eid,
    allocator: InstanceIdAllocator<D>,
    session: TransportSession<T>,
    log: Logger,
}

impl<D: InstanceIdDb, T: Transport> DumpNotifier<D, T> {
    pub fn new(
        endpoint: Eid,
        allocator: InstanceIdAllocator<D>,
        session: TransportSession<T>,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!(
            "component" => "DumpNotifier",
            "eid" => endpoint.0,
        ));
        Self { endpoint, allocator, session, log }
    }

    /// Build a notifier whose instance id database is initialized by
    /// `init_db`.
    pub fn with_config<F, E>(
        config: NotifierConfig,
        init_db: F,
        transport: T,
        log: &Logger,
    ) -> Self
    where
        F: FnOnce() -> Result<D, E>,
        E: std::fmt::Display,
    {
        let allocator =
            InstanceIdAllocator::new(init_db, config.alloc_retry_delay, log);
        let session = TransportSession::new(transport, log);
        Self::new(config.endpoint, allocator, session, log)
    }

    pub fn endpoint(&self) -> Eid {
        self.endpoint
    }

    pub fn session(&self) -> &TransportSession<T> {
        &self.session
    }

    fn encode_and_send(
        &mut self,
        instance_id: u8,
        file_type: FileType,
        entry: &DumpEntry,
    ) -> Result<(), NotifyError> {
        let request = NewFileAvailableRequest {
            file_type,
            file_handle: entry.id,
            length: entry.size,
        };

        let mut buf = [0; pldm_messages::MAX_SERIALIZED_SIZE];
        let n = encode_new_file_available(instance_id, request, &mut buf)
            .map_err(|err| {
                error!(
                    self.log, "failed to encode new file request";
                    "dump_id" => entry.id,
                    "file_type" => %file_type,
                    "instance_id" => instance_id,
                    "err" => %err,
                );
                NotifyError::EncodingFailed {
                    id: entry.id,
                    err: EncodingError::Message(err),
                }
            })?;
        let msg = &buf[..n];

        let handle = self.session.open(self.endpoint).map_err(|err| {
            error!(
                self.log, "cannot open transport for new file request";
                "dump_id" => entry.id,
                &err,
            );
            NotifyError::TransportOpenFailed(err)
        })?;

        let result = self.session.send(&handle, msg).map_err(|err| {
            error!(
                self.log, "failed to send new file request";
                "dump_id" => entry.id,
                "file_type" => %file_type,
                &err,
            );
            NotifyError::SendFailed { id: entry.id, err }
        });
        self.session.close();
        result?;

        info!(
            self.log, "sent new file available";
            "dump_id" => entry.id,
            "size" => entry.size,
            "file_type" => %file_type,
            "instance_id" => instance_id,
            "msg" => hex::encode(msg),
        );
        Ok(())
    }
}

impl<D: InstanceIdDb, T: Transport> Notify for DumpNotifier<D, T> {
    fn notify(&mut self, entry: &DumpEntry) -> Result<(), NotifyError> {
        // Classify before touching any shared resource.
        let file_type =
            classify_dump(entry.category, entry.id).map_err(|err| {
                error!(
                    self.log, "cannot classify dump";
                    "dump_id" => entry.id,
                    "category" => %entry.category,
                    &err,
                );
                NotifyError::EncodingFailed { id: entry.id, err: err.into() }
            })?;

        let instance_id = self.allocator.allocate(self.endpoint)?;
        let result = self.encode_and_send(instance_id, file_type, entry);
        self.allocator.release(self.endpoint, instance_id);
        result
    }
}
