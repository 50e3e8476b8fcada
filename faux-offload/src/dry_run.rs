// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backends for `--dry-run`: nothing leaves the process.

use dump_offload::DbAllocError;
use dump_offload::Demux;
use dump_offload::Eid;
use dump_offload::InstanceIdDb;
use dump_offload::Transport;
use pldm_messages::InstanceId;
use pldm_messages::NewFileAvailable;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeSet;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::os::unix::net::UnixDatagram;

/// Instance ids tracked in this process only.
#[derive(Debug, Default)]
pub(crate) struct LocalInstanceDb {
    held: BTreeSet<(Eid, u8)>,
}

impl InstanceIdDb for LocalInstanceDb {
    fn alloc(&mut self, tid: Eid) -> Result<u8, DbAllocError> {
        let id = (0..=InstanceId::MAX)
            .find(|id| !self.held.contains(&(tid, *id)))
            .ok_or(DbAllocError::TryAgain)?;
        self.held.insert((tid, id));
        Ok(id)
    }

    fn free(&mut self, tid: Eid, instance_id: u8) -> io::Result<()> {
        if self.held.remove(&(tid, instance_id)) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("instance id {instance_id} for TID {tid} is not held"),
            ))
        }
    }

    fn destroy(&mut self) -> io::Result<()> {
        self.held.clear();
        Ok(())
    }
}

/// Transport that logs what it would have sent.
#[derive(Debug)]
pub(crate) struct DryRunTransport {
    log: Logger,
}

impl DryRunTransport {
    pub(crate) fn new(log: &Logger) -> Self {
        Self { log: log.new(o!("transport" => "dry-run")) }
    }
}

impl Transport for DryRunTransport {
    type Demux = DryRunDemux;

    fn init_demux(&mut self) -> io::Result<DryRunDemux> {
        Ok(DryRunDemux {
            log: self.log.clone(),
            tid: None,
            socket: UnixDatagram::unbound()?,
        })
    }
}

#[derive(Debug)]
pub(crate) struct DryRunDemux {
    log: Logger,
    tid: Option<Eid>,
    // Never receives anything; it only gives `pollfd` a descriptor that
    // belongs to this demux.
    socket: UnixDatagram,
}

impl Demux for DryRunDemux {
    fn map_tid(&mut self, tid: Eid, _eid: Eid) -> io::Result<()> {
        self.tid = Some(tid);
        Ok(())
    }

    fn pollfd(&self) -> io::Result<RawFd> {
        Ok(self.socket.as_raw_fd())
    }

    fn send_msg(&mut self, tid: Eid, msg: &[u8]) -> io::Result<()> {
        if self.tid != Some(tid) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no endpoint mapped for TID {tid}"),
            ));
        }

        match pldm_messages::deserialize::<NewFileAvailable>(msg) {
            Ok((message, _)) => info!(
                self.log, "would send";
                "tid" => tid.0,
                "instance_id" => message.header.instance_id().get(),
                "file_type" => %message.request.file_type,
                "file_handle" => message.request.file_handle,
                "length" => message.request.length,
                "msg" => hex::encode(msg),
            ),
            Err(err) => warn!(
                self.log, "would send undecodable message";
                "tid" => tid.0,
                "msg" => hex::encode(msg),
                "err" => ?err,
            ),
        }
        Ok(())
    }

    fn destroy(self) {}
}
