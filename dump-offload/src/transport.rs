// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifetime management for the PLDM transport to the host.
//!
//! At most one demux transport is open at a time. Opening is a two stage
//! process (initialize the demux, then map the host's terminus id to its
//! endpoint id); if a later stage fails, earlier stages are unwound before
//! the error is returned so no partially-initialized transport survives.

use crate::error::TransportError;
use crate::Eid;
use slog::debug;
use slog::error;
use slog::o;
use slog::Logger;
use std::fmt;
use std::io;
use std::os::fd::RawFd;

/// Factory for demux transports.
pub trait Transport {
    type Demux: Demux;

    fn init_demux(&mut self) -> io::Result<Self::Demux>;
}

/// An initialized demux transport.
pub trait Demux {
    fn map_tid(&mut self, tid: Eid, eid: Eid) -> io::Result<()>;

    /// Descriptor an event loop can poll for responses.
    fn pollfd(&self) -> io::Result<RawFd>;

    /// Send `msg` to `tid`. Sending fewer than `msg.len()` bytes must be
    /// reported as an error.
    fn send_msg(&mut self, tid: Eid, msg: &[u8]) -> io::Result<()>;

    fn destroy(self);
}

/// Identifies the currently-open transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHandle {
    tid: Eid,
    pollfd: RawFd,
}

impl TransportHandle {
    pub fn tid(&self) -> Eid {
        self.tid
    }

    pub fn pollfd(&self) -> RawFd {
        self.pollfd
    }
}

struct Live<D> {
    handle: TransportHandle,
    demux: D,
}

pub struct TransportSession<T: Transport> {
    transport: T,
    live: Option<Live<T::Demux>>,
    log: Logger,
}

impl<T: Transport> fmt::Debug for TransportSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("open", &self.live.as_ref().map(|live| live.handle))
            .finish()
    }
}

impl<T: Transport> TransportSession<T> {
    pub fn new(transport: T, log: &Logger) -> Self {
        Self {
            transport,
            live: None,
            log: log.new(o!("component" => "TransportSession")),
        }
    }

    pub fn is_open(&self) -> bool {
        self.live.is_some()
    }

    /// Open a transport to `eid`.
    ///
    /// Fails with [`TransportError::AlreadyOpen`] without touching the
    /// backend if a transport is already open; callers must treat that as
    /// "busy", not reuse the existing transport.
    pub fn open(&mut self, eid: Eid) -> Result<TransportHandle, TransportError> {
        if self.live.is_some() {
            error!(self.log, "transport already open"; "eid" => eid.0);
            return Err(TransportError::AlreadyOpen);
        }

        let mut demux = self.transport.init_demux().map_err(|err| {
            error!(
                self.log, "failed to init MCTP demux transport";
                "err" => %err,
            );
            TransportError::TransportInitFailed(err)
        })?;

        if let Err(err) = demux.map_tid(eid, eid) {
            error!(
                self.log, "failed to set up TID to EID mapping";
                "eid" => eid.0,
                "err" => %err,
            );
            demux.destroy();
            return Err(TransportError::EndpointMappingFailed { eid, err });
        }

        let pollfd = match demux.pollfd() {
            Ok(fd) => fd,
            Err(err) => {
                error!(self.log, "failed to get pollfd"; "err" => %err);
                demux.destroy();
                return Err(TransportError::TransportInitFailed(err));
            }
        };

        let handle = TransportHandle { tid: eid, pollfd };
        debug!(
            self.log, "opened transport";
            "tid" => eid.0,
            "pollfd" => pollfd,
        );
        self.live = Some(Live { handle, demux });
        Ok(handle)
    }

    pub fn send(
        &mut self,
        handle: &TransportHandle,
        msg: &[u8],
    ) -> Result<(), TransportError> {
        let live = match &mut self.live {
            Some(live) if live.handle == *handle => live,
            _ => return Err(TransportError::NotOpen { tid: handle.tid }),
        };
        live.demux.send_msg(handle.tid, msg).map_err(|err| {
            TransportError::Send { tid: handle.tid, len: msg.len(), err }
        })
    }

    /// Close the open transport, if any. Closing a session that is not open
    /// is a no-op.
    pub fn close(&mut self) {
        if let Some(live) = self.live.take() {
            debug!(self.log, "closing transport"; "tid" => live.handle.tid.0);
            live.demux.destroy();
        }
    }
}

impl<T: Transport> Drop for TransportSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}
