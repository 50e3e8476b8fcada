// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fakes shared by the unit tests in this crate.

use crate::bus::EntrySource;
use crate::bus::InMemoryBus;
use crate::error::BusError;
use crate::error::NotifyError;
use crate::error::TransportError;
use crate::instance_id::DbAllocError;
use crate::instance_id::InstanceIdDb;
use crate::notifier::Notify;
use crate::transport::Demux;
use crate::transport::Transport;
use crate::DumpCategory;
use crate::DumpEntry;
use crate::Eid;
use slog::o;
use slog::Drain;
use slog::Logger;
use std::collections::BTreeSet;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::Mutex;

pub(crate) fn test_logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

#[derive(Debug, Default)]
struct DbState {
    outstanding: BTreeSet<(Eid, u8)>,
    fail_next: usize,
    hand_out_next: Option<u8>,
    alloc_calls: usize,
    free_failures: usize,
    destroy_calls: usize,
}

/// Instance id database handing out the lowest free id per terminus.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeDb {
    state: Arc<Mutex<DbState>>,
}

impl FakeDb {
    pub(crate) fn outstanding(&self, tid: Eid) -> usize {
        self.state
            .lock()
            .unwrap()
            .outstanding
            .iter()
            .filter(|(t, _)| *t == tid)
            .count()
    }

    /// Report exhaustion on the next `n` allocations.
    pub(crate) fn fail_next_allocs(&self, n: usize) {
        self.state.lock().unwrap().fail_next = n;
    }

    /// Return `id` from the next allocation, even if it is out of range.
    pub(crate) fn hand_out_next(&self, id: u8) {
        self.state.lock().unwrap().hand_out_next = Some(id);
    }

    pub(crate) fn alloc_calls(&self) -> usize {
        self.state.lock().unwrap().alloc_calls
    }

    pub(crate) fn free_failures(&self) -> usize {
        self.state.lock().unwrap().free_failures
    }

    pub(crate) fn destroy_calls(&self) -> usize {
        self.state.lock().unwrap().destroy_calls
    }
}

impl InstanceIdDb for FakeDb {
    fn alloc(&mut self, tid: Eid) -> Result<u8, DbAllocError> {
        let mut state = self.state.lock().unwrap();
        state.alloc_calls += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(DbAllocError::TryAgain);
        }
        if let Some(id) = state.hand_out_next.take() {
            state.outstanding.insert((tid, id));
            return Ok(id);
        }
        let id = (0..pldm_messages::InstanceId::COUNT as u8)
            .find(|id| !state.outstanding.contains(&(tid, *id)))
            .ok_or(DbAllocError::TryAgain)?;
        state.outstanding.insert((tid, id));
        Ok(id)
    }

    fn free(&mut self, tid: Eid, instance_id: u8) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.outstanding.remove(&(tid, instance_id)) {
            Ok(())
        } else {
            state.free_failures += 1;
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("instance id {instance_id} not allocated"),
            ))
        }
    }

    fn destroy(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().destroy_calls += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportFault {
    Init,
    MapTid,
    PollFd,
    Send,
    /// The backend accepted fewer bytes than it was given.
    ShortSend,
}

#[derive(Debug, Default)]
struct TransportState {
    faults: Vec<TransportFault>,
    init_calls: usize,
    destroy_calls: usize,
    live: usize,
    mappings: Vec<(Eid, Eid)>,
    sent: Vec<(Eid, Vec<u8>)>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub(crate) fn inject(&self, fault: TransportFault) {
        self.state.lock().unwrap().faults.push(fault);
    }

    pub(crate) fn clear_faults(&self) {
        self.state.lock().unwrap().faults.clear();
    }

    pub(crate) fn mappings(&self) -> Vec<(Eid, Eid)> {
        self.state.lock().unwrap().mappings.clone()
    }

    pub(crate) fn sent(&self) -> Vec<(Eid, Vec<u8>)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub(crate) fn live_demuxes(&self) -> usize {
        self.state.lock().unwrap().live
    }

    pub(crate) fn init_calls(&self) -> usize {
        self.state.lock().unwrap().init_calls
    }

    pub(crate) fn destroy_calls(&self) -> usize {
        self.state.lock().unwrap().destroy_calls
    }
}

fn injected(fault: TransportFault) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("injected {fault:?} fault"))
}

impl Transport for FakeTransport {
    type Demux = FakeDemux;

    fn init_demux(&mut self) -> io::Result<FakeDemux> {
        let mut state = self.state.lock().unwrap();
        state.init_calls += 1;
        if state.faults.contains(&TransportFault::Init) {
            return Err(injected(TransportFault::Init));
        }
        state.live += 1;
        Ok(FakeDemux { state: Arc::clone(&self.state) })
    }
}

#[derive(Debug)]
pub(crate) struct FakeDemux {
    state: Arc<Mutex<TransportState>>,
}

impl Demux for FakeDemux {
    fn map_tid(&mut self, tid: Eid, eid: Eid) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.faults.contains(&TransportFault::MapTid) {
            return Err(injected(TransportFault::MapTid));
        }
        state.mappings.push((tid, eid));
        Ok(())
    }

    fn pollfd(&self) -> io::Result<RawFd> {
        let state = self.state.lock().unwrap();
        if state.faults.contains(&TransportFault::PollFd) {
            return Err(injected(TransportFault::PollFd));
        }
        Ok(3)
    }

    fn send_msg(&mut self, tid: Eid, msg: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.faults.contains(&TransportFault::Send) {
            return Err(injected(TransportFault::Send));
        }
        if state.faults.contains(&TransportFault::ShortSend) {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("sent {} of {} bytes", msg.len() / 2, msg.len()),
            ));
        }
        state.sent.push((tid, msg.to_vec()));
        Ok(())
    }

    fn destroy(self) {
        let mut state = self.state.lock().unwrap();
        state.live -= 1;
        state.destroy_calls += 1;
    }
}

#[derive(Debug, Default)]
struct NotifierState {
    fail_ids: BTreeSet<(DumpCategory, u32)>,
    notified: Vec<(DumpCategory, u32)>,
    attempts: usize,
}

/// Records notifications; fails for the entries it is told to.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeNotifier {
    state: Arc<Mutex<NotifierState>>,
}

impl FakeNotifier {
    pub(crate) fn fail_for(&self, category: DumpCategory, id: u32) {
        self.state.lock().unwrap().fail_ids.insert((category, id));
    }

    pub(crate) fn succeed_for(&self, category: DumpCategory, id: u32) {
        self.state.lock().unwrap().fail_ids.remove(&(category, id));
    }

    /// Entries successfully notified, in order.
    pub(crate) fn notified(&self) -> Vec<(DumpCategory, u32)> {
        self.state.lock().unwrap().notified.clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }
}

impl Notify for FakeNotifier {
    fn notify(&mut self, entry: &DumpEntry) -> Result<(), NotifyError> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if state.fail_ids.contains(&entry.key()) {
            return Err(NotifyError::SendFailed {
                id: entry.id,
                err: TransportError::Send {
                    tid: Eid(9),
                    len: 17,
                    err: io::Error::new(io::ErrorKind::Other, "injected"),
                },
            });
        }
        state.notified.push(entry.key());
        Ok(())
    }
}

/// Entry listing backed by an [`InMemoryBus`] that can be made to fail.
#[derive(Debug, Clone)]
pub(crate) struct FlakyEntries {
    bus: InMemoryBus,
    fail_next: Arc<Mutex<usize>>,
}

impl FlakyEntries {
    pub(crate) fn new(bus: &InMemoryBus) -> Self {
        Self { bus: bus.clone(), fail_next: Arc::default() }
    }

    pub(crate) fn fail_next_lists(&self, n: usize) {
        *self.fail_next.lock().unwrap() = n;
    }
}

impl EntrySource for FlakyEntries {
    fn list_entries(
        &self,
        category: Option<DumpCategory>,
    ) -> Result<Vec<DumpEntry>, BusError> {
        let mut fail_next = self.fail_next.lock().unwrap();
        if *fail_next > 0 {
            *fail_next -= 1;
            return Err(BusError::Backend("dump manager not responding".into()));
        }
        self.bus.list_entries(category)
    }
}
