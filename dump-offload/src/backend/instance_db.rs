// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::instance_id::DbAllocError;
use crate::instance_id::InstanceIdDb;
use crate::Eid;
use nix::errno::Errno;
use nix::fcntl::fcntl;
use nix::fcntl::FcntlArg;
use nix::libc;
use pldm_messages::InstanceId;
use std::collections::BTreeSet;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::path::Path;

/// Instance id database shared by every PLDM requester on the BMC.
pub const DEFAULT_INSTANCE_DB_PATH: &str =
    "/usr/share/libpldm/instance-db/default";

/// Instance ids backed by open-file-description locks on a shared file.
///
/// The file holds one byte per (terminus id, instance id) pair. Holding a
/// write lock on a byte means holding that id; because the locks belong to
/// the open file description, they are released if this process dies.
#[derive(Debug)]
pub struct FileInstanceDb {
    file: File,
    held: BTreeSet<(Eid, u8)>,
}

impl FileInstanceDb {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file, held: BTreeSet::new() })
    }

    fn set_lock(
        &self,
        tid: Eid,
        instance_id: u8,
        lock_type: libc::c_int,
    ) -> nix::Result<()> {
        // SAFETY: `flock` is plain old data; all-zero is a valid value.
        let mut lock: libc::flock = unsafe { mem::zeroed() };
        lock.l_type = lock_type as libc::c_short;
        lock.l_whence = libc::SEEK_SET as libc::c_short;
        lock.l_start = (usize::from(tid.0) * InstanceId::COUNT
            + usize::from(instance_id)) as libc::off_t;
        lock.l_len = 1;

        fcntl(self.file.as_raw_fd(), FcntlArg::F_OFD_SETLK(&lock)).map(drop)
    }
}

impl InstanceIdDb for FileInstanceDb {
    fn alloc(&mut self, tid: Eid) -> Result<u8, DbAllocError> {
        for instance_id in 0..=InstanceId::MAX {
            if self.held.contains(&(tid, instance_id)) {
                continue;
            }
            match self.set_lock(tid, instance_id, libc::F_WRLCK) {
                Ok(()) => {
                    self.held.insert((tid, instance_id));
                    return Ok(instance_id);
                }
                // Held by another requester.
                Err(Errno::EAGAIN | Errno::EACCES) => continue,
                Err(errno) => return Err(DbAllocError::Other(errno.into())),
            }
        }
        Err(DbAllocError::TryAgain)
    }

    fn free(&mut self, tid: Eid, instance_id: u8) -> io::Result<()> {
        if !self.held.remove(&(tid, instance_id)) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("instance id {instance_id} for TID {tid} is not held"),
            ));
        }
        self.set_lock(tid, instance_id, libc::F_UNLCK)?;
        Ok(())
    }

    fn destroy(&mut self) -> io::Result<()> {
        let held = mem::take(&mut self.held);
        for (tid, instance_id) in held {
            self.set_lock(tid, instance_id, libc::F_UNLCK)?;
        }
        Ok(())
    }
}
