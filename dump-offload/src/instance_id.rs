// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PLDM instance id allocation.
//!
//! Instance ids are a scarce, system-wide resource: every PLDM requester on
//! the BMC shares the same 32 ids per terminus through a common database.
//! An id that is allocated and never freed is lost to every requester until
//! the database is reset, so callers must release every id they allocate.

use crate::error::AllocError;
use crate::Eid;
use slog::debug;
use slog::error;
use slog::o;
use slog::warn;
use slog::Logger;
use std::fmt;
use std::io;
use std::thread;
use std::time::Duration;

/// Delay before our single retry when the database is momentarily full.
pub const DEFAULT_ALLOC_RETRY_DELAY: Duration = Duration::from_millis(100);

// One initial attempt plus one retry.
const MAX_ALLOC_ATTEMPTS: usize = 2;

#[derive(Debug)]
pub enum DbAllocError {
    /// Every id for the terminus is currently in use.
    TryAgain,
    Other(io::Error),
}

/// Backing store for instance ids.
pub trait InstanceIdDb {
    fn alloc(&mut self, tid: Eid) -> Result<u8, DbAllocError>;

    fn free(&mut self, tid: Eid, instance_id: u8) -> io::Result<()>;

    /// Tear down the database handle. Called exactly once.
    fn destroy(&mut self) -> io::Result<()>;
}

/// Allocates instance ids with one bounded retry on exhaustion.
///
/// The database is initialized once, when the allocator is constructed, and
/// destroyed when the allocator is dropped. If initialization fails, every
/// allocation fails with [`AllocError::BackendUnavailable`].
pub struct InstanceIdAllocator<D: InstanceIdDb> {
    db: Result<D, String>,
    retry_delay: Duration,
    log: Logger,
}

impl<D: InstanceIdDb> fmt::Debug for InstanceIdAllocator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceIdAllocator")
            .field("available", &self.db.is_ok())
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

impl<D: InstanceIdDb> InstanceIdAllocator<D> {
    pub fn new<F, E>(init: F, retry_delay: Duration, log: &Logger) -> Self
    where
        F: FnOnce() -> Result<D, E>,
        E: fmt::Display,
    {
        let log = log.new(o!("component" => "InstanceIdAllocator"));
        let db = init().map_err(|err| {
            error!(
                log, "failed to initialize instance id database";
                "err" => %err,
            );
            err.to_string()
        });
        Self { db, retry_delay, log }
    }

    pub fn is_available(&self) -> bool {
        self.db.is_ok()
    }

    /// Allocate an instance id for `tid`.
    ///
    /// If the database reports that every id is in use, we wait
    /// `retry_delay` and try exactly once more. The wait blocks the calling
    /// thread.
    pub fn allocate(&mut self, tid: Eid) -> Result<u8, AllocError> {
        let db = match &mut self.db {
            Ok(db) => db,
            Err(reason) => {
                return Err(AllocError::BackendUnavailable {
                    reason: reason.clone(),
                })
            }
        };

        for attempt in 1..=MAX_ALLOC_ATTEMPTS {
            match db.alloc(tid) {
                Ok(instance_id) => {
                    debug!(
                        self.log, "allocated instance id";
                        "tid" => tid.0,
                        "instance_id" => instance_id,
                        "attempt" => attempt,
                    );
                    return Ok(instance_id);
                }
                Err(DbAllocError::TryAgain) => {
                    warn!(
                        self.log, "instance ids exhausted";
                        "tid" => tid.0,
                        "attempt" => attempt,
                    );
                    if attempt < MAX_ALLOC_ATTEMPTS {
                        thread::sleep(self.retry_delay);
                    }
                }
                Err(DbAllocError::Other(err)) => {
                    error!(
                        self.log, "failed to allocate instance id";
                        "tid" => tid.0,
                        "err" => %err,
                    );
                    return Err(AllocError::BackendUnavailable {
                        reason: err.to_string(),
                    });
                }
            }
        }

        Err(AllocError::ResourceExhausted { tid, attempts: MAX_ALLOC_ATTEMPTS })
    }

    /// Return `instance_id` to the database.
    ///
    /// Failures are logged and otherwise ignored: the caller's operation
    /// already succeeded or failed on its own terms.
    pub fn release(&mut self, tid: Eid, instance_id: u8) {
        let Ok(db) = &mut self.db else {
            return;
        };
        match db.free(tid, instance_id) {
            Ok(()) => debug!(
                self.log, "freed instance id";
                "tid" => tid.0,
                "instance_id" => instance_id,
            ),
            Err(err) => error!(
                self.log, "failed to free instance id";
                "tid" => tid.0,
                "instance_id" => instance_id,
                "err" => %err,
            ),
        }
    }
}

impl<D: InstanceIdDb> Drop for InstanceIdAllocator<D> {
    fn drop(&mut self) {
        if let Ok(db) = &mut self.db {
            if let Err(err) = db.destroy() {
                error!(
                    self.log, "failed to destroy instance id database";
                    "err" => %err,
                );
            }
        }
    }
}
