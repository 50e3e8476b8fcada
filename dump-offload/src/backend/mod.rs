// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-backed implementations of the transport and instance id traits.

mod instance_db;
mod mctp;

pub use instance_db::FileInstanceDb;
pub use instance_db::DEFAULT_INSTANCE_DB_PATH;
pub use mctp::MctpDemux;
pub use mctp::MctpTransport;
