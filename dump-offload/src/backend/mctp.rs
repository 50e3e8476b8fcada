// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::transport::Demux;
use crate::transport::Transport;
use crate::Eid;
use nix::libc;
use pldm_messages::MCTP_MSG_TYPE_PLDM;
use socket2::Domain;
use socket2::SockAddr;
use socket2::Socket;
use socket2::Type;
use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;

const AF_MCTP: libc::c_int = 45;
const MCTP_NET_ANY: u32 = 0;
const MCTP_TAG_OWNER: u8 = 0x08;

/// `struct sockaddr_mctp` from `linux/mctp.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SockaddrMctp {
    smctp_family: libc::sa_family_t,
    smctp_pad0: u16,
    smctp_network: u32,
    smctp_addr: u8,
    smctp_type: u8,
    smctp_tag: u8,
    smctp_pad1: u8,
}

static_assertions::const_assert_eq!(mem::size_of::<SockaddrMctp>(), 12);

fn request_addr(eid: Eid) -> SockAddr {
    let addr = SockaddrMctp {
        smctp_family: AF_MCTP as libc::sa_family_t,
        smctp_pad0: 0,
        smctp_network: MCTP_NET_ANY,
        smctp_addr: eid.0,
        smctp_type: MCTP_MSG_TYPE_PLDM,
        smctp_tag: MCTP_TAG_OWNER,
        smctp_pad1: 0,
    };

    // SAFETY: `sockaddr_storage` is plain old data and large enough to hold
    // a `SockaddrMctp`; the all-zero value is valid and we only write the
    // leading `size_of::<SockaddrMctp>()` bytes.
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        std::ptr::write(
            &mut storage as *mut libc::sockaddr_storage as *mut SockaddrMctp,
            addr,
        );
        SockAddr::new(
            storage,
            mem::size_of::<SockaddrMctp>() as libc::socklen_t,
        )
    }
}

/// Opens `AF_MCTP` datagram sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct MctpTransport;

impl Transport for MctpTransport {
    type Demux = MctpDemux;

    fn init_demux(&mut self) -> io::Result<MctpDemux> {
        let socket = Socket::new(Domain::from(AF_MCTP), Type::DGRAM, None)?;
        Ok(MctpDemux { socket, routes: BTreeMap::new() })
    }
}

/// An `AF_MCTP` socket plus the terminus id to endpoint id mapping used to
/// address sends.
#[derive(Debug)]
pub struct MctpDemux {
    socket: Socket,
    routes: BTreeMap<Eid, Eid>,
}

impl Demux for MctpDemux {
    fn map_tid(&mut self, tid: Eid, eid: Eid) -> io::Result<()> {
        self.routes.insert(tid, eid);
        Ok(())
    }

    fn pollfd(&self) -> io::Result<RawFd> {
        Ok(self.socket.as_raw_fd())
    }

    fn send_msg(&mut self, tid: Eid, msg: &[u8]) -> io::Result<()> {
        let eid = self.routes.get(&tid).copied().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no endpoint mapped for TID {tid}"),
            )
        })?;

        let n = self.socket.send_to(msg, &request_addr(eid))?;
        if n != msg.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("sent {n} of {} bytes", msg.len()),
            ));
        }
        Ok(())
    }

    fn destroy(self) {
        // Closing the socket is all there is to tear down.
        drop(self.socket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_address_layout() {
        let addr = request_addr(Eid(9));
        assert_eq!(addr.len() as usize, mem::size_of::<SockaddrMctp>());
        assert_eq!(addr.family(), AF_MCTP as libc::sa_family_t);

        // SAFETY: `request_addr` wrote a `SockaddrMctp` at the start of the
        // storage.
        let raw = unsafe { *(addr.as_ptr() as *const SockaddrMctp) };
        assert_eq!(raw.smctp_network, MCTP_NET_ANY);
        assert_eq!(raw.smctp_addr, 9);
        assert_eq!(raw.smctp_type, 0x01);
        assert_eq!(raw.smctp_tag, MCTP_TAG_OWNER);
    }
}
