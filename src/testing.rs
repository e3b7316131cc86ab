//! In-memory [`KmsDevice`] for tests.
//!
//! Lease descriptors handed out by [`FakeDevice`] are one end of a Unix socket
//! pair. The device keeps the other end, so tests can make a lease descriptor
//! readable with [`FakeDevice::notify`] and observe it being closed with
//! [`is_closed`].

use std::{
    collections::HashMap,
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::Path,
    sync::Mutex,
    time::Duration,
};

use dlmclient::protocol::{self, FdReply, Opcode};
use rustix::{
    event::{poll, PollFd, PollFlags},
    io::Errno,
    net::{
        connect_unix, recv, socket_with, socketpair, AddressFamily, RecvFlags, SocketAddrUnix,
        SocketFlags, SocketType,
    },
};

use crate::{
    device::{
        ConnectorInfo, CrtcMask, DeviceResources, EncoderInfo, KmsDevice, ObjectId, PlaneInfo,
    },
    lease::LeaseHandle,
};

pub fn lease_handle(index: usize) -> LeaseHandle {
    LeaseHandle(index)
}

/// Builds a [`DeviceResources`] with one encoder per connector.
///
/// CRTC ids start at 100, connectors at 200, encoders at 300, planes at 400.
#[derive(Debug, Default)]
pub struct Topology {
    resources: DeviceResources,
}

impl Topology {
    pub fn new(crtcs: usize) -> Self {
        Self {
            resources: DeviceResources {
                crtcs: (0..crtcs as u32).map(|i| 100 + i).collect(),
                ..Default::default()
            },
        }
    }

    /// Adds a connector whose encoder can drive `possible_crtcs`, currently
    /// driving the CRTC at `active` if set.
    pub fn connector(mut self, kind: u32, possible_crtcs: CrtcMask, active: Option<usize>) -> Self {
        let n = self.resources.connectors.len() as u32;
        let kind_index = self
            .resources
            .connectors
            .iter()
            .filter(|connector| connector.kind == kind)
            .count() as u32
            + 1;
        let crtc = active.map(|index| self.resources.crtcs[index]);

        self.resources.encoders.push(EncoderInfo {
            id: 300 + n,
            crtc,
            possible_crtcs,
        });
        self.resources.connectors.push(ConnectorInfo {
            id: 200 + n,
            kind,
            kind_index,
            current_encoder: crtc.map(|_| 300 + n),
            encoders: vec![300 + n],
        });
        self
    }

    pub fn plane(mut self, possible_crtcs: CrtcMask) -> Self {
        let id = 400 + self.resources.planes.len() as u32;
        self.resources.planes.push(PlaneInfo { id, possible_crtcs });
        self
    }

    pub fn build(self) -> DeviceResources {
        self.resources
    }
}

#[derive(Debug, Default)]
struct FakeState {
    next_lessee: u32,
    /// Objects held by each lessee that was not revoked.
    active: HashMap<u32, Vec<ObjectId>>,
    /// Device side of every lease descriptor ever created.
    peers: HashMap<u32, OwnedFd>,
    framebuffers: HashMap<ObjectId, u32>,
    fail_create: bool,
    fail_revoke: bool,
    fail_framebuffer: bool,
}

#[derive(Debug)]
pub struct FakeDevice {
    minor: u32,
    resources: DeviceResources,
    state: Mutex<FakeState>,
}

impl FakeDevice {
    pub fn new(minor: u32, resources: DeviceResources) -> Self {
        Self {
            minor,
            resources,
            state: Mutex::new(FakeState {
                next_lessee: 1,
                ..Default::default()
            }),
        }
    }

    /// Makes every following `create_lease` fail until reset.
    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    /// Makes every following `revoke_lease` fail with `EIO` until reset.
    pub fn fail_revoke(&self, fail: bool) {
        self.state.lock().unwrap().fail_revoke = fail;
    }

    /// Makes every following `crtc_framebuffer` fail with `EIO` until reset.
    pub fn fail_framebuffer(&self, fail: bool) {
        self.state.lock().unwrap().fail_framebuffer = fail;
    }

    pub fn set_framebuffer(&self, crtc: ObjectId, fb: u32) {
        self.state.lock().unwrap().framebuffers.insert(crtc, fb);
    }

    /// Makes the descriptor of `lessee` readable, like a pending DRM event.
    pub fn notify(&self, lessee: u32) {
        let state = self.state.lock().unwrap();
        let peer = state.peers.get(&lessee).expect("unknown lessee");
        rustix::io::write(peer, &[1]).unwrap();
    }

    /// Device side of the descriptor handed out for `lessee`.
    pub fn peer(&self, lessee: u32) -> OwnedFd {
        let state = self.state.lock().unwrap();
        state.peers[&lessee].try_clone().unwrap()
    }

    pub fn is_active(&self, lessee: u32) -> bool {
        self.state.lock().unwrap().active.contains_key(&lessee)
    }

    pub fn active_lessees(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }
}

impl KmsDevice for FakeDevice {
    fn minor(&self) -> u32 {
        self.minor
    }

    fn resources(&self) -> io::Result<DeviceResources> {
        Ok(self.resources.clone())
    }

    fn create_lease(&self, objects: &[ObjectId]) -> io::Result<(u32, OwnedFd)> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(Errno::INVAL.into());
        }
        let busy = state
            .active
            .values()
            .flatten()
            .any(|held| objects.contains(held));
        if busy {
            return Err(Errno::BUSY.into());
        }

        let (lease, peer) = socketpair(
            AddressFamily::UNIX,
            SocketType::STREAM,
            SocketFlags::CLOEXEC,
            None,
        )?;
        let lessee = state.next_lessee;
        state.next_lessee += 1;
        state.active.insert(lessee, objects.to_vec());
        state.peers.insert(lessee, peer);
        Ok((lessee, lease))
    }

    fn revoke_lease(&self, lessee_id: u32) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_revoke {
            return Err(Errno::IO.into());
        }
        match state.active.remove(&lessee_id) {
            Some(_) => Ok(()),
            None => Err(Errno::NOENT.into()),
        }
    }

    fn crtc_framebuffer(&self, lease_fd: BorrowedFd<'_>, crtc: ObjectId) -> io::Result<u32> {
        // Drains the notification. A real DRM fd keeps page-flip events
        // queued until the client reads them, so POLLIN stays set there.
        let mut buf = [0u8; 16];
        match recv(lease_fd, &mut buf, RecvFlags::DONTWAIT) {
            Ok(_) | Err(Errno::AGAIN) => {}
            Err(err) => return Err(err.into()),
        }
        let state = self.state.lock().unwrap();
        if state.fail_framebuffer {
            return Err(Errno::IO.into());
        }
        Ok(state.framebuffers.get(&crtc).copied().unwrap_or(0))
    }
}

/// Whether the other end of `peer` has been closed, waiting up to `timeout`.
pub fn is_closed(peer: &OwnedFd, timeout: Duration) -> bool {
    let mut fds = [PollFd::new(peer, PollFlags::IN)];
    loop {
        match poll(&mut fds, timeout.as_millis() as i32) {
            Ok(0) => return false,
            Ok(_) => return fds[0].revents().contains(PollFlags::HUP),
            Err(Errno::INTR) => continue,
            Err(err) => panic!("poll failed: {err}"),
        }
    }
}

/// Blocking lease client speaking the raw protocol.
#[derive(Debug)]
pub struct TestClient(OwnedFd);

impl TestClient {
    pub fn connect(path: &Path) -> Self {
        let socket = socket_with(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::CLOEXEC,
            None,
        )
        .unwrap();
        connect_unix(&socket, &SocketAddrUnix::new(path).unwrap()).unwrap();
        Self(socket)
    }

    pub fn send(&self, opcode: Opcode) {
        protocol::send_opcode(self.0.as_fd(), opcode).unwrap();
    }

    /// Only call once the server has answered, this blocks otherwise.
    pub fn recv_fd(&self) -> FdReply {
        protocol::recv_fd(self.0.as_fd()).unwrap()
    }

    pub fn socket(&self) -> &OwnedFd {
        &self.0
    }
}
