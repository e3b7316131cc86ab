//! Wire protocol shared by the lease server and its clients.
//!
//! Every lease is served on its own `SOCK_SEQPACKET` socket named after the
//! lease inside the runtime directory. A client message is a single
//! native-endian `u32` opcode. The server answers a lease request with a
//! one-byte message carrying the lease descriptor as `SCM_RIGHTS`, or by
//! hanging up when the request is refused.

use std::{
    env,
    ffi::OsString,
    io::{IoSlice, IoSliceMut},
    os::fd::{BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
};

use rustix::{
    io::Errno,
    net::{
        recv, recvmsg, send, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags,
        SendAncillaryBuffer, SendAncillaryMessage, SendFlags,
    },
};

/// Environment variable overriding the socket directory.
pub const RUNTIME_PATH_ENV: &str = "DLM_RUNTIME_PATH";
pub const DEFAULT_RUNTIME_PATH: &str = "/run/drm-lease-manager";

/// `sun_path` holds 108 bytes including the terminating NUL.
pub const MAX_SOCKET_PATH: usize = 107;

const FD_PAYLOAD: u8 = 0;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    GetLease = 0,
    ReleaseLease = 1,
}

impl Opcode {
    pub const SIZE: usize = std::mem::size_of::<u32>();

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        (self as u32).to_ne_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; Self::SIZE] = bytes.try_into().ok()?;
        match u32::from_ne_bytes(raw) {
            0 => Some(Opcode::GetLease),
            1 => Some(Opcode::ReleaseLease),
            _ => None,
        }
    }
}

/// Directory holding the lease sockets.
pub fn runtime_dir() -> PathBuf {
    env::var_os(RUNTIME_PATH_ENV)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_PATH))
}

/// Socket path for `lease_name`, or `None` if it would not fit in a
/// `sockaddr_un`.
pub fn socket_path_in(dir: &Path, lease_name: &str) -> Option<PathBuf> {
    let path = dir.join(lease_name);
    (path.as_os_str().len() <= MAX_SOCKET_PATH).then_some(path)
}

pub fn lock_path(socket_path: &Path) -> PathBuf {
    let mut path = OsString::from(socket_path.as_os_str());
    path.push(".lock");
    PathBuf::from(path)
}

pub fn send_opcode(socket: BorrowedFd<'_>, opcode: Opcode) -> Result<(), Errno> {
    let bytes = opcode.to_bytes();
    loop {
        match send(socket, &bytes, SendFlags::NOSIGNAL) {
            Err(Errno::INTR) => continue,
            Err(err) => return Err(err),
            Ok(_) => return Ok(()),
        }
    }
}

/// Reads one client message. `Ok(None)` means the peer hung up.
pub fn recv_opcode(socket: BorrowedFd<'_>) -> Result<Option<Option<Opcode>>, Errno> {
    let mut buf = [0u8; Opcode::SIZE + 1];
    let len = loop {
        match recv(socket, &mut buf, RecvFlags::empty()) {
            Err(Errno::INTR) => continue,
            other => break other?,
        }
    };
    if len == 0 {
        return Ok(None);
    }
    Ok(Some(Opcode::from_bytes(&buf[..len])))
}

/// Passes `fd` to the peer of `socket`.
pub fn send_fd(socket: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<(), Errno> {
    let fds = [fd];
    let mut space = [0u8; rustix::cmsg_space!(ScmRights(1))];
    let mut control = SendAncillaryBuffer::new(&mut space);
    if !control.push(SendAncillaryMessage::ScmRights(&fds)) {
        return Err(Errno::NOBUFS);
    }

    let payload = [FD_PAYLOAD];
    loop {
        match sendmsg(
            socket,
            &[IoSlice::new(&payload)],
            &mut control,
            SendFlags::NOSIGNAL,
        ) {
            Err(Errno::INTR) => continue,
            Err(err) => return Err(err),
            Ok(_) => return Ok(()),
        }
    }
}

/// Outcome of waiting for a lease descriptor.
#[derive(Debug)]
pub enum FdReply {
    Fd(OwnedFd),
    /// The server closed the connection without sending anything.
    HungUp,
    /// A message arrived without a descriptor attached.
    Unexpected,
}

pub fn recv_fd(socket: BorrowedFd<'_>) -> Result<FdReply, Errno> {
    let mut payload = [0u8; 1];
    let mut space = [0u8; rustix::cmsg_space!(ScmRights(1))];
    let mut control = RecvAncillaryBuffer::new(&mut space);

    let received = loop {
        match recvmsg(
            socket,
            &mut [IoSliceMut::new(&mut payload)],
            &mut control,
            RecvFlags::CMSG_CLOEXEC,
        ) {
            Err(Errno::INTR) => continue,
            other => break other?,
        }
    };

    let fd = control.drain().find_map(|message| match message {
        RecvAncillaryMessage::ScmRights(mut fds) => fds.next(),
        _ => None,
    });

    Ok(match fd {
        Some(fd) => FdReply::Fd(fd),
        None if received.bytes == 0 => FdReply::HungUp,
        None => FdReply::Unexpected,
    })
}
