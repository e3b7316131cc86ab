// Listening sockets and their lock files.

use std::{
    io,
    os::fd::OwnedFd,
    path::{Path, PathBuf},
};

use dlmclient::protocol::{lock_path, socket_path_in};
use rustix::{
    fs::{flock, open, unlink, FlockOperation, Mode, OFlags},
    io::Errno,
    net::{bind_unix, listen, socket_with, AddressFamily, SocketAddrUnix, SocketFlags, SocketType},
};
use tracing::debug;

use super::ServerError;

const BACKLOG: i32 = 8;

/// Socket and lock file of one lease, removed again on drop.
#[derive(Debug)]
pub(crate) struct SocketFiles {
    path: PathBuf,
    lock_path: PathBuf,
    _lock: OwnedFd,
}

impl Drop for SocketFiles {
    fn drop(&mut self) {
        for path in [&self.path, &self.lock_path] {
            if let Err(err) = unlink(path) {
                debug!(path = %path.display(), ?err, "Failed to remove socket file");
            }
        }
    }
}

impl SocketFiles {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates the listening socket for `lease` inside `dir`.
///
/// Fails if another process holds the lease's lock file.
pub(crate) fn bind(dir: &Path, lease: &str) -> Result<(SocketFiles, OwnedFd), ServerError> {
    let path =
        socket_path_in(dir, lease).ok_or_else(|| ServerError::PathTooLong(lease.to_string()))?;
    let lock_path = lock_path(&path);
    let socket_error = |source: io::Error| ServerError::Socket {
        lease: lease.to_string(),
        source,
    };

    let lock = open(
        &lock_path,
        OFlags::CREATE | OFlags::RDWR | OFlags::CLOEXEC,
        Mode::from_raw_mode(0o644),
    )
    .map_err(|err| socket_error(err.into()))?;
    match flock(&lock, FlockOperation::NonBlockingLockExclusive) {
        Ok(()) => {}
        Err(Errno::WOULDBLOCK) => return Err(ServerError::AlreadyServed(lease.to_string())),
        Err(err) => return Err(socket_error(err.into())),
    }

    // Left behind by a previous instance; the lock proves nobody serves it.
    match unlink(&path) {
        Ok(()) | Err(Errno::NOENT) => {}
        Err(err) => return Err(socket_error(err.into())),
    }

    let files = SocketFiles {
        path,
        lock_path,
        _lock: lock,
    };
    let listener = listen_on(&files.path).map_err(socket_error)?;
    Ok((files, listener))
}

fn listen_on(path: &Path) -> io::Result<OwnedFd> {
    let socket = socket_with(
        AddressFamily::UNIX,
        SocketType::SEQPACKET,
        SocketFlags::CLOEXEC | SocketFlags::NONBLOCK,
        None,
    )?;
    bind_unix(&socket, &SocketAddrUnix::new(path)?)?;
    listen(&socket, BACKLOG)?;
    Ok(socket)
}
