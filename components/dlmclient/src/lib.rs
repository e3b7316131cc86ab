//! Client side of the DRM lease manager.
//!
//! ```no_run
//! let lease = dlmclient::DlmLease::get("card0-HDMI-A-1")?;
//! let fd = lease.fd();
//! // drive the leased CRTC/connector/planes through `fd`
//! lease.release();
//! # Ok::<(), dlmclient::ClientError>(())
//! ```

use std::{
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
};

use rustix::{
    io::Errno,
    net::{connect_unix, socket_with, AddressFamily, SocketAddrUnix, SocketFlags, SocketType},
};
use tracing::debug;

pub mod protocol;

use protocol::{FdReply, Opcode};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Lease name {0:?} does not fit in a socket path")]
    NameTooLong(String),
    #[error("Socket creation failed: {0}")]
    Socket(io::Error),
    #[error("Cannot connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Socket data send error: {0}")]
    Send(io::Error),
    #[error("Lease request rejected by DRM lease manager")]
    Rejected,
    #[error("Unexpected data received from lease manager")]
    Protocol,
    #[error("Lease manager receive data error: {0}")]
    Receive(io::Error),
}

/// A lease obtained from the lease manager.
///
/// Dropping it tells the manager the lease is no longer needed.
#[derive(Debug)]
pub struct DlmLease {
    server: OwnedFd,
    lease_fd: OwnedFd,
}

impl DlmLease {
    /// Requests the lease called `name` from the manager serving
    /// [`protocol::runtime_dir`].
    pub fn get(name: &str) -> Result<Self, ClientError> {
        Self::get_in(&protocol::runtime_dir(), name)
    }

    pub fn get_in(runtime_dir: &Path, name: &str) -> Result<Self, ClientError> {
        let path = protocol::socket_path_in(runtime_dir, name)
            .ok_or_else(|| ClientError::NameTooLong(name.to_string()))?;
        let server = connect(&path)?;

        protocol::send_opcode(server.as_fd(), Opcode::GetLease)
            .map_err(|err| ClientError::Send(err.into()))?;

        match protocol::recv_fd(server.as_fd()) {
            Ok(FdReply::Fd(lease_fd)) => Ok(Self { server, lease_fd }),
            Ok(FdReply::HungUp) => {
                debug!(lease = name, "Lease request rejected by DRM lease manager");
                Err(ClientError::Rejected)
            }
            Ok(FdReply::Unexpected) => {
                debug!(lease = name, "Unexpected data received from lease manager");
                Err(ClientError::Protocol)
            }
            Err(err) => Err(ClientError::Receive(err.into())),
        }
    }

    /// The DRM lease descriptor.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.lease_fd.as_fd()
    }

    /// Hands the lease back. Same as dropping it.
    pub fn release(self) {}
}

impl Drop for DlmLease {
    fn drop(&mut self) {
        if let Err(err) = protocol::send_opcode(self.server.as_fd(), Opcode::ReleaseLease) {
            debug!(?err, "Failed to send lease release");
        }
    }
}

fn connect(path: &Path) -> Result<OwnedFd, ClientError> {
    let addr = SocketAddrUnix::new(path).map_err(|err| ClientError::Connect {
        path: path.to_path_buf(),
        source: err.into(),
    })?;
    let socket = socket_with(
        AddressFamily::UNIX,
        SocketType::SEQPACKET,
        SocketFlags::CLOEXEC,
        None,
    )
    .map_err(|err| ClientError::Socket(err.into()))?;

    loop {
        match connect_unix(&socket, &addr) {
            Err(Errno::INTR) => continue,
            Err(err) => {
                debug!(path = %path.display(), ?err, "Cannot connect to lease socket");
                return Err(ClientError::Connect {
                    path: path.to_path_buf(),
                    source: err.into(),
                });
            }
            Ok(()) => return Ok(socket),
        }
    }
}
