//! Unix socket front end of the lease manager.
//!
//! Each lease is served on its own `SOCK_SEQPACKET` socket (see
//! [`dlmclient::protocol`]). The server turns client traffic into [`Request`]s
//! and leaves the decisions to its caller: which client gets a descriptor and
//! which one is disconnected.
//!
//! Listening and client sockets are driven by tokio tasks that forward events
//! to the server over a channel. [`LeaseServer::next_request`] consumes that
//! channel, so requests come out in the order clients sent them.

use std::{
    collections::HashMap,
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::Path,
    sync::Arc,
};

use dlmclient::protocol::{self, Opcode};
use rustix::{
    io::Errno,
    net::{accept_with, shutdown, Shutdown, SocketFlags},
};
use tokio::{
    io::unix::AsyncFd,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::lease::LeaseHandle;

mod socket;

use socket::SocketFiles;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Socket path for lease {0} is too long")]
    PathTooLong(String),
    #[error("Lease {0} is already served by another process")]
    AlreadyServed(String),
    #[error("Failed to set up socket for lease {lease}: {source}")]
    Socket {
        lease: String,
        #[source]
        source: io::Error,
    },
    #[error("Unknown client")]
    UnknownClient,
    #[error("Failed to send lease fd: {0}")]
    Send(#[source] io::Error),
}

/// Identifies one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    GetLease,
    ReleaseLease,
    /// The client hung up.
    ClientDisconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub lease: LeaseHandle,
    pub client: ClientId,
}

#[derive(Debug)]
enum Event {
    Connected {
        lease: LeaseHandle,
        socket: OwnedFd,
    },
    Message {
        client: ClientId,
        kind: RequestKind,
    },
}

struct Client {
    lease: LeaseHandle,
    socket: Arc<AsyncFd<OwnedFd>>,
    reader: JoinHandle<()>,
}

pub struct LeaseServer {
    events: UnboundedReceiver<Event>,
    events_tx: UnboundedSender<Event>,
    clients: HashMap<ClientId, Client>,
    next_client: u64,
    acceptors: Vec<JoinHandle<()>>,
    _files: Vec<SocketFiles>,
}

impl LeaseServer {
    /// Listens for clients of every lease in `leases` inside `runtime_dir`.
    ///
    /// Must be called from within a tokio runtime. Fails if any of the leases
    /// can't be served.
    pub fn bind<'a>(
        runtime_dir: &Path,
        leases: impl IntoIterator<Item = (LeaseHandle, &'a str)>,
    ) -> Result<Self, ServerError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let mut server = Self {
            events,
            events_tx,
            clients: HashMap::new(),
            next_client: 0,
            acceptors: Vec::new(),
            _files: Vec::new(),
        };

        for (handle, name) in leases {
            let (files, listener) = socket::bind(runtime_dir, name)?;
            let listener = AsyncFd::new(listener).map_err(|source| ServerError::Socket {
                lease: name.to_string(),
                source,
            })?;
            info!(lease = name, path = %files.path().display(), "Serving lease");

            server._files.push(files);
            server.acceptors.push(tokio::spawn(accept_clients(
                handle,
                listener,
                server.events_tx.clone(),
            )));
        }

        Ok(server)
    }

    /// Waits for the next request of a connected client.
    pub async fn next_request(&mut self) -> Option<Request> {
        loop {
            match self.events.recv().await? {
                Event::Connected { lease, socket } => self.add_client(lease, socket),
                Event::Message { client, kind } => {
                    // Clients disconnected by the server may still have
                    // messages in flight.
                    let Some(state) = self.clients.get(&client) else {
                        continue;
                    };
                    return Some(Request {
                        kind,
                        lease: state.lease,
                        client,
                    });
                }
            }
        }
    }

    /// Passes `fd` to `client`.
    pub fn send_fd(&self, client: ClientId, fd: BorrowedFd<'_>) -> Result<(), ServerError> {
        let state = self
            .clients
            .get(&client)
            .ok_or(ServerError::UnknownClient)?;
        protocol::send_fd(state.socket.get_ref().as_fd(), fd)
            .map_err(|err| ServerError::Send(err.into()))
    }

    /// Closes the connection to `client`. Its pending requests are dropped.
    pub fn disconnect(&mut self, client: ClientId) {
        if let Some(state) = self.clients.remove(&client) {
            debug!(?client, "Disconnecting client");
            close_client(state);
        }
    }

    fn add_client(&mut self, lease: LeaseHandle, socket: OwnedFd) {
        let socket = match AsyncFd::new(socket) {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                warn!(?err, "Failed to register client socket");
                return;
            }
        };

        let client = ClientId(self.next_client);
        self.next_client += 1;
        debug!(?client, ?lease, "Client connected");

        let reader = tokio::spawn(read_client(
            client,
            Arc::clone(&socket),
            self.events_tx.clone(),
        ));
        self.clients.insert(
            client,
            Client {
                lease,
                socket,
                reader,
            },
        );
    }
}

impl Drop for LeaseServer {
    fn drop(&mut self) {
        for acceptor in &self.acceptors {
            acceptor.abort();
        }
        for (_, state) in self.clients.drain() {
            close_client(state);
        }
    }
}

fn close_client(client: Client) {
    client.reader.abort();
    // The reader task may hold the socket a little longer, make sure the peer
    // sees the hang-up now.
    if let Err(err) = shutdown(client.socket.get_ref(), Shutdown::ReadWrite) {
        if err != Errno::NOTCONN {
            debug!(?err, "Client socket shutdown failed");
        }
    }
}

async fn accept_clients(
    lease: LeaseHandle,
    listener: AsyncFd<OwnedFd>,
    events: UnboundedSender<Event>,
) {
    loop {
        let mut guard = match listener.readable().await {
            Ok(guard) => guard,
            Err(err) => {
                warn!(?lease, ?err, "Lease socket failed");
                return;
            }
        };

        let accepted = guard.try_io(|listener| {
            accept_with(
                listener.get_ref(),
                SocketFlags::CLOEXEC | SocketFlags::NONBLOCK,
            )
            .map_err(io::Error::from)
        });
        match accepted {
            Err(_would_block) => continue,
            Ok(Ok(socket)) => {
                if events.send(Event::Connected { lease, socket }).is_err() {
                    return;
                }
            }
            Ok(Err(err)) => warn!(?lease, ?err, "Failed to accept client"),
        }
    }
}

async fn read_client(
    client: ClientId,
    socket: Arc<AsyncFd<OwnedFd>>,
    events: UnboundedSender<Event>,
) {
    let kind = loop {
        let mut guard = match socket.readable().await {
            Ok(guard) => guard,
            Err(err) => {
                warn!(?client, ?err, "Client socket failed");
                break RequestKind::ClientDisconnect;
            }
        };

        let message = guard.try_io(|socket| {
            protocol::recv_opcode(socket.get_ref().as_fd()).map_err(io::Error::from)
        });
        match message {
            Err(_would_block) => continue,
            Ok(Ok(None)) => break RequestKind::ClientDisconnect,
            Ok(Ok(Some(Some(Opcode::GetLease)))) => {
                let _ = events.send(Event::Message {
                    client,
                    kind: RequestKind::GetLease,
                });
            }
            Ok(Ok(Some(Some(Opcode::ReleaseLease)))) => {
                let _ = events.send(Event::Message {
                    client,
                    kind: RequestKind::ReleaseLease,
                });
            }
            Ok(Ok(Some(None))) => warn!(?client, "Ignoring unknown client request"),
            Ok(Err(err)) => {
                debug!(?client, ?err, "Client receive error");
                break RequestKind::ClientDisconnect;
            }
        }
    };

    let _ = events.send(Event::Message { client, kind });
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        os::unix::net::UnixStream,
        path::PathBuf,
        time::Duration,
    };

    use dlmclient::{ClientError, DlmLease};
    use tokio::time::timeout;

    use super::*;
    use crate::testing::{lease_handle, TestClient};

    const WAIT: Duration = Duration::from_secs(5);

    fn server(dir: &Path, names: &[&str]) -> LeaseServer {
        LeaseServer::bind(
            dir,
            names
                .iter()
                .enumerate()
                .map(|(index, name)| (lease_handle(index), *name)),
        )
        .unwrap()
    }

    async fn next(server: &mut LeaseServer) -> Request {
        timeout(WAIT, server.next_request())
            .await
            .expect("no request")
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_lease_names_fail() {
        let dir = tempfile::tempdir().unwrap();
        let err = LeaseServer::bind(
            dir.path(),
            [(lease_handle(0), "lease"), (lease_handle(1), "lease")],
        )
        .err()
        .unwrap();
        assert!(matches!(err, ServerError::AlreadyServed(name) if name == "lease"));
    }

    #[tokio::test]
    async fn long_lease_names_fail() {
        let dir = tempfile::tempdir().unwrap();
        let name = "x".repeat(200);
        let err = LeaseServer::bind(dir.path(), [(lease_handle(0), name.as_str())])
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::PathTooLong(_)));
    }

    #[tokio::test]
    async fn socket_files_are_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease");
        let server = server(dir.path(), &["lease"]);
        assert!(path.exists());
        assert!(protocol::lock_path(&path).exists());

        drop(server);
        assert!(!path.exists());
        assert!(!protocol::lock_path(&path).exists());

        // The lease can be served again.
        let _server = self::server(dir.path(), &["lease"]);
    }

    #[tokio::test]
    async fn request_then_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server(dir.path(), &["first", "second"]);

        let client = TestClient::connect(&dir.path().join("second"));
        client.send(Opcode::GetLease);
        let request = next(&mut server).await;
        assert_eq!(request.kind, RequestKind::GetLease);
        assert_eq!(request.lease, lease_handle(1));

        client.send(Opcode::ReleaseLease);
        let release = next(&mut server).await;
        assert_eq!(release.kind, RequestKind::ReleaseLease);
        assert_eq!(release.client, request.client);
    }

    #[tokio::test]
    async fn early_hang_up_still_delivers_the_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server(dir.path(), &["lease"]);

        let client = TestClient::connect(&dir.path().join("lease"));
        client.send(Opcode::GetLease);
        drop(client);

        assert_eq!(next(&mut server).await.kind, RequestKind::GetLease);
        assert_eq!(next(&mut server).await.kind, RequestKind::ClientDisconnect);
    }

    #[tokio::test]
    async fn disconnected_clients_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease");
        let mut server = server(dir.path(), &["lease"]);

        // Switch between clients the way the daemon does with transfers.
        let keep_current = [false, true, true, false, true];
        let mut clients = Vec::new();
        let mut current = None;
        for keep in keep_current {
            let client = TestClient::connect(&path);
            client.send(Opcode::GetLease);
            clients.push(client);

            let request = next(&mut server).await;
            assert_eq!(request.kind, RequestKind::GetLease);
            match current {
                Some(_) if keep => server.disconnect(request.client),
                previous => {
                    if let Some(previous) = previous {
                        server.disconnect(previous);
                    }
                    current = Some(request.client);
                }
            }
        }

        drop(clients);
        let last = next(&mut server).await;
        assert_eq!(last.kind, RequestKind::ClientDisconnect);
        assert_eq!(Some(last.client), current);
        assert!(
            timeout(Duration::from_millis(100), server.next_request())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn client_library_receives_the_fd() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server(dir.path(), &["lease"]);
        let runtime_dir: PathBuf = dir.path().into();
        let client =
            tokio::task::spawn_blocking(move || DlmLease::get_in(&runtime_dir, "lease"));

        let request = next(&mut server).await;
        assert_eq!(request.kind, RequestKind::GetLease);
        let (mut ours, theirs) = UnixStream::pair().unwrap();
        server.send_fd(request.client, theirs.as_fd()).unwrap();

        let lease = client.await.unwrap().unwrap();
        let mut received = UnixStream::from(lease.fd().try_clone_to_owned().unwrap());
        received.write_all(b"y").unwrap();
        let mut byte = [0u8; 1];
        ours.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"y");

        drop(lease);
        assert_eq!(next(&mut server).await.kind, RequestKind::ReleaseLease);
        assert_eq!(next(&mut server).await.kind, RequestKind::ClientDisconnect);
    }

    #[tokio::test]
    async fn rejected_client_sees_hang_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server(dir.path(), &["lease"]);
        let runtime_dir: PathBuf = dir.path().into();
        let client =
            tokio::task::spawn_blocking(move || DlmLease::get_in(&runtime_dir, "lease"));

        let request = next(&mut server).await;
        server.disconnect(request.client);

        assert!(matches!(
            client.await.unwrap(),
            Err(ClientError::Rejected)
        ));
        let (_, theirs) = UnixStream::pair().unwrap();
        assert!(matches!(
            server.send_fd(request.client, theirs.as_fd()),
            Err(ServerError::UnknownClient)
        ));
    }
}
