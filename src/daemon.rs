//! Policy between lease clients and the lease manager.
//!
//! A lease has at most one holder, the client whose descriptor request was
//! last fulfilled. It is kept in the lease's user data slot.

use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::{
    device::{DrmCard, KmsDevice},
    lease::{LeaseHandle, LeaseManager},
    server::{ClientId, LeaseServer, Request, RequestKind, ServerError},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonOptions {
    /// Hand a granted lease over to a new client instead of refusing it.
    pub allow_transfer: bool,
    /// Keep the lease descriptor open when its holder goes away without
    /// releasing it, so the last frame stays on screen.
    pub keep_on_crash: bool,
}

pub struct Daemon<D: KmsDevice = DrmCard> {
    manager: LeaseManager<D>,
    server: LeaseServer,
    options: DaemonOptions,
}

impl<D: KmsDevice> Daemon<D> {
    /// Serves every lease of `manager` in `runtime_dir`.
    pub fn new(
        manager: LeaseManager<D>,
        runtime_dir: &Path,
        options: DaemonOptions,
    ) -> Result<Self, ServerError> {
        let server = LeaseServer::bind(
            runtime_dir,
            manager.leases().map(|(handle, lease)| (handle, lease.name())),
        )?;
        Ok(Self {
            manager,
            server,
            options,
        })
    }

    pub fn manager(&self) -> &LeaseManager<D> {
        &self.manager
    }

    /// Handles client requests until the server stops producing them.
    pub async fn run(&mut self) {
        while let Some(request) = self.server.next_request().await {
            self.handle(request);
        }
    }

    pub fn handle(&mut self, request: Request) {
        debug!(?request, "Lease request");
        match request.kind {
            RequestKind::GetLease => self.get_lease(request.lease, request.client),
            RequestKind::ReleaseLease | RequestKind::ClientDisconnect => self.release_lease(request),
        }
    }

    fn get_lease(&mut self, handle: LeaseHandle, client: ClientId) {
        let name = self.lease_name(handle);
        let transfer = self.options.allow_transfer
            && self.manager.lease(handle).is_some_and(|lease| lease.is_granted());
        let granted = if transfer {
            debug!(lease = %name, "Lease is busy, transferring it");
            self.manager.transfer(handle)
        } else {
            self.manager.grant(handle)
        };
        let sent = match granted {
            Ok(fd) => self.server.send_fd(client, fd),
            Err(err) => {
                error!(lease = %name, %err, "Can't fulfill lease request");
                self.server.disconnect(client);
                return;
            }
        };

        let Some(lease) = self.manager.lease_mut(handle) else {
            return;
        };
        if let Some(previous) = lease
            .take_user_data::<ClientId>()
            .filter(|previous| *previous != client)
        {
            info!(lease = %name, ?previous, "Lease taken over by a new client");
            self.server.disconnect(previous);
        }

        match sent {
            Ok(()) => lease.set_user_data(client),
            Err(err) => {
                error!(lease = %name, %err, "Client communication error");
                self.server.disconnect(client);
                if let Err(err) = self.manager.revoke(handle) {
                    warn!(lease = %name, %err, "Failed to revoke lease");
                }
            }
        }
    }

    fn release_lease(&mut self, request: Request) {
        let name = self.lease_name(request.lease);
        self.server.disconnect(request.client);

        let Some(lease) = self.manager.lease_mut(request.lease) else {
            return;
        };
        if lease.user_data::<ClientId>() != Some(&request.client) {
            debug!(lease = %name, client = ?request.client, "Client did not hold the lease");
            return;
        }
        lease.take_user_data::<ClientId>();

        if let Err(err) = self.manager.revoke(request.lease) {
            warn!(lease = %name, %err, "Failed to revoke lease");
        }
        let crashed = request.kind == RequestKind::ClientDisconnect;
        if !(self.options.keep_on_crash && crashed) {
            // Unknown handles were ruled out above.
            let _ = self.manager.close(request.lease);
        }
    }

    fn lease_name(&self, handle: LeaseHandle) -> String {
        self.manager
            .lease(handle)
            .map(|lease| lease.name().to_string())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dlmclient::protocol::{FdReply, Opcode};
    use tokio::time::timeout;

    use super::*;
    use crate::testing::{is_closed, FakeDevice, TestClient, Topology};

    const WAIT: Duration = Duration::from_secs(5);
    const NAME: &str = "card0-HDMI-A-1";

    struct Fixture {
        daemon: Daemon<FakeDevice>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(options: DaemonOptions) -> Self {
            let device = FakeDevice::new(0, Topology::new(1).connector(11, 0b1, None).build());
            let manager = LeaseManager::with_device(device, None).unwrap();
            let dir = tempfile::tempdir().unwrap();
            let daemon = Daemon::new(manager, dir.path(), options).unwrap();
            Self { daemon, dir }
        }

        fn connect(&self) -> TestClient {
            TestClient::connect(&self.dir.path().join(NAME))
        }

        async fn step(&mut self) -> Request {
            let request = timeout(WAIT, self.daemon.server.next_request())
                .await
                .expect("no request")
                .unwrap();
            self.daemon.handle(request);
            request
        }

        fn lease(&self) -> &crate::lease::Lease {
            let manager = self.daemon.manager();
            manager.lease(manager.find(NAME).unwrap()).unwrap()
        }
    }

    #[tokio::test]
    async fn get_and_release() {
        let mut fixture = Fixture::new(DaemonOptions::default());
        let client = fixture.connect();

        client.send(Opcode::GetLease);
        let request = fixture.step().await;
        assert!(matches!(client.recv_fd(), FdReply::Fd(_)));
        assert!(fixture.lease().is_granted());
        assert_eq!(fixture.lease().user_data::<ClientId>(), Some(&request.client));

        client.send(Opcode::ReleaseLease);
        fixture.step().await;
        assert!(!fixture.lease().is_granted());
        assert!(fixture.lease().fd().is_none());
        assert!(is_closed(client.socket(), WAIT));
    }

    #[tokio::test]
    async fn busy_lease_is_refused_without_transfer() {
        let mut fixture = Fixture::new(DaemonOptions::default());
        let holder = fixture.connect();
        holder.send(Opcode::GetLease);
        fixture.step().await;
        assert!(matches!(holder.recv_fd(), FdReply::Fd(_)));

        let other = fixture.connect();
        other.send(Opcode::GetLease);
        fixture.step().await;
        assert!(matches!(other.recv_fd(), FdReply::HungUp));
        assert_eq!(fixture.lease().lessee_id(), Some(1));
        assert!(!is_closed(holder.socket(), Duration::ZERO));
    }

    #[tokio::test]
    async fn transfer_moves_lease_to_new_client() {
        let mut fixture = Fixture::new(DaemonOptions {
            allow_transfer: true,
            ..Default::default()
        });
        let holder = fixture.connect();
        holder.send(Opcode::GetLease);
        fixture.step().await;

        let other = fixture.connect();
        other.send(Opcode::GetLease);
        let request = fixture.step().await;
        assert!(matches!(other.recv_fd(), FdReply::Fd(_)));
        assert_eq!(fixture.lease().lessee_id(), Some(2));
        assert_eq!(fixture.lease().user_data::<ClientId>(), Some(&request.client));
        assert!(is_closed(holder.socket(), WAIT));
    }

    #[tokio::test]
    async fn holder_asking_again_keeps_its_connection() {
        let mut fixture = Fixture::new(DaemonOptions {
            allow_transfer: true,
            ..Default::default()
        });
        let holder = fixture.connect();
        holder.send(Opcode::GetLease);
        fixture.step().await;
        assert!(matches!(holder.recv_fd(), FdReply::Fd(_)));

        holder.send(Opcode::GetLease);
        let request = fixture.step().await;
        assert!(matches!(holder.recv_fd(), FdReply::Fd(_)));
        assert_eq!(fixture.lease().user_data::<ClientId>(), Some(&request.client));
        assert!(!is_closed(holder.socket(), Duration::ZERO));
    }

    #[tokio::test]
    async fn crash_keeps_descriptor_when_asked() {
        let mut fixture = Fixture::new(DaemonOptions {
            keep_on_crash: true,
            ..Default::default()
        });
        let client = fixture.connect();
        client.send(Opcode::GetLease);
        fixture.step().await;

        drop(client);
        assert_eq!(fixture.step().await.kind, RequestKind::ClientDisconnect);
        assert!(!fixture.lease().is_granted());
        assert!(fixture.lease().fd().is_some());
    }

    #[tokio::test]
    async fn crash_closes_descriptor_by_default() {
        let mut fixture = Fixture::new(DaemonOptions::default());
        let client = fixture.connect();
        client.send(Opcode::GetLease);
        fixture.step().await;

        drop(client);
        fixture.step().await;
        assert!(!fixture.lease().is_granted());
        assert!(fixture.lease().fd().is_none());
    }

    #[tokio::test]
    async fn bystander_hang_up_keeps_the_lease() {
        let mut fixture = Fixture::new(DaemonOptions::default());
        let holder = fixture.connect();
        holder.send(Opcode::GetLease);
        fixture.step().await;

        let bystander = fixture.connect();
        bystander.send(Opcode::ReleaseLease);
        fixture.step().await;
        assert!(fixture.lease().is_granted());
        assert!(!is_closed(holder.socket(), Duration::ZERO));
    }
}
