use std::{os::fd::BorrowedFd, path::Path, sync::Arc};

use tracing::{debug, info, warn};

use super::{
    allocator::{exclusive_planes, CrtcAllocator},
    naming::{connector_name, default_requests},
    ConnectorRef, Lease, LeaseBuildError, LeaseError, LeaseManagerError, LeaseRequest,
};
use crate::device::{ConnectorInfo, DeviceResources, DrmCard, KmsDevice};

/// Handle to one of the leases of a [`LeaseManager`].
///
/// Handles stay valid for the lifetime of the manager that returned them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseHandle(pub(crate) usize);

/// Owns a display device and the leases carved out of it.
///
/// Dropping the manager revokes and closes every lease.
pub struct LeaseManager<D: KmsDevice = DrmCard> {
    device: Arc<D>,
    resources: DeviceResources,
    leases: Vec<Lease>,
}

impl LeaseManager<DrmCard> {
    /// Opens the DRM device at `path` and builds its leases.
    ///
    /// Without `requests`, one lease is created per connector.
    pub fn open(
        path: impl AsRef<Path>,
        requests: Option<&[LeaseRequest]>,
    ) -> Result<Self, LeaseManagerError> {
        let card = DrmCard::open(path.as_ref())?;
        Self::with_device(card, requests)
    }
}

impl<D: KmsDevice> LeaseManager<D> {
    pub fn with_device(
        device: D,
        requests: Option<&[LeaseRequest]>,
    ) -> Result<Self, LeaseManagerError> {
        let resources = device.resources().map_err(LeaseManagerError::Resources)?;
        debug!(
            connectors = resources.connectors.len(),
            encoders = resources.encoders.len(),
            crtcs = resources.crtcs.len(),
            planes = resources.planes.len(),
            "DRM resources"
        );

        let leases = match requests {
            Some(requests) => build_leases(&resources, requests),
            None => build_leases(&resources, &default_requests(device.minor(), &resources)),
        };
        if leases.is_empty() {
            return Err(LeaseManagerError::NoLeases);
        }

        for lease in &leases {
            info!(lease = lease.name(), objects = ?lease.objects(), "Lease created");
        }

        Ok(Self {
            device: Arc::new(device),
            resources,
            leases,
        })
    }

    pub fn resources(&self) -> &DeviceResources {
        &self.resources
    }

    pub fn handles(&self) -> impl Iterator<Item = LeaseHandle> {
        (0..self.leases.len()).map(LeaseHandle)
    }

    pub fn find(&self, name: &str) -> Option<LeaseHandle> {
        self.leases
            .iter()
            .position(|lease| lease.name() == name)
            .map(LeaseHandle)
    }

    pub fn lease(&self, handle: LeaseHandle) -> Option<&Lease> {
        self.leases.get(handle.0)
    }

    pub fn lease_mut(&mut self, handle: LeaseHandle) -> Option<&mut Lease> {
        self.leases.get_mut(handle.0)
    }

    pub fn leases(&self) -> impl Iterator<Item = (LeaseHandle, &Lease)> {
        self.leases
            .iter()
            .enumerate()
            .map(|(index, lease)| (LeaseHandle(index), lease))
    }

    /// Creates a kernel lease for `handle` and returns its descriptor.
    ///
    /// If the lease still holds the descriptor of an earlier grant, that
    /// descriptor stays open until the new lessee changes the framebuffer on
    /// the lease's CRTC.
    pub fn grant(&mut self, handle: LeaseHandle) -> Result<BorrowedFd<'_>, LeaseError> {
        let device = &self.device;
        let lease = self
            .leases
            .get_mut(handle.0)
            .ok_or(LeaseError::UnknownHandle)?;
        lease.grant(device)
    }

    /// Revokes the kernel lease. The descriptor stays open until
    /// [`close`](Self::close) or the next grant. Does nothing if the lease is
    /// not granted.
    pub fn revoke(&mut self, handle: LeaseHandle) -> Result<(), LeaseError> {
        let device = self.device.as_ref();
        let lease = self
            .leases
            .get_mut(handle.0)
            .ok_or(LeaseError::UnknownHandle)?;
        lease.revoke(device)
    }

    /// Moves a granted lease to a new lessee.
    ///
    /// The previous lessee loses access right away, but its descriptor is
    /// closed only once the new lessee has replaced the displayed framebuffer.
    /// If the new lease can't be created the lease ends up revoked and closed.
    pub fn transfer(&mut self, handle: LeaseHandle) -> Result<BorrowedFd<'_>, LeaseError> {
        let device = &self.device;
        let lease = self
            .leases
            .get_mut(handle.0)
            .ok_or(LeaseError::UnknownHandle)?;
        lease.transfer(device)
    }

    /// Closes the lease descriptor. Revoke first: a pending transition keeps
    /// its own copy of the descriptor until the framebuffer changes.
    pub fn close(&mut self, handle: LeaseHandle) -> Result<(), LeaseError> {
        let lease = self
            .leases
            .get_mut(handle.0)
            .ok_or(LeaseError::UnknownHandle)?;
        lease.close();
        Ok(())
    }
}

impl<D: KmsDevice> Drop for LeaseManager<D> {
    fn drop(&mut self) {
        for lease in &mut self.leases {
            if let Err(err) = lease.revoke(self.device.as_ref()) {
                warn!(?err, "Failed to revoke lease during shutdown");
            }
            lease.close();
        }
    }
}

fn build_leases(resources: &DeviceResources, requests: &[LeaseRequest]) -> Vec<Lease> {
    let mut allocator = CrtcAllocator::new(resources);
    requests
        .iter()
        .filter_map(
            |request| match build_lease(resources, &mut allocator, request) {
                Ok(lease) => Some(lease),
                Err(err) => {
                    warn!(lease = %request.name, %err, "Skipping lease");
                    None
                }
            },
        )
        .collect()
}

/// Resolves `request` against the device. CRTCs are taken from `pool` only if
/// the whole lease can be built.
fn build_lease(
    resources: &DeviceResources,
    pool: &mut CrtcAllocator,
    request: &LeaseRequest,
) -> Result<Lease, LeaseBuildError> {
    if request.name.is_empty() {
        return Err(LeaseBuildError::MissingName);
    }

    let mut allocator = *pool;
    let mut objects = Vec::with_capacity(resources.planes.len() + request.connectors.len() * 2);
    let mut crtc = None;

    for entry in &request.connectors {
        let Some(connector) = resolve_connector(resources, &entry.connector) else {
            if entry.optional {
                debug!(lease = %request.name, connector = %entry.connector, "Optional connector not found");
                continue;
            }
            return Err(LeaseBuildError::UnknownConnector(entry.connector.to_string()));
        };

        let Some(index) = allocator.assign(resources, connector) else {
            if entry.optional {
                debug!(lease = %request.name, connector = connector.id, "No CRTC for optional connector");
                continue;
            }
            return Err(LeaseBuildError::NoCrtc(connector.id));
        };

        match &entry.planes {
            Some(planes) => objects.extend_from_slice(planes),
            None => objects.extend(exclusive_planes(resources, index)),
        }
        let crtc_id = resources.crtcs[index];
        objects.push(crtc_id);
        objects.push(connector.id);
        crtc = Some(crtc_id);
    }

    let crtc = crtc.ok_or(LeaseBuildError::NoConnectors)?;
    *pool = allocator;
    Ok(Lease::new(request.name.clone(), objects, crtc))
}

fn resolve_connector<'a>(
    resources: &'a DeviceResources,
    connector: &ConnectorRef,
) -> Option<&'a ConnectorInfo> {
    match connector {
        ConnectorRef::Id(id) => resources.connector(*id),
        ConnectorRef::Name(name) => resources
            .connectors
            .iter()
            .find(|connector| connector_name(connector) == *name),
    }
}
