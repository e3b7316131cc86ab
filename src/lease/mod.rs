//! Leases and their lifecycle.
//!
//! A [`Lease`] is a fixed set of KMS objects (planes, CRTCs, connectors) chosen
//! when the [`LeaseManager`] is created, plus the state of the kernel lease
//! currently granted over them.
//!
//! ```text
//!              grant                 revoke
//!  Unleased ─────────────▶ Granted ─────────▶ Unleased
//!                            │  ▲
//!                   transfer │  │ new lessee, previous fd handed
//!                            └──┘ to a TransitionWorker
//! ```

use std::{
    any::Any,
    fmt,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    sync::Arc,
};

use tracing::{debug, info, warn};

pub mod allocator;
pub mod manager;
pub mod naming;
pub mod transition;
pub mod types;

pub use manager::{LeaseHandle, LeaseManager};
pub use types::{LeaseBuildError, LeaseError, LeaseManagerError};

use crate::device::{KmsDevice, ObjectId};
use transition::TransitionWorker;

/// How a lease request refers to a connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorRef {
    Id(ObjectId),
    /// `<TYPE>-<index>` name, e.g. `HDMI-A-1`.
    Name(String),
}

impl fmt::Display for ConnectorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorRef::Id(id) => write!(f, "{id}"),
            ConnectorRef::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorRequest {
    pub connector: ConnectorRef,
    /// Skip this connector instead of dropping the lease when it can't be
    /// used.
    pub optional: bool,
    /// Planes to lease with this connector instead of the automatically
    /// selected ones.
    pub planes: Option<Vec<ObjectId>>,
}

impl ConnectorRequest {
    pub fn id(id: ObjectId) -> Self {
        Self {
            connector: ConnectorRef::Id(id),
            optional: false,
            planes: None,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            connector: ConnectorRef::Name(name.into()),
            optional: false,
            planes: None,
        }
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn with_planes(mut self, planes: Vec<ObjectId>) -> Self {
        self.planes = Some(planes);
        self
    }
}

/// A named set of connectors to lease together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    pub name: String,
    pub connectors: Vec<ConnectorRequest>,
}

impl LeaseRequest {
    pub fn new(name: impl Into<String>, connectors: Vec<ConnectorRequest>) -> Self {
        Self {
            name: name.into(),
            connectors,
        }
    }
}

pub struct Lease {
    name: String,
    objects: Vec<ObjectId>,
    /// CRTC watched during lease transitions.
    crtc: ObjectId,
    lessee: Option<u32>,
    fd: Option<OwnedFd>,
    transition: Option<TransitionWorker>,
    user_data: Option<Box<dyn Any + Send>>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("name", &self.name)
            .field("objects", &self.objects)
            .field("crtc", &self.crtc)
            .field("lessee", &self.lessee)
            .field("fd", &self.fd)
            .field("transition", &self.transition.is_some())
            .finish_non_exhaustive()
    }
}

impl Lease {
    pub(crate) fn new(name: String, objects: Vec<ObjectId>, crtc: ObjectId) -> Self {
        Self {
            name,
            objects,
            crtc,
            lessee: None,
            fd: None,
            transition: None,
            user_data: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Object ids included in the kernel lease, per connector: planes, CRTC,
    /// connector.
    pub fn objects(&self) -> &[ObjectId] {
        &self.objects
    }

    pub fn crtc(&self) -> ObjectId {
        self.crtc
    }

    pub fn is_granted(&self) -> bool {
        self.lessee.is_some()
    }

    pub fn lessee_id(&self) -> Option<u32> {
        self.lessee
    }

    /// Current lease descriptor. It stays open after a revoke until the lease
    /// is closed or granted again.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd)
    }

    pub fn transition_pending(&self) -> bool {
        self.transition
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    pub fn set_user_data<T: Any + Send>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref()?.downcast_ref()
    }

    pub fn take_user_data<T: Any>(&mut self) -> Option<T> {
        let data = self.user_data.take()?;
        match data.downcast::<T>() {
            Ok(data) => Some(*data),
            Err(other) => {
                self.user_data = Some(other);
                None
            }
        }
    }

    pub(crate) fn grant<D: KmsDevice>(
        &mut self,
        device: &Arc<D>,
    ) -> Result<BorrowedFd<'_>, LeaseError> {
        self.create(device)?;
        self.granted_fd()
    }

    pub(crate) fn revoke<D: KmsDevice>(&mut self, device: &D) -> Result<(), LeaseError> {
        let Some(lessee) = self.lessee else {
            return Ok(());
        };

        match device.revoke_lease(lessee) {
            Ok(()) => {}
            // The lessee goes away by itself once every copy of its fd is closed.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(lease = %self.name, lessee, "Lessee already gone");
            }
            Err(source) => {
                return Err(LeaseError::Revoke {
                    lease: self.name.clone(),
                    source,
                })
            }
        }

        if let Some(worker) = self.transition.take() {
            worker.cancel();
        }
        self.lessee = None;
        info!(lease = %self.name, lessee, "Lease revoked");
        Ok(())
    }

    pub(crate) fn transfer<D: KmsDevice>(
        &mut self,
        device: &Arc<D>,
    ) -> Result<BorrowedFd<'_>, LeaseError> {
        if !self.is_granted() {
            return Err(LeaseError::NotGranted(self.name.clone()));
        }

        self.revoke(device.as_ref())?;
        if let Err(err) = self.create(device) {
            self.close();
            return Err(err);
        }
        self.granted_fd()
    }

    pub(crate) fn close(&mut self) {
        if self.fd.take().is_some() {
            debug!(lease = %self.name, "Lease descriptor closed");
        }
    }

    fn create<D: KmsDevice>(&mut self, device: &Arc<D>) -> Result<(), LeaseError> {
        if self.is_granted() {
            return Err(LeaseError::AlreadyGranted(self.name.clone()));
        }

        let (lessee, fd) =
            device
                .create_lease(&self.objects)
                .map_err(|source| LeaseError::Create {
                    lease: self.name.clone(),
                    source,
                })?;
        info!(lease = %self.name, lessee, "Lease granted");

        if let Some(previous) = self.fd.take() {
            if let Some(worker) = self.transition.take() {
                worker.cancel();
            }
            self.transition = start_transition(device, &self.name, self.crtc, &fd, previous);
        }
        self.lessee = Some(lessee);
        self.fd = Some(fd);
        Ok(())
    }

    fn granted_fd(&self) -> Result<BorrowedFd<'_>, LeaseError> {
        self.fd
            .as_ref()
            .map(AsFd::as_fd)
            .ok_or_else(|| LeaseError::NotGranted(self.name.clone()))
    }
}

/// Keeps `previous` open until the new lessee has replaced the framebuffer on
/// `crtc`. Falls back to closing it right away.
fn start_transition<D: KmsDevice>(
    device: &Arc<D>,
    lease: &str,
    crtc: ObjectId,
    current: &OwnedFd,
    previous: OwnedFd,
) -> Option<TransitionWorker> {
    let watch = match current.try_clone() {
        Ok(watch) => watch,
        Err(err) => {
            warn!(lease, ?err, "Can't watch lease transition, closing previous fd");
            return None;
        }
    };

    match TransitionWorker::spawn(Arc::clone(device), lease, crtc, watch, previous) {
        Ok(worker) => Some(worker),
        Err(err) => {
            warn!(lease, ?err, "Can't start lease transition, previous fd closed");
            None
        }
    }
}
