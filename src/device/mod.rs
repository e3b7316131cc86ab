//! Kernel display device seam.
//!
//! [`KmsDevice`] is the set of KMS primitives the lease manager needs: resource
//! enumeration, lease creation and revocation, and reading which framebuffer a
//! CRTC is scanning out. [`card::DrmCard`] implements it over a real
//! `/dev/dri/card*` node.

use std::{
    io,
    os::fd::{BorrowedFd, OwnedFd},
};

pub mod card;

pub use card::DrmCard;

/// KMS object id as used by the kernel (connector, encoder, CRTC, plane).
pub type ObjectId = u32;

/// Bitmask of CRTC indices, bit `n` standing for `DeviceResources::crtcs[n]`.
pub type CrtcMask = u32;

/// Highest number of CRTCs a [`CrtcMask`] can describe.
pub const MAX_CRTCS: usize = CrtcMask::BITS as usize;

pub trait KmsDevice: Send + Sync + 'static {
    /// Minor number of the device node (`N` in `cardN`).
    fn minor(&self) -> u32;

    fn resources(&self) -> io::Result<DeviceResources>;

    /// Creates a lease over `objects`, returning the lessee id and the lease
    /// descriptor.
    fn create_lease(&self, objects: &[ObjectId]) -> io::Result<(u32, OwnedFd)>;

    fn revoke_lease(&self, lessee_id: u32) -> io::Result<()>;

    /// Framebuffer currently attached to `crtc`, as seen through `lease_fd`.
    /// `0` when nothing is scanned out.
    fn crtc_framebuffer(&self, lease_fd: BorrowedFd<'_>, crtc: ObjectId) -> io::Result<u32>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: ObjectId,
    /// Kernel connector type (`DRM_MODE_CONNECTOR_*`).
    pub kind: u32,
    /// Index among connectors of the same type, starting at 1.
    pub kind_index: u32,
    pub current_encoder: Option<ObjectId>,
    pub encoders: Vec<ObjectId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub id: ObjectId,
    /// CRTC the encoder is currently bound to.
    pub crtc: Option<ObjectId>,
    pub possible_crtcs: CrtcMask,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    pub id: ObjectId,
    pub possible_crtcs: CrtcMask,
}

/// Snapshot of a device's display resources, taken once when the lease
/// manager is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceResources {
    pub connectors: Vec<ConnectorInfo>,
    pub encoders: Vec<EncoderInfo>,
    /// CRTC ids in kernel index order.
    pub crtcs: Vec<ObjectId>,
    pub planes: Vec<PlaneInfo>,
}

impl DeviceResources {
    pub fn connector(&self, id: ObjectId) -> Option<&ConnectorInfo> {
        self.connectors.iter().find(|connector| connector.id == id)
    }

    pub fn encoder(&self, id: ObjectId) -> Option<&EncoderInfo> {
        self.encoders.iter().find(|encoder| encoder.id == id)
    }

    pub fn crtc_index(&self, crtc: ObjectId) -> Option<usize> {
        self.crtcs.iter().position(|&id| id == crtc)
    }

    /// Index of the CRTC `encoder` is currently driving, if any.
    pub fn active_crtc_index(&self, encoder: &EncoderInfo) -> Option<usize> {
        encoder.crtc.and_then(|crtc| self.crtc_index(crtc))
    }

    /// Mask with one bit set per CRTC of the device.
    pub fn all_crtcs(&self) -> CrtcMask {
        match self.crtcs.len() {
            n if n >= MAX_CRTCS => CrtcMask::MAX,
            n => (1 << n) - 1,
        }
    }
}
