// DRM card node backed by the `drm` crate.

use std::{
    fs::{File, OpenOptions},
    io,
    num::NonZeroU32,
    os::{
        fd::{AsFd, BorrowedFd, OwnedFd},
        unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt},
    },
    path::{Path, PathBuf},
};

use drm::control::{crtc, CrtcListFilter, Device as ControlDevice, RawResourceHandle, ResourceHandles};
use rustix::fs::OFlags;
use tracing::{debug, warn};

use super::{
    ConnectorInfo, CrtcMask, DeviceResources, EncoderInfo, KmsDevice, ObjectId, PlaneInfo,
    MAX_CRTCS,
};

#[derive(Debug, thiserror::Error)]
pub enum CardOpenError {
    #[error("Cannot open DRM device ({path}): {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} is not a valid device file")]
    NotCharDevice(PathBuf),
}

/// An open `/dev/dri/cardN` node.
#[derive(Debug)]
pub struct DrmCard {
    file: File,
    minor: u32,
}

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl drm::Device for DrmCard {}
impl ControlDevice for DrmCard {}

impl DrmCard {
    pub fn open(path: &Path) -> Result<Self, CardOpenError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlags::CLOEXEC.bits() as i32)
            .open(path)
            .map_err(|source| CardOpenError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let metadata = file.metadata().map_err(|source| CardOpenError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        if !metadata.file_type().is_char_device() {
            return Err(CardOpenError::NotCharDevice(path.to_path_buf()));
        }

        let minor = rustix::fs::minor(metadata.rdev());
        debug!(path = %path.display(), minor, "Opened DRM device");

        Ok(Self { file, minor })
    }
}

impl KmsDevice for DrmCard {
    fn minor(&self) -> u32 {
        self.minor
    }

    fn resources(&self) -> io::Result<DeviceResources> {
        let handles = self.resource_handles()?;
        if handles.crtcs().len() > MAX_CRTCS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("device reports {} CRTCs", handles.crtcs().len()),
            ));
        }

        let crtcs = handles.crtcs().iter().map(|&crtc| u32::from(crtc)).collect();

        let mut connectors = Vec::with_capacity(handles.connectors().len());
        for &handle in handles.connectors() {
            let info = self.get_connector(handle, true)?;
            connectors.push(ConnectorInfo {
                id: handle.into(),
                kind: u32::from(info.interface()),
                kind_index: info.interface_id(),
                current_encoder: info.current_encoder().map(u32::from),
                encoders: info.encoders().iter().map(|&enc| u32::from(enc)).collect(),
            });
        }

        let mut encoders = Vec::with_capacity(handles.encoders().len());
        for &handle in handles.encoders() {
            match self.get_encoder(handle) {
                Ok(info) => encoders.push(EncoderInfo {
                    id: handle.into(),
                    crtc: info.crtc().map(u32::from),
                    possible_crtcs: crtc_mask(&handles, info.possible_crtcs()),
                }),
                Err(err) => warn!(encoder = ?handle, ?err, "Failed to query encoder"),
            }
        }

        let mut planes = Vec::new();
        for handle in self.plane_handles()? {
            let info = self.get_plane(handle)?;
            planes.push(PlaneInfo {
                id: handle.into(),
                possible_crtcs: crtc_mask(&handles, info.possible_crtcs()),
            });
        }

        Ok(DeviceResources {
            connectors,
            encoders,
            crtcs,
            planes,
        })
    }

    fn create_lease(&self, objects: &[ObjectId]) -> io::Result<(u32, OwnedFd)> {
        let objects = objects
            .iter()
            .map(|&id| {
                NonZeroU32::new(id).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "object id 0 in lease")
                })
            })
            .collect::<io::Result<Vec<RawResourceHandle>>>()?;

        let (lessee, fd) =
            ControlDevice::create_lease(self, &objects, OFlags::CLOEXEC.bits())?;
        Ok((lessee.get(), fd))
    }

    fn revoke_lease(&self, lessee_id: u32) -> io::Result<()> {
        let lessee = NonZeroU32::new(lessee_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "lessee id 0"))?;
        ControlDevice::revoke_lease(self, lessee)
    }

    fn crtc_framebuffer(&self, lease_fd: BorrowedFd<'_>, crtc: ObjectId) -> io::Result<u32> {
        let handle = drm::control::from_u32::<crtc::Handle>(crtc)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "CRTC id 0"))?;
        let info = LeaseNode(lease_fd).get_crtc(handle)?;
        Ok(info.framebuffer().map(u32::from).unwrap_or(0))
    }
}

/// KMS access through a lease descriptor instead of the card node.
struct LeaseNode<'a>(BorrowedFd<'a>);

impl AsFd for LeaseNode<'_> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0
    }
}

impl drm::Device for LeaseNode<'_> {}
impl ControlDevice for LeaseNode<'_> {}

/// Turns the kernel's CRTC filter into a mask over `handles.crtcs()`.
fn crtc_mask(handles: &ResourceHandles, filter: CrtcListFilter) -> CrtcMask {
    let usable = handles.filter_crtcs(filter);
    handles
        .crtcs()
        .iter()
        .enumerate()
        .filter(|(_, crtc)| usable.contains(*crtc))
        .fold(0, |mask, (index, _)| mask | (1 << index))
}
