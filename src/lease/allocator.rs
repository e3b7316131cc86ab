// CRTC assignment and plane partitioning for lease construction.

use tracing::debug;

use crate::device::{ConnectorInfo, CrtcMask, DeviceResources, ObjectId};

/// Hands out CRTCs to connectors while the initial lease set is built.
///
/// Only CRTCs that no encoder is driving at construction time are in the
/// pool. A connector that is already lit keeps its CRTC without drawing from
/// the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcAllocator {
    available: CrtcMask,
}

impl CrtcAllocator {
    pub fn new(resources: &DeviceResources) -> Self {
        let mut available = resources.all_crtcs();
        for encoder in &resources.encoders {
            if let Some(index) = resources.active_crtc_index(encoder) {
                available &= !(1 << index);
            }
        }
        Self { available }
    }

    pub fn available(&self) -> CrtcMask {
        self.available
    }

    /// Returns the CRTC index to use for `connector`, or `None` when no
    /// compatible CRTC is left.
    pub fn assign(
        &mut self,
        resources: &DeviceResources,
        connector: &ConnectorInfo,
    ) -> Option<usize> {
        if let Some(index) = active_crtc_index(resources, connector) {
            return Some(index);
        }

        for &encoder_id in &connector.encoders {
            let Some(encoder) = resources.encoder(encoder_id) else {
                debug!(connector = connector.id, encoder = encoder_id, "Unknown encoder");
                continue;
            };

            let usable = self.available & encoder.possible_crtcs;
            if usable == 0 {
                continue;
            }

            let index = usable.trailing_zeros() as usize;
            self.available &= !(1 << index);
            return Some(index);
        }

        None
    }
}

fn active_crtc_index(resources: &DeviceResources, connector: &ConnectorInfo) -> Option<usize> {
    let encoder = resources.encoder(connector.current_encoder?)?;
    resources.active_crtc_index(encoder)
}

/// Planes that can only be shown on the CRTC at `crtc_index`.
///
/// Planes usable on several CRTCs are left out of every lease so the same
/// plane can never end up in two of them.
pub fn exclusive_planes(
    resources: &DeviceResources,
    crtc_index: usize,
) -> impl Iterator<Item = ObjectId> + '_ {
    let mask: CrtcMask = 1 << crtc_index;
    resources
        .planes
        .iter()
        .filter(move |plane| plane.possible_crtcs == mask)
        .map(|plane| plane.id)
}
