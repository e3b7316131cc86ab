// Connector labels and default lease names.

use super::{ConnectorRequest, LeaseRequest};
use crate::device::{ConnectorInfo, DeviceResources};

/// Kernel connector type `DRM_MODE_CONNECTOR_Unknown`.
pub const CONNECTOR_UNKNOWN: u32 = 0;

/// Labels indexed by `DRM_MODE_CONNECTOR_*`, matching the kernel's own
/// connector names.
const CONNECTOR_TYPE_NAMES: &[&str] = &[
    "Unknown",
    "VGA",
    "DVI-I",
    "DVI-D",
    "DVI-A",
    "Composite",
    "SVIDEO",
    "LVDS",
    "Component",
    "DIN",
    "DP",
    "HDMI-A",
    "HDMI-B",
    "TV",
    "eDP",
    "Virtual",
    "DSI",
    "DPI",
    "Writeback",
];

pub fn connector_type_name(kind: u32) -> &'static str {
    CONNECTOR_TYPE_NAMES
        .get(kind as usize)
        .copied()
        .unwrap_or(CONNECTOR_TYPE_NAMES[CONNECTOR_UNKNOWN as usize])
}

/// Connector name in the `<TYPE>-<index>` form used by the kernel and in lease
/// configuration files, e.g. `HDMI-A-1`.
///
/// Connectors of unrecognized type all share the `Unknown` label, so their
/// global connector id stands in for the type-local index to keep names
/// unique.
pub fn connector_name(connector: &ConnectorInfo) -> String {
    let label = connector_type_name(connector.kind);
    let index = if label == CONNECTOR_TYPE_NAMES[CONNECTOR_UNKNOWN as usize] {
        connector.id
    } else {
        connector.kind_index
    };
    format!("{label}-{index}")
}

/// Name of the lease generated for `connector` when no configuration is given,
/// e.g. `card0-HDMI-A-1`.
pub fn default_lease_name(minor: u32, connector: &ConnectorInfo) -> String {
    format!("card{minor}-{}", connector_name(connector))
}

/// One single-connector lease per connector of the device.
pub fn default_requests(minor: u32, resources: &DeviceResources) -> Vec<LeaseRequest> {
    resources
        .connectors
        .iter()
        .map(|connector| {
            LeaseRequest::new(
                default_lease_name(minor, connector),
                vec![ConnectorRequest::id(connector.id)],
            )
        })
        .collect()
}
