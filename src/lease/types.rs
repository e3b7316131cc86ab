use std::io;

use crate::device::{card::CardOpenError, ObjectId};

/// Error type for lease manager creation
#[derive(Debug, thiserror::Error)]
pub enum LeaseManagerError {
    #[error(transparent)]
    Device(#[from] CardOpenError),
    #[error("Invalid DRM device: {0}")]
    Resources(#[source] io::Error),
    #[error("No lease could be created for this device")]
    NoLeases,
}

/// Error type for operations on a single lease
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("Unknown lease handle")]
    UnknownHandle,
    #[error("Lease {0} is already granted")]
    AlreadyGranted(String),
    #[error("Lease {0} is not granted")]
    NotGranted(String),
    #[error("Failed to create DRM lease {lease}: {source}")]
    Create {
        lease: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to revoke DRM lease {lease}: {source}")]
    Revoke {
        lease: String,
        #[source]
        source: io::Error,
    },
}

/// Why a lease request did not produce a lease
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LeaseBuildError {
    #[error("Missing lease name")]
    MissingName,
    #[error("Can't find connector {0}")]
    UnknownConnector(String),
    #[error("No CRTC found for connector {0}")]
    NoCrtc(ObjectId),
    #[error("No usable connector in lease")]
    NoConnectors,
}
