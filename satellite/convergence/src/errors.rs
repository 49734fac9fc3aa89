// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Failure taxonomy of one reconciliation pass.
//!
//! Volume-level failures are aggregated into resource-level failures; a
//! resource-level failure is caught at the dispatch boundary and turned
//! into a structured outcome. Nothing here is a panic: a failed pass marks
//! the resource failed and the next dispatch starts over.

use crate::adm::AdmError;
use crate::device_state::NoInitialState;
use meridian_common::error::ErrorDetails;
use meridian_common::names::VolumeNumber;
use satellite_storage::StorageError;
use satellite_storage::metadata::MetaDataError;

/// A failure scoped to one volume of a resource.
#[derive(Debug, thiserror::Error)]
#[error("volume {volume}: {details}")]
pub struct VolumeError {
    pub volume: VolumeNumber,
    pub details: ErrorDetails,
    #[source]
    pub source: Option<StorageError>,
}

impl VolumeError {
    pub fn new(volume: VolumeNumber, details: ErrorDetails) -> Self {
        Self { volume, details, source: None }
    }

    pub fn with_source(
        volume: VolumeNumber,
        details: ErrorDetails,
        source: StorageError,
    ) -> Self {
        Self { volume, details, source: Some(source) }
    }
}

/// A failure that aborts the reconciliation of one resource.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// The volume's parameters are outside the range the replication
    /// daemon's meta data supports.
    #[error("{details}")]
    MetaDataSize {
        details: ErrorDetails,
        #[source]
        source: MetaDataError,
    },
    /// Writing or deleting the generated configuration file failed.
    #[error("{details}")]
    ConfigIo {
        details: ErrorDetails,
        #[source]
        source: std::io::Error,
    },
    /// The adjust command failed.
    #[error("{details}")]
    Adjust {
        details: ErrorDetails,
        #[source]
        source: AdmError,
    },
    /// Stopping the device failed during deletion.
    #[error("{details}")]
    DeviceDown {
        details: ErrorDetails,
        #[source]
        source: AdmError,
    },
    /// Suspending or resuming I/O failed.
    #[error("{details}")]
    SuspendResume {
        details: ErrorDetails,
        #[source]
        source: AdmError,
    },
    /// Initializing replication meta data failed.
    #[error("{details}")]
    MetaDataCreate {
        details: ErrorDetails,
        #[source]
        source: AdmError,
    },
    /// Promoting (or demoting) the resource failed.
    #[error("{details}")]
    PrimaryAssign {
        details: ErrorDetails,
        #[source]
        source: AdmError,
    },
    /// A single volume failed and aborted the pass.
    #[error("{details}")]
    Volume {
        details: ErrorDetails,
        #[source]
        source: VolumeError,
    },
    /// One or more volume deletions failed; deletion of the remaining
    /// volumes was still attempted.
    #[error("{details}")]
    VolumeDeletion { details: ErrorDetails },
    #[error(transparent)]
    NoInitialState(#[from] NoInitialState),
}

impl ResourceError {
    /// The operator-facing diagnostic for this failure.
    pub fn details(&self) -> ErrorDetails {
        match self {
            ResourceError::MetaDataSize { details, .. }
            | ResourceError::ConfigIo { details, .. }
            | ResourceError::Adjust { details, .. }
            | ResourceError::DeviceDown { details, .. }
            | ResourceError::SuspendResume { details, .. }
            | ResourceError::MetaDataCreate { details, .. }
            | ResourceError::PrimaryAssign { details, .. }
            | ResourceError::Volume { details, .. }
            | ResourceError::VolumeDeletion { details } => details.clone(),
            ResourceError::NoInitialState(_) => ErrorDetails::new(
                "Device state tracking is unavailable",
            )
            .cause("The device event tracker has not completed its initial scan")
            .correction(
                "Operations will continue automatically when device state \
                 tracking is recovered",
            ),
        }
    }

    pub fn from_volume(resource: &str, err: VolumeError) -> Self {
        let details = ErrorDetails::new(format!(
            "Initialization of storage for resource {resource:?} volume {} \
             failed",
            err.volume,
        ))
        .cause(err.details.message.clone());
        ResourceError::Volume { details, source: err }
    }
}
