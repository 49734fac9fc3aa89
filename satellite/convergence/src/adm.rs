// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Administrative command surface of the replication daemon.
//!
//! These are the adjustment commands the convergence engine issues to bring
//! the daemon's runtime state in line with the generated configuration
//! file. The real implementation shells out to the daemon's admin utility;
//! only the contract lives here.

use async_trait::async_trait;
use camino::Utf8Path;
use meridian_common::names::MinorNumber;
use meridian_common::names::ResourceName;
use meridian_common::names::VolumeNumber;

/// An external admin command exited unsuccessfully.
#[derive(Debug, thiserror::Error)]
#[error("external command {command:?} failed: {message}")]
pub struct AdmError {
    pub command: String,
    pub message: String,
}

#[async_trait]
pub trait DeviceAdm: Send + Sync {
    /// Bring the daemon's runtime state of `rsc` in line with its
    /// configuration file.
    async fn adjust(&self, rsc: &ResourceName) -> Result<(), AdmError>;

    /// Stop the resource entirely.
    async fn down(&self, rsc: &ResourceName) -> Result<(), AdmError>;

    async fn primary(
        &self,
        rsc: &ResourceName,
        force: bool,
    ) -> Result<(), AdmError>;

    async fn secondary(&self, rsc: &ResourceName) -> Result<(), AdmError>;

    async fn suspend_io(&self, rsc: &ResourceName) -> Result<(), AdmError>;

    async fn resume_io(&self, rsc: &ResourceName) -> Result<(), AdmError>;

    /// Initialize replication meta data for one volume. Idempotent if the
    /// meta data already exists and matches.
    async fn create_meta_data(
        &self,
        rsc: &ResourceName,
        volume: VolumeNumber,
        peer_slots: u8,
    ) -> Result<(), AdmError>;

    /// Probe a backing device for existing replication meta data.
    async fn has_meta_data(
        &self,
        backing: &Utf8Path,
        minor: MinorNumber,
    ) -> Result<bool, AdmError>;
}
