// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The volume lifecycle contract implemented by storage drivers.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use meridian_common::names::StorPoolName;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage command failed: {cause}")]
    CommandFailed { cause: String },
    #[error("backing volume {name:?} not found")]
    VolumeNotFound { name: String },
    #[error("snapshots require a thin-provisioned storage pool")]
    SnapshotsUnsupported,
    #[error("I/O error accessing backing storage")]
    Io(#[from] std::io::Error),
}

/// How a backend allocates space for new volumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provisioning {
    /// The full volume size is reserved up front.
    Fat,
    /// Space is allocated on demand from a shared pool; snapshots are
    /// supported.
    Thin,
}

/// Lifecycle operations on named backing volumes in one storage pool.
///
/// Implementations drive external tooling, so any call may fail with a
/// [`StorageError`] carrying a human-readable cause, and any call may block
/// on misbehaving hardware; callers are expected to bound `exists` probes
/// with a timeout rather than trusting the backend to return promptly.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Allocation behavior of this backend. Fat-provisioned pools cannot
    /// take snapshots.
    fn provisioning(&self) -> Provisioning {
        Provisioning::Fat
    }

    /// Create a backing volume of `size_kib`. `key` is the encryption key
    /// for encrypted volumes.
    async fn create(
        &self,
        name: &str,
        size_kib: u64,
        key: Option<&[u8]>,
    ) -> Result<(), StorageError>;

    /// Grow an existing backing volume to at least `size_kib`. Must be a
    /// no-op if the volume is already large enough.
    async fn resize(&self, name: &str, size_kib: u64)
        -> Result<(), StorageError>;

    async fn delete(
        &self,
        name: &str,
        encrypted: bool,
    ) -> Result<(), StorageError>;

    async fn exists(&self, name: &str) -> Result<bool, StorageError>;

    /// Path of the block device for an existing backing volume.
    fn path(
        &self,
        name: &str,
        encrypted: bool,
    ) -> Result<Utf8PathBuf, StorageError>;

    async fn create_snapshot(
        &self,
        name: &str,
        snapshot: &str,
    ) -> Result<(), StorageError>;

    async fn delete_snapshot(
        &self,
        name: &str,
        snapshot: &str,
    ) -> Result<(), StorageError>;

    /// Create volume `dst` as a copy of snapshot `snapshot` of volume
    /// `src`.
    async fn restore_snapshot(
        &self,
        src: &str,
        snapshot: &str,
        dst: &str,
        key: Option<&[u8]>,
    ) -> Result<(), StorageError>;
}

/// Resolves a storage pool name to the driver deployed for it on this node.
///
/// Driver identity is derived from storage pool configuration that is
/// immutable for the lifetime of the process, so handles returned here may
/// be cached for the duration of one reconciliation pass.
pub trait BackendRegistry: Send + Sync {
    fn backend_for(
        &self,
        pool: &StorPoolName,
    ) -> Option<Arc<dyn VolumeBackend>>;
}
