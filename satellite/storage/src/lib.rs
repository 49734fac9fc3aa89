// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage backend contract used by the satellite convergence engine.
//!
//! Concrete drivers (LVM, ZFS, network-attached volumes) live outside this
//! workspace; the convergence engine only depends on the [`VolumeBackend`]
//! lifecycle contract plus the meta-data sizing rules of the replication
//! daemon, both of which are defined here.

pub mod backend;
pub mod metadata;
pub mod thin;

pub use backend::BackendRegistry;
pub use backend::Provisioning;
pub use backend::StorageError;
pub use backend::VolumeBackend;
