// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Model of the state the replication daemon reports for its resources.
//!
//! The daemon's wire format is handled by a separate event-tracking service
//! which keeps an in-memory mirror; the convergence engine reads immutable
//! snapshots of that mirror through [`DeviceStateReader`]. All three state
//! enums are closed: a daemon version reporting a state we do not model is
//! a tracker bug, not something to paper over with a catch-all branch.

use meridian_common::names::NodeName;
use meridian_common::names::ResourceName;
use meridian_common::names::VolumeNumber;
use std::collections::BTreeMap;

/// Replication role of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Unknown,
    Primary,
    Secondary,
}

impl Default for Role {
    fn default() -> Self {
        Role::Unknown
    }
}

/// State of the replication link to one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    StandAlone,
    Disconnecting,
    Unconnected,
    Timeout,
    BrokenPipe,
    NetworkFailure,
    ProtocolError,
    TearDown,
    Connecting,
    Connected,
    Unknown,
}

impl ConnectionState {
    /// Whether this link state needs no intervention. `Connecting` counts
    /// as healthy: the daemon is already doing the right thing.
    pub fn is_healthy(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// State of a volume's local backing disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskState {
    Diskless,
    Attaching,
    Detaching,
    Failed,
    Negotiating,
    Inconsistent,
    Outdated,
    Consistent,
    UpToDate,
    Unknown,
}

impl DiskState {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskState::Diskless => "Diskless",
            DiskState::Attaching => "Attaching",
            DiskState::Detaching => "Detaching",
            DiskState::Failed => "Failed",
            DiskState::Negotiating => "Negotiating",
            DiskState::Inconsistent => "Inconsistent",
            DiskState::Outdated => "Outdated",
            DiskState::Consistent => "Consistent",
            DiskState::UpToDate => "UpToDate",
            DiskState::Unknown => "Unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceVolume {
    pub disk: DiskState,
    /// The volume participates as an intentionally disk-less client.
    pub client: bool,
}

/// Everything the daemon reports about one resource.
#[derive(Clone, Debug, Default)]
pub struct DeviceResource {
    pub role: Role,
    /// I/O has been suspended at a user's (or this engine's) request.
    pub suspended_user: bool,
    pub connections: BTreeMap<NodeName, ConnectionState>,
    pub volumes: BTreeMap<VolumeNumber, DeviceVolume>,
}

/// Raised while the event tracker has not yet completed its first full
/// scan of the daemon's state. Callers should retry the operation on the
/// next dispatch rather than treating this as a resource failure.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("device state tracking has not completed its initial scan")]
pub struct NoInitialState;

/// Read access to the live device state mirror.
pub trait DeviceStateReader: Send + Sync {
    /// The daemon's view of `name`, or `None` if the daemon does not know
    /// the resource at all.
    fn resource_state(
        &self,
        name: &ResourceName,
    ) -> Result<Option<DeviceResource>, NoInitialState>;
}
