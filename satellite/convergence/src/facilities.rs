// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trait through which the convergence engine reports back to the rest of
//! the satellite (and, through it, the controller).
//!
//! Keeping this a trait lets the engine live in its own crate and be driven
//! in tests without a controller connection.

use crate::snapshots::SnapshotState;
use async_trait::async_trait;
use meridian_common::error::ErrorDetails;
use meridian_common::names::ResourceName;
use meridian_common::names::SnapshotName;
use meridian_common::names::VolumeNumber;
use uuid::Uuid;

/// Identifier of an event stream towards the controller.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventId {
    ResourceDeployment(ResourceName),
    InProgressSnapshot(ResourceName, SnapshotName),
}

/// Final outcome of one reconciliation pass for one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeploymentOutcome {
    Applied,
    Deleted,
    Failed(ErrorDetails),
    /// The pass could not run yet; it will be retried on a later dispatch.
    Retry(ErrorDetails),
}

#[async_trait]
pub trait SatelliteFacilities: Send + Sync {
    /// Record the outcome of a reconciliation pass for upstream reporting.
    fn set_deployment_state(
        &self,
        resource: &ResourceName,
        outcome: DeploymentOutcome,
    );

    /// Snapshot states recorded by the most recent pass for `resource`.
    fn snapshot_states(&self, resource: &ResourceName) -> Vec<SnapshotState>;

    fn set_snapshot_states(
        &self,
        resource: &ResourceName,
        states: Vec<SnapshotState>,
    );

    fn open_or_trigger_event(&self, event: EventId);

    fn close_event_stream(&self, event: EventId);

    /// Close an event stream even if it was never opened, so the far side
    /// reliably learns that the underlying operation is over.
    fn close_event_stream_even_if_not_open(&self, event: EventId);

    /// Ask the controller to assign the initial primary role for
    /// `resource` to this node.
    async fn request_primary(&self, resource: &ResourceName, uuid: Uuid);

    fn notify_resource_applied(&self, resource: &ResourceName);

    fn notify_resource_deleted(&self, resource: &ResourceName);

    fn notify_volume_deleted(
        &self,
        resource: &ResourceName,
        volume: VolumeNumber,
    );

    fn notify_snapshot_deleted(
        &self,
        resource: &ResourceName,
        snapshot: &SnapshotName,
    );
}
