// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Snapshot lifecycle for one resource.
//!
//! The controller runs snapshots as a small distributed protocol: suspend
//! I/O everywhere, take the snapshot everywhere, resume, and eventually
//! delete. The satellite's part is intentionally dumb: every pass it
//! compares the desired snapshot flags with what was already applied
//! (tracked by the facilities layer) and performs the missing steps.

use crate::adm::DeviceAdm;
use crate::errors::ResourceError;
use crate::errors::VolumeError;
use crate::evaluate::ResourceState;
use crate::device_state::DiskState;
use crate::facilities::EventId;
use crate::facilities::SatelliteFacilities;
use meridian_common::api::SnapshotSpec;
use meridian_common::error::ErrorDetails;
use meridian_common::names::ResourceName;
use meridian_common::names::SnapshotName;
use meridian_common::names::VolumeNumber;
use satellite_storage::BackendRegistry;
use satellite_storage::Provisioning;
use satellite_storage::VolumeBackend;
use slog::Logger;
use slog::error;
use slog::trace;
use std::collections::BTreeSet;
use std::sync::Arc;

/// What this satellite has done about one snapshot, recomputed every pass
/// and reported upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotState {
    pub name: SnapshotName,
    pub suspended: bool,
    pub taken: bool,
    pub deleted: bool,
}

pub struct SnapshotCoordinator {
    log: Logger,
}

/// Lift a per-volume snapshot failure to the resource level, the same way
/// storage failures are lifted during convergence.
fn wrap_snapshot_error(
    action: &str,
    resource: &ResourceName,
    snapshot: &SnapshotName,
    err: VolumeError,
) -> ResourceError {
    let details = ErrorDetails::new(format!(
        "{action} of snapshot {snapshot:?} for resource {resource:?} volume \
         {} failed",
        err.volume,
    ))
    .cause(err.details.message.clone());
    ResourceError::Volume { details, source: err }
}

impl SnapshotCoordinator {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }

    /// Reconcile all in-progress snapshots of `resource`, returning the
    /// states recorded for this pass.
    pub async fn reconcile(
        &self,
        resource: &ResourceName,
        snapshots: &[SnapshotSpec],
        state: &mut ResourceState,
        adm: &dyn DeviceAdm,
        backends: &dyn BackendRegistry,
        facilities: &dyn SatelliteFacilities,
    ) -> Result<Vec<SnapshotState>, ResourceError> {
        trace!(
            self.log, "reconciling snapshots";
            "resource" => %resource,
            "count" => snapshots.len(),
        );

        let in_progress = snapshots.iter().any(|s| !s.flags.delete);
        let should_suspend = snapshots.iter().any(|s| s.flags.suspend);
        self.adjust_suspended(resource, should_suspend, state, adm).await?;

        let already_taken: BTreeSet<SnapshotName> = facilities
            .snapshot_states(resource)
            .into_iter()
            .filter(|s| s.taken)
            .map(|s| s.name)
            .collect();

        let mut deleted = BTreeSet::new();
        let mut newly_taken = BTreeSet::new();
        for snapshot in snapshots {
            if snapshot.flags.delete {
                self.delete_snapshot(resource, snapshot, state, backends)
                    .await?;
                facilities.notify_snapshot_deleted(resource, &snapshot.name);
                deleted.insert(snapshot.name.clone());
            } else if snapshot.flags.take
                && !already_taken.contains(&snapshot.name)
            {
                self.take_snapshot(resource, snapshot, state, backends)
                    .await?;
                newly_taken.insert(snapshot.name.clone());
            }
        }

        let states: Vec<SnapshotState> = snapshots
            .iter()
            .map(|s| SnapshotState {
                name: s.name.clone(),
                suspended: should_suspend,
                taken: already_taken.contains(&s.name)
                    || newly_taken.contains(&s.name),
                deleted: deleted.contains(&s.name),
            })
            .collect();
        facilities.set_snapshot_states(resource, states.clone());

        if in_progress {
            for snapshot in snapshots {
                facilities.open_or_trigger_event(EventId::InProgressSnapshot(
                    resource.clone(),
                    snapshot.name.clone(),
                ));
            }
        } else {
            // Close even streams that were never opened so the controller
            // reliably learns that deleted snapshots are gone.
            for snap_state in facilities.snapshot_states(resource) {
                facilities.close_event_stream_even_if_not_open(
                    EventId::InProgressSnapshot(
                        resource.clone(),
                        snap_state.name,
                    ),
                );
            }
        }

        Ok(states)
    }

    /// Idempotently bring the resource's I/O suspension in line with the
    /// desired snapshot flags.
    async fn adjust_suspended(
        &self,
        resource: &ResourceName,
        should_suspend: bool,
        state: &mut ResourceState,
        adm: &dyn DeviceAdm,
    ) -> Result<(), ResourceError> {
        let suspend_err = |verb: &'static str| {
            move |source| ResourceError::SuspendResume {
                details: ErrorDetails::new(format!(
                    "{verb} of resource I/O failed",
                ))
                .abort(format!(
                    "Operations on resource {resource:?} were aborted"
                ))
                .cause(format!(
                    "The external command to {} resource I/O failed",
                    verb.to_lowercase(),
                )),
                source,
            }
        };
        if should_suspend && !state.suspended_user {
            trace!(self.log, "suspending I/O"; "resource" => %resource);
            adm.suspend_io(resource).await.map_err(suspend_err("Suspend"))?;
            state.suspended_user = true;
        } else if !should_suspend && state.suspended_user {
            trace!(self.log, "resuming I/O"; "resource" => %resource);
            adm.resume_io(resource).await.map_err(suspend_err("Resume"))?;
            state.suspended_user = false;
        }
        Ok(())
    }

    fn backend_for_snapshot_volume(
        &self,
        resource: &ResourceName,
        snapshot: &SnapshotSpec,
        state: &mut ResourceState,
        backends: &dyn BackendRegistry,
        number: VolumeNumber,
    ) -> Option<(Arc<dyn VolumeBackend>, String)> {
        let vlm = state.volumes.get_mut(&number)?;
        if vlm.pool.is_none() {
            // Resolve through the pool the snapshot volume declares; the
            // volume may no longer be part of the desired resource.
            let declared = snapshot
                .volumes
                .iter()
                .find(|v| v.number == number)
                .map(|v| v.pool.clone());
            match declared {
                Some(pool) if backends.backend_for(&pool).is_some() => {
                    vlm.pool = Some(pool);
                }
                _ => {
                    error!(
                        self.log,
                        "no storage pool driver for snapshot volume";
                        "resource" => %resource,
                        "snapshot" => %snapshot.name,
                        "volume" => %number,
                    );
                }
            }
        }
        let backend = vlm.pool.as_ref().and_then(|p| backends.backend_for(p))?;
        Some((backend, vlm.backing_name.clone()))
    }

    async fn delete_snapshot(
        &self,
        resource: &ResourceName,
        snapshot: &SnapshotSpec,
        state: &mut ResourceState,
        backends: &dyn BackendRegistry,
    ) -> Result<(), ResourceError> {
        for snap_vlm in &snapshot.volumes {
            let Some((backend, backing_name)) = self
                .backend_for_snapshot_volume(
                    resource,
                    snapshot,
                    state,
                    backends,
                    snap_vlm.number,
                )
            else {
                continue;
            };
            backend
                .delete_snapshot(&backing_name, snapshot.name.as_str())
                .await
                .map_err(|source| {
                    wrap_snapshot_error(
                        "Deletion",
                        resource,
                        &snapshot.name,
                        VolumeError::with_source(
                            snap_vlm.number,
                            ErrorDetails::new(
                                "Deletion of the snapshot failed",
                            ),
                            source,
                        ),
                    )
                })?;
        }
        Ok(())
    }

    async fn take_snapshot(
        &self,
        resource: &ResourceName,
        snapshot: &SnapshotSpec,
        state: &mut ResourceState,
        backends: &dyn BackendRegistry,
    ) -> Result<(), ResourceError> {
        for snap_vlm in &snapshot.volumes {
            // A snapshot of anything but current data would silently hand
            // the user a stale copy, so refuse.
            let disk_state = state
                .volumes
                .get(&snap_vlm.number)
                .and_then(|v| v.disk_state);
            if disk_state != Some(DiskState::UpToDate) {
                return Err(wrap_snapshot_error(
                    "Deployment",
                    resource,
                    &snapshot.name,
                    VolumeError::new(
                        snap_vlm.number,
                        ErrorDetails::new(format!(
                            "Refusing to take snapshot {:?} for resource \
                             {resource:?} volume {}: the volume is not \
                             UpToDate",
                            snapshot.name, snap_vlm.number,
                        ))
                        .cause(format!(
                            "The volume's disk state is {}",
                            disk_state
                                .map(DiskState::as_str)
                                .unwrap_or("not reported"),
                        )),
                    ),
                ));
            }

            let Some((backend, backing_name)) = self
                .backend_for_snapshot_volume(
                    resource,
                    snapshot,
                    state,
                    backends,
                    snap_vlm.number,
                )
            else {
                continue;
            };
            if backend.provisioning() != Provisioning::Thin {
                return Err(wrap_snapshot_error(
                    "Deployment",
                    resource,
                    &snapshot.name,
                    VolumeError::new(
                        snap_vlm.number,
                        ErrorDetails::new(
                            "The volume's storage pool does not support \
                             snapshots",
                        )
                        .correction(
                            "Move the volume to a thin-provisioned storage \
                             pool to use snapshots",
                        ),
                    ),
                ));
            }
            backend
                .create_snapshot(&backing_name, snapshot.name.as_str())
                .await
                .map_err(|source| {
                    wrap_snapshot_error(
                        "Deployment",
                        resource,
                        &snapshot.name,
                        VolumeError::with_source(
                            snap_vlm.number,
                            ErrorDetails::new(
                                "Creation of the snapshot failed",
                            ),
                            source,
                        ),
                    )
                })?;
        }
        Ok(())
    }
}
