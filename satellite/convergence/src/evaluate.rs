// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Classification of live device state against the desired model.
//!
//! [`evaluate`] is pure: it reads the desired resource and the daemon's
//! reported state and produces a fresh [`ResourceState`] scratchpad for the
//! actuator. It never calls out and never mutates its inputs, which is what
//! makes the classification testable without a live daemon. The scratchpad
//! is discarded at the end of the pass; every pass recomputes it so that
//! the engine cannot drift from reality.

use crate::device_state::DeviceResource;
use crate::device_state::DiskState;
use crate::device_state::Role;
use camino::Utf8PathBuf;
use meridian_common::api::DesiredResource;
use meridian_common::api::RestoreSource;
use meridian_common::names::MinorNumber;
use meridian_common::names::ResourceName;
use meridian_common::names::StorPoolName;
use meridian_common::names::VolumeNumber;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::btree_map::Entry;

/// Name of the backing volume for one volume of a resource, as created in
/// the storage pool.
pub fn backing_volume_name(rsc: &ResourceName, vlm: VolumeNumber) -> String {
    format!("{}_{:05}", rsc, vlm.0)
}

/// Per-volume scratchpad for one reconciliation pass.
#[derive(Clone, Debug)]
pub struct VolumeState {
    pub number: VolumeNumber,
    /// Name of the backing volume in its storage pool.
    pub backing_name: String,
    /// The daemon reports this volume.
    pub present: bool,
    pub has_disk: bool,
    pub has_meta_data: bool,
    /// Whether the actuator still needs to probe for existing meta data.
    pub check_meta_data: bool,
    pub disk_failed: bool,
    pub marked_for_delete: bool,
    /// Known to the daemon but not to the desired model; left alone by the
    /// actuator and only surfaced as an anomaly.
    pub skip: bool,
    pub disk_state: Option<DiskState>,
    pub net_size_kib: u64,
    pub gross_size_kib: Option<u64>,
    pub minor: Option<MinorNumber>,
    pub peer_slots: u8,
    pub encrypted: bool,
    pub restore: Option<RestoreSource>,
    /// Storage pool resolved by the actuator, cached for the pass.
    pub pool: Option<StorPoolName>,
    /// Block device path, known once backing storage is resolved.
    pub backing_path: Option<Utf8PathBuf>,
}

impl VolumeState {
    fn new(rsc: &ResourceName, number: VolumeNumber) -> Self {
        Self {
            number,
            backing_name: backing_volume_name(rsc, number),
            present: false,
            has_disk: false,
            has_meta_data: false,
            check_meta_data: true,
            disk_failed: false,
            marked_for_delete: false,
            skip: false,
            disk_state: None,
            net_size_kib: 0,
            gross_size_kib: None,
            minor: None,
            peer_slots: 0,
            encrypted: false,
            restore: None,
            pool: None,
            backing_path: None,
        }
    }
}

/// Per-resource scratchpad for one reconciliation pass. Never persisted
/// and never shared across passes.
#[derive(Clone, Debug, Default)]
pub struct ResourceState {
    /// The daemon knows the resource.
    pub present: bool,
    pub primary: bool,
    /// I/O is suspended at user request.
    pub suspended_user: bool,
    /// Runtime state deviates from the configuration; an adjust is needed.
    pub requires_adjust: bool,
    pub volumes: BTreeMap<VolumeNumber, VolumeState>,
}

/// Build the scratchpad for one pass by merging the desired model with the
/// daemon's live report.
///
/// `snapshot_volumes` are volume numbers referenced by in-progress
/// snapshots; they get a volume state even if the desired model no longer
/// carries them, so snapshot cleanup can still find its targets.
pub fn evaluate(
    name: &ResourceName,
    desired: Option<&DesiredResource>,
    live: Option<&DeviceResource>,
    snapshot_volumes: &BTreeSet<VolumeNumber>,
) -> ResourceState {
    let mut state = ResourceState::default();

    // One volume state per volume number referenced by either the desired
    // model or an in-progress snapshot.
    if let Some(desired) = desired {
        for def in &desired.volumes {
            let mut vlm = VolumeState::new(name, def.number);
            vlm.net_size_kib = def.size_kib;
            vlm.minor = Some(def.minor);
            vlm.peer_slots = desired.peer_slots;
            vlm.encrypted = def.flags.encrypted;
            vlm.marked_for_delete = def.flags.delete || desired.flags.delete;
            vlm.restore = def.restore.clone();
            if vlm.marked_for_delete {
                state.requires_adjust = true;
            }
            state.volumes.insert(def.number, vlm);
        }
    }
    for number in snapshot_volumes {
        state
            .volumes
            .entry(*number)
            .or_insert_with(|| VolumeState::new(name, *number));
    }

    let Some(live) = live else {
        state.present = false;
        state.requires_adjust = true;
        return state;
    };

    state.present = true;
    state.suspended_user = live.suspended_user;
    match live.role {
        Role::Unknown => state.requires_adjust = true,
        Role::Primary => state.primary = true,
        Role::Secondary => (),
    }

    // Every peer of the local instance must have a healthy link.
    if let Some(desired) = desired {
        for peer in &desired.peers {
            match live.connections.get(&peer.node) {
                Some(conn) if conn.is_healthy() => (),
                Some(_) | None => state.requires_adjust = true,
            }
        }
    }

    for (number, dev_vlm) in &live.volumes {
        let vlm = match state.volumes.entry(*number) {
            Entry::Vacant(entry) => {
                // The daemon reports a volume nobody asked for. Leave its
                // backing storage alone, but adjust the resource so the
                // device configuration matches the desired model again.
                let mut vlm = VolumeState::new(name, *number);
                vlm.present = true;
                vlm.skip = true;
                vlm.disk_state = Some(dev_vlm.disk);
                entry.insert(vlm);
                state.requires_adjust = true;
                continue;
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };
        vlm.present = true;
        vlm.disk_state = Some(dev_vlm.disk);
        match dev_vlm.disk {
            DiskState::Diskless => {
                if !dev_vlm.client {
                    vlm.disk_failed = true;
                    state.requires_adjust = true;
                }
            }
            DiskState::Detaching | DiskState::Failed => {
                vlm.disk_failed = true;
                state.requires_adjust = true;
            }
            DiskState::Negotiating | DiskState::Unknown => {
                // The local disk state should not be unknown; try
                // adjusting anyway.
                state.requires_adjust = true;
            }
            DiskState::UpToDate
            | DiskState::Consistent
            | DiskState::Inconsistent
            | DiskState::Outdated => {
                vlm.has_meta_data = true;
                vlm.check_meta_data = false;
                vlm.has_disk = true;
            }
            DiskState::Attaching => {
                vlm.has_disk = true;
            }
        }
    }

    // Volumes the desired model wants but the daemon does not report.
    if let Some(desired) = desired {
        for def in &desired.volumes {
            let known_to_device = state
                .volumes
                .get(&def.number)
                .map(|v| v.present)
                .unwrap_or(false);
            if !known_to_device {
                state.requires_adjust = true;
            }
        }
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_state::ConnectionState;
    use crate::device_state::DeviceVolume;
    use crate::testing::example_resource;
    use crate::testing::example_resource_with_volumes;

    fn rsc_name() -> ResourceName {
        "r0".parse().unwrap()
    }

    fn live_with_volume(disk: DiskState, client: bool) -> DeviceResource {
        let mut live = DeviceResource::default();
        live.role = Role::Secondary;
        live.volumes
            .insert(VolumeNumber(0), DeviceVolume { disk, client });
        live
    }

    #[test]
    fn absent_live_resource_requires_adjust() {
        let desired = example_resource_with_volumes("r0", &[], 2);
        let state =
            evaluate(&rsc_name(), Some(&desired), None, &BTreeSet::new());
        assert!(!state.present);
        assert!(state.requires_adjust);
        assert_eq!(state.volumes.len(), 2);
        assert!(state.volumes.values().all(|v| !v.has_disk));
    }

    #[test]
    fn disk_state_translation() {
        let cases = [
            // (disk state, client, has_disk, has_md, disk_failed, adjust)
            (DiskState::UpToDate, false, true, true, false, false),
            (DiskState::Consistent, false, true, true, false, false),
            (DiskState::Inconsistent, false, true, true, false, false),
            (DiskState::Outdated, false, true, true, false, false),
            (DiskState::Attaching, false, true, false, false, false),
            (DiskState::Diskless, true, false, false, false, false),
            (DiskState::Diskless, false, false, false, true, true),
            (DiskState::Detaching, false, false, false, true, true),
            (DiskState::Failed, false, false, false, true, true),
            (DiskState::Negotiating, false, false, false, false, true),
            (DiskState::Unknown, false, false, false, false, true),
        ];
        for (disk, client, has_disk, has_md, failed, adjust) in cases {
            let desired = example_resource_with_volumes("r0", &[], 1);
            let live = live_with_volume(disk, client);
            let state = evaluate(
                &rsc_name(),
                Some(&desired),
                Some(&live),
                &BTreeSet::new(),
            );
            let vlm = &state.volumes[&VolumeNumber(0)];
            assert_eq!(vlm.has_disk, has_disk, "{disk:?} has_disk");
            assert_eq!(vlm.has_meta_data, has_md, "{disk:?} has_meta_data");
            assert_eq!(vlm.disk_failed, failed, "{disk:?} disk_failed");
            assert_eq!(
                state.requires_adjust, adjust,
                "{disk:?} requires_adjust"
            );
        }
    }

    #[test]
    fn unhealthy_peer_connection_requires_adjust() {
        let desired = example_resource_with_volumes("r0", &["beta"], 1);
        let unhealthy = [
            ConnectionState::StandAlone,
            ConnectionState::Disconnecting,
            ConnectionState::Unconnected,
            ConnectionState::Timeout,
            ConnectionState::BrokenPipe,
            ConnectionState::NetworkFailure,
            ConnectionState::ProtocolError,
            ConnectionState::TearDown,
            ConnectionState::Unknown,
        ];
        for conn in unhealthy {
            let mut live = live_with_volume(DiskState::UpToDate, false);
            live.connections.insert("beta".parse().unwrap(), conn);
            let state = evaluate(
                &rsc_name(),
                Some(&desired),
                Some(&live),
                &BTreeSet::new(),
            );
            assert!(state.requires_adjust, "{conn:?} should force adjust");
        }

        for conn in [ConnectionState::Connecting, ConnectionState::Connected] {
            let mut live = live_with_volume(DiskState::UpToDate, false);
            live.connections.insert("beta".parse().unwrap(), conn);
            let state = evaluate(
                &rsc_name(),
                Some(&desired),
                Some(&live),
                &BTreeSet::new(),
            );
            assert!(!state.requires_adjust, "{conn:?} should be acceptable");
        }
    }

    #[test]
    fn missing_peer_connection_requires_adjust() {
        let desired = example_resource_with_volumes("r0", &["beta"], 1);
        let live = live_with_volume(DiskState::UpToDate, false);
        let state = evaluate(
            &rsc_name(),
            Some(&desired),
            Some(&live),
            &BTreeSet::new(),
        );
        assert!(state.requires_adjust);
    }

    #[test]
    fn residual_device_volume_is_skipped_and_forces_adjust() {
        let desired = example_resource_with_volumes("r0", &[], 1);
        let mut live = live_with_volume(DiskState::UpToDate, false);
        live.volumes.insert(
            VolumeNumber(9),
            DeviceVolume { disk: DiskState::UpToDate, client: false },
        );
        let state = evaluate(
            &rsc_name(),
            Some(&desired),
            Some(&live),
            &BTreeSet::new(),
        );
        let rogue = &state.volumes[&VolumeNumber(9)];
        assert!(rogue.skip);
        assert!(rogue.present);
        assert!(state.requires_adjust);
    }

    #[test]
    fn snapshot_volume_numbers_are_retained_without_skip() {
        let desired = example_resource("r0", &[]);
        let live = live_with_volume(DiskState::UpToDate, false);
        let snapshot_volumes = BTreeSet::from([VolumeNumber(0)]);
        let state = evaluate(
            &rsc_name(),
            Some(&desired),
            Some(&live),
            &snapshot_volumes,
        );
        let vlm = &state.volumes[&VolumeNumber(0)];
        assert!(!vlm.skip);
        assert!(vlm.has_disk);
    }

    #[test]
    fn desired_volume_missing_from_device_requires_adjust() {
        let desired = example_resource_with_volumes("r0", &[], 2);
        // Device reports volume 0 only.
        let live = live_with_volume(DiskState::UpToDate, false);
        let state = evaluate(
            &rsc_name(),
            Some(&desired),
            Some(&live),
            &BTreeSet::new(),
        );
        assert!(state.requires_adjust);
    }

    #[test]
    fn unknown_role_requires_adjust_and_primary_is_recorded() {
        let desired = example_resource_with_volumes("r0", &[], 1);
        let mut live = live_with_volume(DiskState::UpToDate, false);
        live.role = Role::Unknown;
        let state = evaluate(
            &rsc_name(),
            Some(&desired),
            Some(&live),
            &BTreeSet::new(),
        );
        assert!(state.requires_adjust);

        let mut live = live_with_volume(DiskState::UpToDate, false);
        live.role = Role::Primary;
        let state = evaluate(
            &rsc_name(),
            Some(&desired),
            Some(&live),
            &BTreeSet::new(),
        );
        assert!(state.primary);
        assert!(!state.requires_adjust);
    }

    #[test]
    fn delete_marked_volume_requires_adjust() {
        let mut desired = example_resource_with_volumes("r0", &[], 1);
        desired.volumes[0].flags.delete = true;
        let live = live_with_volume(DiskState::UpToDate, false);
        let state = evaluate(
            &rsc_name(),
            Some(&desired),
            Some(&live),
            &BTreeSet::new(),
        );
        assert!(state.volumes[&VolumeNumber(0)].marked_for_delete);
        assert!(state.requires_adjust);
    }
}
