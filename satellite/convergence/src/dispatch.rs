// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-resource reconciliation entry point.
//!
//! An external scheduler decides *when* a resource needs attention and
//! calls [`Dispatcher::dispatch_resource`]; this module decides *what* to
//! do. The caller guarantees at most one concurrent dispatch per resource
//! name; dispatches for different resources may run concurrently.
//!
//! No error escapes a dispatch. Every failure is converted into a
//! structured [`DeploymentOutcome`] and handed to the facilities layer for
//! reporting; the next dispatch starts from a fresh evaluation.

use crate::adm::DeviceAdm;
use crate::converge::ConvergenceActuator;
use crate::desired::DesiredState;
use crate::device_state::DeviceStateReader;
use crate::errors::ResourceError;
use crate::evaluate;
use crate::facilities::DeploymentOutcome;
use crate::facilities::EventId;
use crate::facilities::SatelliteFacilities;
use crate::snapshots::SnapshotCoordinator;
use camino::Utf8PathBuf;
use meridian_common::names::NodeName;
use meridian_common::names::ResourceName;
use meridian_common::names::VolumeNumber;
use satellite_storage::BackendRegistry;
use slog::Logger;
use slog::info;
use slog::trace;
use slog::warn;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

pub struct Dispatcher {
    log: Logger,
    state: Arc<DesiredState>,
    reader: Arc<dyn DeviceStateReader>,
    adm: Arc<dyn DeviceAdm>,
    backends: Arc<dyn BackendRegistry>,
    facilities: Arc<dyn SatelliteFacilities>,
    actuator: ConvergenceActuator,
    snapshots: SnapshotCoordinator,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: Logger,
        local_node: NodeName,
        config_dir: Utf8PathBuf,
        state: Arc<DesiredState>,
        reader: Arc<dyn DeviceStateReader>,
        adm: Arc<dyn DeviceAdm>,
        backends: Arc<dyn BackendRegistry>,
        facilities: Arc<dyn SatelliteFacilities>,
    ) -> Self {
        let actuator =
            ConvergenceActuator::new(log.clone(), local_node, config_dir);
        let snapshots = SnapshotCoordinator::new(log.clone());
        Self {
            log,
            state,
            reader,
            adm,
            backends,
            facilities,
            actuator,
            snapshots,
        }
    }

    /// Bound the backend existence probes tighter than the default.
    pub fn set_exists_timeout(&mut self, timeout: Duration) {
        self.actuator.set_exists_timeout(timeout);
    }

    /// Run one reconciliation pass for `name`.
    pub async fn dispatch_resource(&self, name: &ResourceName) {
        trace!(self.log, "dispatch begin"; "resource" => %name);

        let view = self.state.dispatch_view(name);
        let live = match self.reader.resource_state(name) {
            Ok(live) => live,
            Err(err) => {
                // Not fatal: the tracker simply has not finished its first
                // scan. Report and let the next dispatch retry.
                warn!(
                    self.log, "device state not ready, deferring dispatch";
                    "resource" => %name,
                );
                let details = ResourceError::from(err).details();
                self.facilities.set_deployment_state(
                    name,
                    DeploymentOutcome::Retry(details),
                );
                return;
            }
        };

        let snapshot_volumes: BTreeSet<VolumeNumber> = view
            .snapshots
            .iter()
            .flat_map(|s| s.volumes.iter().map(|v| v.number))
            .collect();
        let mut state = evaluate::evaluate(
            name,
            view.resource.as_ref(),
            live.as_ref(),
            &snapshot_volumes,
        );

        let result = match &view.resource {
            Some(resource) if resource.flags.delete => {
                self.actuator
                    .delete_resource(
                        name,
                        &view,
                        &mut state,
                        &*self.adm,
                        &*self.backends,
                        &*self.facilities,
                    )
                    .await
                    .map(|()| DeploymentOutcome::Deleted)
            }
            Some(resource) => self
                .actuator
                .converge(
                    &view,
                    resource,
                    &mut state,
                    &*self.adm,
                    &*self.backends,
                    &*self.facilities,
                )
                .await
                .map(|()| DeploymentOutcome::Applied),
            None if live.is_some() => {
                // Live on the device but gone from the desired model:
                // tear it down.
                info!(
                    self.log, "deleting resource absent from desired state";
                    "resource" => %name,
                );
                self.actuator
                    .delete_resource(
                        name,
                        &view,
                        &mut state,
                        &*self.adm,
                        &*self.backends,
                        &*self.facilities,
                    )
                    .await
                    .map(|()| DeploymentOutcome::Deleted)
            }
            None => Ok(DeploymentOutcome::Applied),
        };

        let snapshot_result = self
            .snapshots
            .reconcile(
                name,
                &view.snapshots,
                &mut state,
                &*self.adm,
                &*self.backends,
                &*self.facilities,
            )
            .await;

        let outcome = match (result, snapshot_result) {
            (Err(err), _) | (Ok(_), Err(err)) => {
                warn!(
                    self.log, "reconciliation failed";
                    "resource" => %name,
                    InlineErrorChain::new(&err),
                );
                DeploymentOutcome::Failed(err.details())
            }
            (Ok(outcome), Ok(_)) => outcome,
        };

        let deleted = outcome == DeploymentOutcome::Deleted;
        self.facilities.set_deployment_state(name, outcome);
        let event = EventId::ResourceDeployment(name.clone());
        if deleted {
            self.facilities.close_event_stream(event);
        } else {
            self.facilities.open_or_trigger_event(event);
        }

        trace!(self.log, "dispatch end"; "resource" => %name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_state::ConnectionState;
    use crate::device_state::DeviceResource;
    use crate::device_state::DeviceVolume;
    use crate::device_state::DiskState;
    use crate::device_state::Role;
    use crate::facilities::DeploymentOutcome;
    use crate::testing::AdmCall;
    use crate::testing::BackendCall;
    use crate::testing::FacilityEvent;
    use crate::testing::FakeAdm;
    use crate::testing::FakeBackend;
    use crate::testing::FakeFacilities;
    use crate::testing::FakeReader;
    use crate::testing::FakeRegistry;
    use crate::testing::example_node;
    use crate::testing::example_resource_with_volumes;
    use crate::testing::logger;
    use camino_tempfile::Utf8TempDir;
    use meridian_common::api::FullSyncSnapshot;
    use meridian_common::api::PROP_PRIMARY_SET;
    use meridian_common::api::PROP_STOR_POOL_NAME;
    use meridian_common::api::RestoreSource;
    use meridian_common::api::StorPoolSpec;

    struct Harness {
        config_dir: Utf8TempDir,
        reader: Arc<FakeReader>,
        adm: Arc<FakeAdm>,
        backend: Arc<FakeBackend>,
        facilities: Arc<FakeFacilities>,
        dispatcher: Dispatcher,
    }

    fn pool_spec(name: &str) -> StorPoolSpec {
        StorPoolSpec {
            name: name.parse().unwrap(),
            uuid: uuid::Uuid::new_v4(),
            props: Default::default(),
        }
    }

    fn harness(snapshot: FullSyncSnapshot) -> Harness {
        let config_dir = Utf8TempDir::new().unwrap();
        let state = Arc::new(DesiredState::new());
        state.replace_all(snapshot).unwrap();
        let reader = Arc::new(FakeReader::default());
        let adm = Arc::new(FakeAdm::default());
        let backend = Arc::new(FakeBackend::default());
        let facilities = Arc::new(FakeFacilities::default());
        let registry =
            Arc::new(FakeRegistry::single("pool0", backend.clone()));
        let dispatcher = Dispatcher::new(
            logger(),
            "alpha".parse().unwrap(),
            config_dir.path().to_path_buf(),
            state,
            reader.clone(),
            adm.clone(),
            registry,
            facilities.clone(),
        );
        Harness { config_dir, reader, adm, backend, facilities, dispatcher }
    }

    /// Desired state with one resource "r0" on pool0 with `volumes`
    /// volumes, peers on node beta.
    fn simple_sync(volumes: u16) -> FullSyncSnapshot {
        let mut resource =
            example_resource_with_volumes("r0", &["beta"], volumes);
        resource
            .dfn_props
            .insert(PROP_STOR_POOL_NAME.to_string(), "pool0".to_string());
        // The initial primary has already been assigned elsewhere.
        resource
            .dfn_props
            .insert(PROP_PRIMARY_SET.to_string(), "beta".to_string());
        FullSyncSnapshot {
            nodes: vec![example_node("alpha"), example_node("beta")],
            resources: vec![resource],
            storage_pools: vec![pool_spec("pool0")],
            ..Default::default()
        }
    }

    fn converged_device(volumes: u16) -> DeviceResource {
        let mut live = DeviceResource::default();
        live.role = Role::Secondary;
        live.connections
            .insert("beta".parse().unwrap(), ConnectionState::Connected);
        for number in 0..volumes {
            live.volumes.insert(
                VolumeNumber(number),
                DeviceVolume { disk: DiskState::UpToDate, client: false },
            );
        }
        live
    }

    fn rsc() -> ResourceName {
        "r0".parse().unwrap()
    }

    #[tokio::test]
    async fn fresh_resource_is_fully_provisioned() {
        let h = harness(simple_sync(2));
        h.dispatcher.dispatch_resource(&rsc()).await;

        // Both backing volumes created, meta data for both, adjust issued.
        let backend_calls = h.backend.calls.lock().unwrap().clone();
        let creates: Vec<_> = backend_calls
            .iter()
            .filter(|c| matches!(c, BackendCall::Create { .. }))
            .collect();
        assert_eq!(creates.len(), 2);

        let adm_calls = h.adm.calls.lock().unwrap().clone();
        assert!(adm_calls.contains(&AdmCall::CreateMetaData(
            rsc(),
            VolumeNumber(0),
            7
        )));
        assert!(adm_calls.contains(&AdmCall::CreateMetaData(
            rsc(),
            VolumeNumber(1),
            7
        )));
        assert!(adm_calls.contains(&AdmCall::Adjust(rsc())));

        // Configuration file written.
        let content = std::fs::read_to_string(
            h.config_dir.path().join("r0.res"),
        )
        .unwrap();
        assert!(content.contains("resource \"r0\" {"));

        assert_eq!(
            h.facilities.deployment.lock().unwrap().get(&rsc()),
            Some(&DeploymentOutcome::Applied)
        );
    }

    #[tokio::test]
    async fn converged_resource_issues_no_mutations() {
        let h = harness(simple_sync(1));
        h.backend.volumes.lock().unwrap().insert("r0_00000".to_string());
        h.reader.set(rsc(), converged_device(1));

        h.dispatcher.dispatch_resource(&rsc()).await;

        let backend_calls = h.backend.calls.lock().unwrap().clone();
        assert!(
            backend_calls.is_empty(),
            "unexpected backend calls: {backend_calls:?}"
        );
        let adm_calls = h.adm.calls.lock().unwrap().clone();
        assert!(
            adm_calls.is_empty(),
            "unexpected adm calls: {adm_calls:?}"
        );
        assert_eq!(
            h.facilities.deployment.lock().unwrap().get(&rsc()),
            Some(&DeploymentOutcome::Applied)
        );
    }

    #[tokio::test]
    async fn delete_flagged_resource_is_torn_down() {
        let mut sync = simple_sync(1);
        sync.resources[0].flags.delete = true;
        let h = harness(sync);
        h.backend.volumes.lock().unwrap().insert("r0_00000".to_string());
        let mut live = converged_device(1);
        live.role = Role::Primary;
        h.reader.set(rsc(), live);
        std::fs::write(h.config_dir.path().join("r0.res"), "old").unwrap();

        h.dispatcher.dispatch_resource(&rsc()).await;

        let adm_calls = h.adm.calls.lock().unwrap().clone();
        assert_eq!(adm_calls, vec![AdmCall::Down(rsc())]);
        assert!(!h.config_dir.path().join("r0.res").exists());
        let backend_calls = h.backend.calls.lock().unwrap().clone();
        assert!(backend_calls
            .contains(&BackendCall::Delete { name: "r0_00000".to_string() }));
        assert_eq!(
            h.facilities.deployment.lock().unwrap().get(&rsc()),
            Some(&DeploymentOutcome::Deleted)
        );
        let events = h.facilities.events.lock().unwrap().clone();
        assert!(events.contains(&FacilityEvent::ResourceDeleted(rsc())));
        assert!(events.contains(&FacilityEvent::Close(
            EventId::ResourceDeployment(rsc())
        )));
    }

    #[tokio::test]
    async fn uninitialized_device_state_defers_the_pass() {
        let h = harness(simple_sync(1));
        h.reader.clear();

        h.dispatcher.dispatch_resource(&rsc()).await;

        assert!(matches!(
            h.facilities.deployment.lock().unwrap().get(&rsc()),
            Some(DeploymentOutcome::Retry(_))
        ));
        assert!(h.backend.calls.lock().unwrap().is_empty());
        assert!(h.adm.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wedged_existence_probe_fails_the_pass() {
        let mut h = harness(simple_sync(1));
        h.backend
            .exists_delay
            .lock()
            .unwrap()
            .replace(Duration::from_secs(3600));
        h.dispatcher.set_exists_timeout(Duration::from_millis(50));

        h.dispatcher.dispatch_resource(&rsc()).await;

        let outcome =
            h.facilities.deployment.lock().unwrap().get(&rsc()).cloned();
        match outcome {
            Some(DeploymentOutcome::Failed(details)) => {
                // The volume-level timeout is lifted to the resource level
                // as the failure cause.
                assert!(
                    details
                        .cause
                        .as_deref()
                        .unwrap_or_default()
                        .contains("I/O timeout"),
                    "unexpected details: {details:?}"
                );
            }
            other => panic!("expected failed outcome, got {other:?}"),
        }
        // The pass aborted before any mutation.
        let backend_calls = h.backend.calls.lock().unwrap().clone();
        assert!(backend_calls.is_empty());
    }

    #[tokio::test]
    async fn rogue_live_resource_is_deleted() {
        // Resource known to the daemon but absent from the desired state.
        let h = harness(FullSyncSnapshot {
            nodes: vec![example_node("alpha")],
            ..Default::default()
        });
        h.reader.set(rsc(), converged_device(1));

        h.dispatcher.dispatch_resource(&rsc()).await;

        let adm_calls = h.adm.calls.lock().unwrap().clone();
        assert_eq!(adm_calls, vec![AdmCall::Down(rsc())]);
        // Backing storage of unknown volumes is left alone.
        assert!(h.backend.calls.lock().unwrap().is_empty());
        assert_eq!(
            h.facilities.deployment.lock().unwrap().get(&rsc()),
            Some(&DeploymentOutcome::Deleted)
        );
    }

    #[tokio::test]
    async fn new_primary_intent_promotes_then_demotes() {
        let mut sync = simple_sync(1);
        sync.resources[0].flags.create_primary = true;
        let h = harness(sync);
        h.backend.volumes.lock().unwrap().insert("r0_00000".to_string());
        h.reader.set(rsc(), converged_device(1));

        h.dispatcher.dispatch_resource(&rsc()).await;

        let adm_calls = h.adm.calls.lock().unwrap().clone();
        assert_eq!(
            adm_calls,
            vec![
                AdmCall::Primary(rsc(), true),
                AdmCall::Secondary(rsc()),
            ]
        );
    }

    #[tokio::test]
    async fn unassigned_primary_is_requested_from_controller() {
        let mut sync = simple_sync(1);
        sync.resources[0].dfn_props.remove(PROP_PRIMARY_SET);
        let h = harness(sync);
        h.backend.volumes.lock().unwrap().insert("r0_00000".to_string());
        h.reader.set(rsc(), converged_device(1));

        h.dispatcher.dispatch_resource(&rsc()).await;

        let events = h.facilities.events.lock().unwrap().clone();
        assert!(events.contains(&FacilityEvent::RequestPrimary(rsc())));
        // No local promotion without the controller's assignment.
        assert!(h.adm.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn existing_backing_volume_is_reused_and_probed_for_meta_data() {
        // The backing volume is already there but the daemon does not know
        // the resource yet, e.g. after a satellite restart.
        let h = harness(simple_sync(1));
        h.backend.volumes.lock().unwrap().insert("r0_00000".to_string());

        h.dispatcher.dispatch_resource(&rsc()).await;

        // The existing volume is grown to the required gross size instead
        // of being re-created.
        let gross = satellite_storage::metadata::gross_size(
            1 << 20,
            7,
            satellite_storage::metadata::DEFAULT_AL_STRIPES,
            satellite_storage::metadata::DEFAULT_AL_STRIPE_SIZE_KIB,
        )
        .unwrap();
        let backend_calls = h.backend.calls.lock().unwrap().clone();
        assert_eq!(
            backend_calls,
            vec![BackendCall::Resize {
                name: "r0_00000".to_string(),
                size_kib: gross,
            }]
        );
        // The probe found no meta data, so it is initialized.
        let adm_calls = h.adm.calls.lock().unwrap().clone();
        assert!(adm_calls.contains(&AdmCall::CreateMetaData(
            rsc(),
            VolumeNumber(0),
            7
        )));

        // Same situation, but the device already carries meta data (e.g. a
        // volume that was replicated before): it must not be initialized
        // again.
        let h = harness(simple_sync(1));
        h.backend.volumes.lock().unwrap().insert("r0_00000".to_string());
        h.adm
            .devices_with_md
            .lock()
            .unwrap()
            .insert("/dev/fake/r0_00000".into());

        h.dispatcher.dispatch_resource(&rsc()).await;

        let adm_calls = h.adm.calls.lock().unwrap().clone();
        assert!(!adm_calls
            .iter()
            .any(|c| matches!(c, AdmCall::CreateMetaData(..))));
        assert!(adm_calls.contains(&AdmCall::Adjust(rsc())));
    }

    #[tokio::test]
    async fn fresh_volume_with_restore_source_is_cloned_from_snapshot() {
        let mut sync = simple_sync(1);
        sync.resources[0].volumes[0].restore = Some(RestoreSource {
            resource: "r1".parse().unwrap(),
            snapshot: "s1".parse().unwrap(),
        });
        let h = harness(sync);

        h.dispatcher.dispatch_resource(&rsc()).await;

        let backend_calls = h.backend.calls.lock().unwrap().clone();
        assert_eq!(
            backend_calls,
            vec![BackendCall::Restore {
                src: "r1_00000".to_string(),
                snapshot: "s1".to_string(),
                dst: "r0_00000".to_string(),
            }]
        );
        // The restored copy brings the source's meta data along, so none
        // is initialized.
        let adm_calls = h.adm.calls.lock().unwrap().clone();
        assert!(!adm_calls
            .iter()
            .any(|c| matches!(c, AdmCall::CreateMetaData(..))));
        assert!(adm_calls.contains(&AdmCall::Adjust(rsc())));
        assert_eq!(
            h.facilities.deployment.lock().unwrap().get(&rsc()),
            Some(&DeploymentOutcome::Applied)
        );
    }

    #[tokio::test]
    async fn failed_volume_deletion_is_best_effort() {
        let mut sync = simple_sync(2);
        sync.resources[0].flags.delete = true;
        let h = harness(sync);
        h.backend.volumes.lock().unwrap().insert("r0_00000".to_string());
        h.backend.volumes.lock().unwrap().insert("r0_00001".to_string());
        h.backend
            .fail_deletes
            .lock()
            .unwrap()
            .insert("r0_00000".to_string());
        h.reader.set(rsc(), converged_device(2));

        h.dispatcher.dispatch_resource(&rsc()).await;

        // Deletion of volume 0 failed, but volume 1 was still cleaned up.
        let backend_calls = h.backend.calls.lock().unwrap().clone();
        assert_eq!(
            backend_calls,
            vec![
                BackendCall::Delete { name: "r0_00000".to_string() },
                BackendCall::Delete { name: "r0_00001".to_string() },
            ]
        );
        let events = h.facilities.events.lock().unwrap().clone();
        assert!(events.contains(&FacilityEvent::VolumeDeleted(
            rsc(),
            VolumeNumber(1)
        )));

        let outcome =
            h.facilities.deployment.lock().unwrap().get(&rsc()).cloned();
        match outcome {
            Some(DeploymentOutcome::Failed(details)) => {
                assert!(
                    details
                        .details
                        .as_deref()
                        .unwrap_or_default()
                        .contains("volumes: 0"),
                    "unexpected details: {details:?}"
                );
            }
            other => panic!("expected failed outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn diskless_resource_converges_without_backing_storage() {
        let mut sync = simple_sync(1);
        sync.resources[0].flags.diskless = true;
        sync.resources[0].dfn_props.remove(PROP_PRIMARY_SET);
        let h = harness(sync);

        h.dispatcher.dispatch_resource(&rsc()).await;

        assert!(h.backend.calls.lock().unwrap().is_empty());
        let adm_calls = h.adm.calls.lock().unwrap().clone();
        assert_eq!(adm_calls, vec![AdmCall::Adjust(rsc())]);

        let content = std::fs::read_to_string(
            h.config_dir.path().join("r0.res"),
        )
        .unwrap();
        assert!(content.contains("disk none;"));

        // A disk-less client never requests the primary role.
        let events = h.facilities.events.lock().unwrap().clone();
        assert!(!events
            .iter()
            .any(|e| matches!(e, FacilityEvent::RequestPrimary(_))));
        assert_eq!(
            h.facilities.deployment.lock().unwrap().get(&rsc()),
            Some(&DeploymentOutcome::Applied)
        );
    }

    #[tokio::test]
    async fn out_of_range_volume_parameters_fail_the_pass() {
        let mut sync = simple_sync(1);
        sync.resources[0].peer_slots = 0;
        let h = harness(sync);

        h.dispatcher.dispatch_resource(&rsc()).await;

        let outcome =
            h.facilities.deployment.lock().unwrap().get(&rsc()).cloned();
        match outcome {
            Some(DeploymentOutcome::Failed(details)) => {
                assert!(
                    details
                        .cause
                        .as_deref()
                        .unwrap_or_default()
                        .contains("meta data size"),
                    "unexpected details: {details:?}"
                );
            }
            other => panic!("expected failed outcome, got {other:?}"),
        }
        assert!(h.backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn volume_marked_for_delete_is_removed_while_rest_converges() {
        let mut sync = simple_sync(2);
        sync.resources[0].volumes[1].flags.delete = true;
        let h = harness(sync);
        h.backend.volumes.lock().unwrap().insert("r0_00000".to_string());
        h.backend.volumes.lock().unwrap().insert("r0_00001".to_string());
        h.reader.set(rsc(), converged_device(2));

        h.dispatcher.dispatch_resource(&rsc()).await;

        let backend_calls = h.backend.calls.lock().unwrap().clone();
        assert_eq!(
            backend_calls,
            vec![BackendCall::Delete { name: "r0_00001".to_string() }]
        );
        let events = h.facilities.events.lock().unwrap().clone();
        assert!(events.contains(&FacilityEvent::VolumeDeleted(
            rsc(),
            VolumeNumber(1)
        )));
        // Deleting a volume leaves the resource adjusted and applied.
        let adm_calls = h.adm.calls.lock().unwrap().clone();
        assert!(adm_calls.contains(&AdmCall::Adjust(rsc())));
        assert_eq!(
            h.facilities.deployment.lock().unwrap().get(&rsc()),
            Some(&DeploymentOutcome::Applied)
        );
    }
}
