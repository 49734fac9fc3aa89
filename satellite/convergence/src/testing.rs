// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fake collaborators for driving the convergence engine without a live
//! replication daemon or storage tooling. Used by this crate's tests and,
//! behind the `testing` feature, by consumers.

use crate::adm::AdmError;
use crate::adm::DeviceAdm;
use crate::device_state::DeviceResource;
use crate::device_state::DeviceStateReader;
use crate::device_state::NoInitialState;
use crate::facilities::DeploymentOutcome;
use crate::facilities::EventId;
use crate::facilities::SatelliteFacilities;
use crate::snapshots::SnapshotState;
use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use meridian_common::api::DesiredResource;
use meridian_common::api::NodeSpec;
use meridian_common::api::ResourceFlags;
use meridian_common::api::ResourcePeer;
use meridian_common::api::SnapshotFlags;
use meridian_common::api::SnapshotSpec;
use meridian_common::api::SnapshotVolumeSpec;
use meridian_common::api::VolumeDefSpec;
use meridian_common::api::VolumeFlags;
use meridian_common::names::MinorNumber;
use meridian_common::names::NodeName;
use meridian_common::names::ResourceName;
use meridian_common::names::SnapshotName;
use meridian_common::names::StorPoolName;
use meridian_common::names::VolumeNumber;
use satellite_storage::BackendRegistry;
use satellite_storage::Provisioning;
use satellite_storage::StorageError;
use satellite_storage::VolumeBackend;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

pub fn logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

pub fn example_node(name: &str) -> NodeSpec {
    NodeSpec {
        name: name.parse().unwrap(),
        uuid: Uuid::new_v4(),
        addr: std::net::IpAddr::from([192, 168, 10, 1]),
        props: BTreeMap::new(),
    }
}

/// A resource on node-id 0 with one peer per entry of `peer_nodes` and no
/// volumes.
pub fn example_resource(name: &str, peer_nodes: &[&str]) -> DesiredResource {
    DesiredResource {
        name: name.parse().unwrap(),
        uuid: Uuid::new_v4(),
        node_id: 0,
        port: 7000,
        peer_slots: 7,
        flags: ResourceFlags::default(),
        props: BTreeMap::new(),
        dfn_props: BTreeMap::new(),
        volumes: Vec::new(),
        peers: peer_nodes
            .iter()
            .enumerate()
            .map(|(i, node)| ResourcePeer {
                node: node.parse().unwrap(),
                node_id: (i + 1) as u8,
                diskless: false,
            })
            .collect(),
    }
}

/// Like [`example_resource`], with `volumes` one-GiB volumes numbered from
/// zero.
pub fn example_resource_with_volumes(
    name: &str,
    peer_nodes: &[&str],
    volumes: u16,
) -> DesiredResource {
    let mut resource = example_resource(name, peer_nodes);
    resource.volumes = (0..volumes)
        .map(|number| VolumeDefSpec {
            number: VolumeNumber(number),
            size_kib: 1 << 20,
            minor: MinorNumber(1000 + u32::from(number)),
            flags: VolumeFlags::default(),
            props: BTreeMap::new(),
            dfn_props: BTreeMap::new(),
            restore: None,
        })
        .collect();
    resource
}

pub fn example_snapshot(resource: &str, name: &str) -> SnapshotSpec {
    SnapshotSpec {
        resource: resource.parse().unwrap(),
        name: name.parse().unwrap(),
        uuid: Uuid::new_v4(),
        flags: SnapshotFlags::default(),
        volumes: vec![SnapshotVolumeSpec {
            number: VolumeNumber(0),
            pool: "pool0".parse().unwrap(),
        }],
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmCall {
    Adjust(ResourceName),
    Down(ResourceName),
    Primary(ResourceName, bool),
    Secondary(ResourceName),
    SuspendIo(ResourceName),
    ResumeIo(ResourceName),
    CreateMetaData(ResourceName, VolumeNumber, u8),
}

/// Records every admin command; meta-data probes answer from
/// `devices_with_md`.
#[derive(Default)]
pub struct FakeAdm {
    pub calls: Mutex<Vec<AdmCall>>,
    pub devices_with_md: Mutex<BTreeSet<Utf8PathBuf>>,
}

#[async_trait]
impl DeviceAdm for FakeAdm {
    async fn adjust(&self, rsc: &ResourceName) -> Result<(), AdmError> {
        self.calls.lock().unwrap().push(AdmCall::Adjust(rsc.clone()));
        Ok(())
    }

    async fn down(&self, rsc: &ResourceName) -> Result<(), AdmError> {
        self.calls.lock().unwrap().push(AdmCall::Down(rsc.clone()));
        Ok(())
    }

    async fn primary(
        &self,
        rsc: &ResourceName,
        force: bool,
    ) -> Result<(), AdmError> {
        self.calls.lock().unwrap().push(AdmCall::Primary(rsc.clone(), force));
        Ok(())
    }

    async fn secondary(&self, rsc: &ResourceName) -> Result<(), AdmError> {
        self.calls.lock().unwrap().push(AdmCall::Secondary(rsc.clone()));
        Ok(())
    }

    async fn suspend_io(&self, rsc: &ResourceName) -> Result<(), AdmError> {
        self.calls.lock().unwrap().push(AdmCall::SuspendIo(rsc.clone()));
        Ok(())
    }

    async fn resume_io(&self, rsc: &ResourceName) -> Result<(), AdmError> {
        self.calls.lock().unwrap().push(AdmCall::ResumeIo(rsc.clone()));
        Ok(())
    }

    async fn create_meta_data(
        &self,
        rsc: &ResourceName,
        volume: VolumeNumber,
        peer_slots: u8,
    ) -> Result<(), AdmError> {
        self.calls.lock().unwrap().push(AdmCall::CreateMetaData(
            rsc.clone(),
            volume,
            peer_slots,
        ));
        Ok(())
    }

    async fn has_meta_data(
        &self,
        backing: &Utf8Path,
        _minor: MinorNumber,
    ) -> Result<bool, AdmError> {
        Ok(self.devices_with_md.lock().unwrap().contains(backing))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    Create { name: String, size_kib: u64 },
    Resize { name: String, size_kib: u64 },
    Delete { name: String },
    CreateSnapshot { name: String, snapshot: String },
    DeleteSnapshot { name: String, snapshot: String },
    Restore { src: String, snapshot: String, dst: String },
}

/// In-memory storage backend. Thin-provisioned by default so snapshot
/// tests work; flip `fat` for a pool without snapshot support.
pub struct FakeBackend {
    pub fat: bool,
    pub volumes: Mutex<BTreeSet<String>>,
    pub snapshots: Mutex<BTreeSet<(String, String)>>,
    pub calls: Mutex<Vec<BackendCall>>,
    /// Simulated latency of `exists` probes, for timeout tests.
    pub exists_delay: Mutex<Option<Duration>>,
    /// Backing volumes whose deletion fails, for best-effort cleanup tests.
    pub fail_deletes: Mutex<BTreeSet<String>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            fat: false,
            volumes: Mutex::new(BTreeSet::new()),
            snapshots: Mutex::new(BTreeSet::new()),
            calls: Mutex::new(Vec::new()),
            exists_delay: Mutex::new(None),
            fail_deletes: Mutex::new(BTreeSet::new()),
        }
    }
}

#[async_trait]
impl VolumeBackend for FakeBackend {
    fn provisioning(&self) -> Provisioning {
        if self.fat { Provisioning::Fat } else { Provisioning::Thin }
    }

    async fn create(
        &self,
        name: &str,
        size_kib: u64,
        _key: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        self.calls.lock().unwrap().push(BackendCall::Create {
            name: name.to_string(),
            size_kib,
        });
        self.volumes.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn resize(
        &self,
        name: &str,
        size_kib: u64,
    ) -> Result<(), StorageError> {
        self.calls.lock().unwrap().push(BackendCall::Resize {
            name: name.to_string(),
            size_kib,
        });
        Ok(())
    }

    async fn delete(
        &self,
        name: &str,
        _encrypted: bool,
    ) -> Result<(), StorageError> {
        self.calls
            .lock()
            .unwrap()
            .push(BackendCall::Delete { name: name.to_string() });
        if self.fail_deletes.lock().unwrap().contains(name) {
            return Err(StorageError::CommandFailed {
                cause: format!("simulated deletion failure for {name}"),
            });
        }
        self.volumes.lock().unwrap().remove(name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        let delay = *self.exists_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.volumes.lock().unwrap().contains(name))
    }

    fn path(
        &self,
        name: &str,
        _encrypted: bool,
    ) -> Result<Utf8PathBuf, StorageError> {
        Ok(Utf8PathBuf::from(format!("/dev/fake/{name}")))
    }

    async fn create_snapshot(
        &self,
        name: &str,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        self.calls.lock().unwrap().push(BackendCall::CreateSnapshot {
            name: name.to_string(),
            snapshot: snapshot.to_string(),
        });
        self.snapshots
            .lock()
            .unwrap()
            .insert((name.to_string(), snapshot.to_string()));
        Ok(())
    }

    async fn delete_snapshot(
        &self,
        name: &str,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        self.calls.lock().unwrap().push(BackendCall::DeleteSnapshot {
            name: name.to_string(),
            snapshot: snapshot.to_string(),
        });
        self.snapshots
            .lock()
            .unwrap()
            .remove(&(name.to_string(), snapshot.to_string()));
        Ok(())
    }

    async fn restore_snapshot(
        &self,
        src: &str,
        snapshot: &str,
        dst: &str,
        _key: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        self.calls.lock().unwrap().push(BackendCall::Restore {
            src: src.to_string(),
            snapshot: snapshot.to_string(),
            dst: dst.to_string(),
        });
        self.volumes.lock().unwrap().insert(dst.to_string());
        Ok(())
    }
}

pub struct FakeRegistry {
    backends: BTreeMap<StorPoolName, Arc<dyn VolumeBackend>>,
}

impl FakeRegistry {
    pub fn new(
        backends: BTreeMap<StorPoolName, Arc<dyn VolumeBackend>>,
    ) -> Self {
        Self { backends }
    }

    pub fn single(pool: &str, backend: Arc<dyn VolumeBackend>) -> Self {
        Self {
            backends: [(pool.parse().unwrap(), backend)].into_iter().collect(),
        }
    }
}

impl BackendRegistry for FakeRegistry {
    fn backend_for(
        &self,
        pool: &StorPoolName,
    ) -> Option<Arc<dyn VolumeBackend>> {
        self.backends.get(pool).cloned()
    }
}

/// Live device state served from an in-memory map. `None` simulates a
/// tracker that has not completed its initial scan.
pub struct FakeReader {
    pub states: Mutex<Option<BTreeMap<ResourceName, DeviceResource>>>,
}

impl Default for FakeReader {
    fn default() -> Self {
        Self { states: Mutex::new(Some(BTreeMap::new())) }
    }
}

impl FakeReader {
    pub fn set(&self, name: ResourceName, resource: DeviceResource) {
        self.states
            .lock()
            .unwrap()
            .get_or_insert_with(BTreeMap::new)
            .insert(name, resource);
    }

    /// Forget everything and report [`NoInitialState`] until `set` is
    /// called again.
    pub fn clear(&self) {
        *self.states.lock().unwrap() = None;
    }
}

impl DeviceStateReader for FakeReader {
    fn resource_state(
        &self,
        name: &ResourceName,
    ) -> Result<Option<DeviceResource>, NoInitialState> {
        self.states
            .lock()
            .unwrap()
            .as_ref()
            .ok_or(NoInitialState)
            .map(|states| states.get(name).cloned())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FacilityEvent {
    OpenOrTrigger(EventId),
    Close(EventId),
    CloseEvenIfNotOpen(EventId),
    RequestPrimary(ResourceName),
    ResourceApplied(ResourceName),
    ResourceDeleted(ResourceName),
    VolumeDeleted(ResourceName, VolumeNumber),
    SnapshotDeleted(ResourceName, SnapshotName),
}

#[derive(Default)]
pub struct FakeFacilities {
    pub deployment: Mutex<BTreeMap<ResourceName, DeploymentOutcome>>,
    pub snapshot_states: Mutex<BTreeMap<ResourceName, Vec<SnapshotState>>>,
    pub events: Mutex<Vec<FacilityEvent>>,
}

#[async_trait]
impl SatelliteFacilities for FakeFacilities {
    fn set_deployment_state(
        &self,
        resource: &ResourceName,
        outcome: DeploymentOutcome,
    ) {
        self.deployment.lock().unwrap().insert(resource.clone(), outcome);
    }

    fn snapshot_states(&self, resource: &ResourceName) -> Vec<SnapshotState> {
        self.snapshot_states
            .lock()
            .unwrap()
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    fn set_snapshot_states(
        &self,
        resource: &ResourceName,
        states: Vec<SnapshotState>,
    ) {
        self.snapshot_states
            .lock()
            .unwrap()
            .insert(resource.clone(), states);
    }

    fn open_or_trigger_event(&self, event: EventId) {
        self.events.lock().unwrap().push(FacilityEvent::OpenOrTrigger(event));
    }

    fn close_event_stream(&self, event: EventId) {
        self.events.lock().unwrap().push(FacilityEvent::Close(event));
    }

    fn close_event_stream_even_if_not_open(&self, event: EventId) {
        self.events
            .lock()
            .unwrap()
            .push(FacilityEvent::CloseEvenIfNotOpen(event));
    }

    async fn request_primary(&self, resource: &ResourceName, _uuid: Uuid) {
        self.events
            .lock()
            .unwrap()
            .push(FacilityEvent::RequestPrimary(resource.clone()));
    }

    fn notify_resource_applied(&self, resource: &ResourceName) {
        self.events
            .lock()
            .unwrap()
            .push(FacilityEvent::ResourceApplied(resource.clone()));
    }

    fn notify_resource_deleted(&self, resource: &ResourceName) {
        self.events
            .lock()
            .unwrap()
            .push(FacilityEvent::ResourceDeleted(resource.clone()));
    }

    fn notify_volume_deleted(
        &self,
        resource: &ResourceName,
        volume: VolumeNumber,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(FacilityEvent::VolumeDeleted(resource.clone(), volume));
    }

    fn notify_snapshot_deleted(
        &self,
        resource: &ResourceName,
        snapshot: &SnapshotName,
    ) {
        self.events.lock().unwrap().push(FacilityEvent::SnapshotDeleted(
            resource.clone(),
            snapshot.clone(),
        ));
    }
}
