// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Owned container for the satellite's copy of the desired state.
//!
//! Each map is guarded by its own reader-writer lock. Whenever more than
//! one lock is held, they are acquired in this fixed order:
//!
//!   reconfiguration -> nodes -> resources -> storage pools
//!
//! Only the update sequencer mutates these maps; everything else reads
//! through the accessors below, which never expose the raw containers.

use meridian_common::api::DesiredResource;
use meridian_common::api::FullSyncSnapshot;
use meridian_common::api::NodeSpec;
use meridian_common::api::PropMap;
use meridian_common::api::SnapshotSpec;
use meridian_common::api::StorPoolSpec;
use meridian_common::names::NodeName;
use meridian_common::names::ResourceName;
use meridian_common::names::SnapshotName;
use meridian_common::names::StorPoolName;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Controller-wide configuration pushed to every satellite.
#[derive(Debug, Default)]
pub struct ControllerConfig {
    pub props: PropMap,
    pub crypto_key: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct ResourceTable {
    resources: BTreeMap<ResourceName, DesiredResource>,
    // Snapshots belong to resource definitions and share their lock.
    snapshots: BTreeMap<(ResourceName, SnapshotName), SnapshotSpec>,
}

/// A desired-state change that cannot be applied because it references an
/// object the satellite does not know. The controller never sends such
/// records; seeing one means the ordered-update protocol has been violated.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("resource {resource:?} references unknown node {node:?}")]
    UnknownPeerNode { resource: ResourceName, node: NodeName },
    #[error("snapshot {snapshot:?} references unknown resource {resource:?}")]
    UnknownResource { resource: ResourceName, snapshot: SnapshotName },
}

/// Everything one reconciliation pass needs, cloned out of the desired
/// state under the read locks so that no lock is held while external
/// storage tooling runs.
#[derive(Clone, Debug)]
pub struct DispatchView {
    pub resource: Option<DesiredResource>,
    pub nodes: BTreeMap<NodeName, NodeSpec>,
    pub storage_pools: BTreeMap<StorPoolName, StorPoolSpec>,
    pub snapshots: Vec<SnapshotSpec>,
    pub crypto_key: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct DesiredState {
    reconfiguration: RwLock<ControllerConfig>,
    nodes: RwLock<BTreeMap<NodeName, NodeSpec>>,
    resources: RwLock<ResourceTable>,
    storage_pools: RwLock<BTreeMap<StorPoolName, StorPoolSpec>>,
}

impl DesiredState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the entire desired state with a full-sync
    /// snapshot from the controller.
    pub(crate) fn replace_all(
        &self,
        snapshot: FullSyncSnapshot,
    ) -> Result<(), ApplyError> {
        let mut reconfiguration = self.reconfiguration.write().unwrap();
        let mut nodes = self.nodes.write().unwrap();
        let mut resources = self.resources.write().unwrap();
        let mut pools = self.storage_pools.write().unwrap();

        let new_nodes: BTreeMap<_, _> = snapshot
            .nodes
            .into_iter()
            .map(|n| (n.name.clone(), n))
            .collect();
        let mut new_table = ResourceTable::default();
        for rsc in snapshot.resources {
            check_peers(&rsc, &new_nodes)?;
            new_table.resources.insert(rsc.name.clone(), rsc);
        }
        for snap in snapshot.snapshots {
            if !new_table.resources.contains_key(&snap.resource) {
                return Err(ApplyError::UnknownResource {
                    resource: snap.resource,
                    snapshot: snap.name,
                });
            }
            new_table
                .snapshots
                .insert((snap.resource.clone(), snap.name.clone()), snap);
        }

        reconfiguration.props = snapshot.controller_props;
        reconfiguration.crypto_key = snapshot.crypto_key;
        *nodes = new_nodes;
        *resources = new_table;
        *pools = snapshot
            .storage_pools
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        Ok(())
    }

    pub(crate) fn apply_controller_props(&self, props: PropMap) {
        self.reconfiguration.write().unwrap().props = props;
    }

    pub(crate) fn apply_crypto_key(&self, key: Vec<u8>) {
        // The key unlocks encrypted volumes everywhere, so take the full
        // lock set in order before swapping it.
        let mut reconfiguration = self.reconfiguration.write().unwrap();
        let _nodes = self.nodes.write().unwrap();
        let _resources = self.resources.write().unwrap();
        let _pools = self.storage_pools.write().unwrap();
        reconfiguration.crypto_key = Some(key);
    }

    pub(crate) fn upsert_node(&self, node: NodeSpec) {
        self.nodes.write().unwrap().insert(node.name.clone(), node);
    }

    pub(crate) fn delete_node(&self, name: &NodeName) {
        self.nodes.write().unwrap().remove(name);
    }

    pub(crate) fn upsert_resource(
        &self,
        resource: DesiredResource,
    ) -> Result<(), ApplyError> {
        let nodes = self.nodes.read().unwrap();
        let mut table = self.resources.write().unwrap();
        check_peers(&resource, &nodes)?;
        table.resources.insert(resource.name.clone(), resource);
        Ok(())
    }

    pub(crate) fn delete_resource(&self, name: &ResourceName) {
        let mut table = self.resources.write().unwrap();
        table.resources.remove(name);
        table.snapshots.retain(|(rsc, _), _| rsc != name);
    }

    pub(crate) fn upsert_storage_pool(&self, pool: StorPoolSpec) {
        self.storage_pools.write().unwrap().insert(pool.name.clone(), pool);
    }

    pub(crate) fn delete_storage_pool(&self, name: &StorPoolName) {
        self.storage_pools.write().unwrap().remove(name);
    }

    pub(crate) fn upsert_snapshot(
        &self,
        snapshot: SnapshotSpec,
    ) -> Result<(), ApplyError> {
        let mut table = self.resources.write().unwrap();
        if !table.resources.contains_key(&snapshot.resource) {
            return Err(ApplyError::UnknownResource {
                resource: snapshot.resource,
                snapshot: snapshot.name,
            });
        }
        table.snapshots.insert(
            (snapshot.resource.clone(), snapshot.name.clone()),
            snapshot,
        );
        Ok(())
    }

    pub(crate) fn end_snapshot(
        &self,
        resource: &ResourceName,
        snapshot: &SnapshotName,
    ) {
        self.resources
            .write()
            .unwrap()
            .snapshots
            .remove(&(resource.clone(), snapshot.clone()));
    }

    pub fn node(&self, name: &NodeName) -> Option<NodeSpec> {
        self.nodes.read().unwrap().get(name).cloned()
    }

    pub fn resource(&self, name: &ResourceName) -> Option<DesiredResource> {
        self.resources.read().unwrap().resources.get(name).cloned()
    }

    pub fn storage_pool(&self, name: &StorPoolName) -> Option<StorPoolSpec> {
        self.storage_pools.read().unwrap().get(name).cloned()
    }

    /// Names of all resources currently in the desired state, e.g. to
    /// trigger a sweep over every resource after a controller-wide change.
    pub fn resource_names(&self) -> Vec<ResourceName> {
        self.resources.read().unwrap().resources.keys().cloned().collect()
    }

    pub fn snapshots_for(&self, resource: &ResourceName) -> Vec<SnapshotSpec> {
        self.resources
            .read()
            .unwrap()
            .snapshots
            .values()
            .filter(|s| &s.resource == resource)
            .cloned()
            .collect()
    }

    /// Clone out everything one reconciliation pass for `resource` needs.
    pub fn dispatch_view(&self, resource: &ResourceName) -> DispatchView {
        let reconfiguration = self.reconfiguration.read().unwrap();
        let nodes = self.nodes.read().unwrap();
        let table = self.resources.read().unwrap();
        let pools = self.storage_pools.read().unwrap();
        DispatchView {
            resource: table.resources.get(resource).cloned(),
            nodes: nodes.clone(),
            storage_pools: pools.clone(),
            snapshots: table
                .snapshots
                .values()
                .filter(|s| &s.resource == resource)
                .cloned()
                .collect(),
            crypto_key: reconfiguration.crypto_key.clone(),
        }
    }
}

fn check_peers(
    resource: &DesiredResource,
    nodes: &BTreeMap<NodeName, NodeSpec>,
) -> Result<(), ApplyError> {
    for peer in &resource.peers {
        if !nodes.contains_key(&peer.node) {
            return Err(ApplyError::UnknownPeerNode {
                resource: resource.name.clone(),
                node: peer.node.clone(),
            });
        }
    }
    Ok(())
}
