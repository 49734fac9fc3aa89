// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller -> satellite wire model.
//!
//! These types describe the desired state of the cluster as the controller
//! sees it. They arrive on the satellite either wholesale inside a
//! [`FullSyncSnapshot`] or incrementally as [`ApplyRecord`]s. The transport
//! layer (not part of this crate) is responsible for decoding bytes into
//! these types; the satellite's update sequencer is responsible for applying
//! them in order.

use crate::names::MinorNumber;
use crate::names::NodeName;
use crate::names::ResourceName;
use crate::names::SnapshotName;
use crate::names::StorPoolName;
use crate::names::VolumeNumber;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;

/// Free-form properties attached to most cluster objects.
pub type PropMap = BTreeMap<String, String>;

/// Property selecting the storage pool backing a volume. May be set at any
/// level of the property lookup priority.
pub const PROP_STOR_POOL_NAME: &str = "StorPoolName";

/// Property recording, on a resource definition, that some node has been
/// assigned the initial primary role. Set by the controller.
pub const PROP_PRIMARY_SET: &str = "PrimarySet";

/// Prioritized view over several property maps.
///
/// Lookups return the value from the first map that contains the key, so
/// more specific objects (a volume) override less specific ones (the node).
pub struct PriorityProps<'a> {
    maps: Vec<&'a PropMap>,
}

impl<'a> PriorityProps<'a> {
    pub fn new<I: IntoIterator<Item = &'a PropMap>>(maps: I) -> Self {
        Self { maps: maps.into_iter().collect() }
    }

    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.maps.iter().find_map(|m| m.get(key).map(String::as_str))
    }
}

/// A node participating in the cluster, as far as the satellite needs to
/// know: its identity and the address peers reach it at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NodeSpec {
    pub name: NodeName,
    pub uuid: Uuid,
    pub addr: IpAddr,
    pub props: PropMap,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
    JsonSchema,
)]
pub struct ResourceFlags {
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub diskless: bool,
    /// The resource was created with the intent that this node become
    /// primary once deployed.
    #[serde(default)]
    pub create_primary: bool,
}

/// A peer instance of the same resource definition on another node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResourcePeer {
    pub node: NodeName,
    pub node_id: u8,
    pub diskless: bool,
}

/// Desired state of the local node's instance of one resource definition,
/// together with the definition-level data the satellite needs (volume
/// definitions, peers, properties).
///
/// Replaced wholesale on full sync, patched by incremental updates. Never
/// mutated by the convergence engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DesiredResource {
    pub name: ResourceName,
    pub uuid: Uuid,
    /// Node id of the local instance within the replication mesh.
    pub node_id: u8,
    /// TCP port shared by all instances of this resource definition.
    pub port: u16,
    /// Number of peer slots to reserve in the replication meta data.
    pub peer_slots: u8,
    pub flags: ResourceFlags,
    /// Properties of the local resource instance.
    pub props: PropMap,
    /// Properties of the resource definition.
    pub dfn_props: PropMap,
    pub volumes: Vec<VolumeDefSpec>,
    pub peers: Vec<ResourcePeer>,
}

impl DesiredResource {
    pub fn volume(&self, number: VolumeNumber) -> Option<&VolumeDefSpec> {
        self.volumes.iter().find(|v| v.number == number)
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
    JsonSchema,
)]
pub struct VolumeFlags {
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub encrypted: bool,
}

/// Source to clone a new volume from instead of creating it empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RestoreSource {
    pub resource: ResourceName,
    pub snapshot: SnapshotName,
}

/// One volume definition of a resource, merged with the per-instance volume
/// data for the local node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VolumeDefSpec {
    pub number: VolumeNumber,
    /// Usable (net) size of the volume in KiB.
    pub size_kib: u64,
    pub minor: MinorNumber,
    pub flags: VolumeFlags,
    /// Properties of the local volume instance.
    pub props: PropMap,
    /// Properties of the volume definition.
    pub dfn_props: PropMap,
    pub restore: Option<RestoreSource>,
}

/// A storage pool definition as deployed on the local node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StorPoolSpec {
    pub name: StorPoolName,
    pub uuid: Uuid,
    pub props: PropMap,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
    JsonSchema,
)]
pub struct SnapshotFlags {
    #[serde(default)]
    pub delete: bool,
    /// Suspend I/O on the resource while the snapshot is being prepared.
    #[serde(default)]
    pub suspend: bool,
    /// Actually take the snapshot now (set once all nodes are suspended).
    #[serde(default)]
    pub take: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SnapshotVolumeSpec {
    pub number: VolumeNumber,
    /// Storage pool holding the volume the snapshot is taken of.
    pub pool: StorPoolName,
}

/// Desired state of one snapshot of a resource on the local node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SnapshotSpec {
    pub resource: ResourceName,
    pub name: SnapshotName,
    pub uuid: Uuid,
    pub flags: SnapshotFlags,
    pub volumes: Vec<SnapshotVolumeSpec>,
}

/// Complete desired state, sent by the controller to bootstrap (or recover)
/// a satellite's view. Tagged with the full-sync epoch id out of band.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct FullSyncSnapshot {
    pub controller_props: PropMap,
    pub crypto_key: Option<Vec<u8>>,
    pub nodes: Vec<NodeSpec>,
    pub resources: Vec<DesiredResource>,
    pub storage_pools: Vec<StorPoolSpec>,
    pub snapshots: Vec<SnapshotSpec>,
}

/// One incremental desired-state change.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    ControllerProps { props: PropMap },
    NodeUpsert { node: NodeSpec },
    NodeDelete { node: NodeName },
    ResourceUpsert { resource: DesiredResource },
    ResourceDelete { resource: ResourceName },
    StorPoolUpsert { pool: StorPoolSpec },
    StorPoolDelete { pool: StorPoolName },
    SnapshotUpsert { snapshot: SnapshotSpec },
    /// The controller has finished with a snapshot; the satellite drops it
    /// from the desired state.
    SnapshotEnded { resource: ResourceName, snapshot: SnapshotName },
    CryptoKey { key: Vec<u8> },
}

impl Change {
    /// Short category label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::ControllerProps { .. } => "controller-props",
            Change::NodeUpsert { .. } => "node-upsert",
            Change::NodeDelete { .. } => "node-delete",
            Change::ResourceUpsert { .. } => "resource-upsert",
            Change::ResourceDelete { .. } => "resource-delete",
            Change::StorPoolUpsert { .. } => "storage-pool-upsert",
            Change::StorPoolDelete { .. } => "storage-pool-delete",
            Change::SnapshotUpsert { .. } => "snapshot-upsert",
            Change::SnapshotEnded { .. } => "snapshot-ended",
            Change::CryptoKey { .. } => "crypto-key",
        }
    }
}

/// The unit of ordered application: a change tagged with the full-sync
/// epoch it belongs to and its position within that epoch.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ApplyRecord {
    pub full_sync_id: u64,
    pub update_id: u64,
    pub change: Change,
}
