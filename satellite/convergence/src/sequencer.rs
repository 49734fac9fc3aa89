// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ordered application of controller desired-state updates.
//!
//! The controller tags every update with the full-sync epoch it belongs to
//! and a monotonically increasing update id. Updates may arrive out of
//! order; the sequencer buffers them and applies them strictly in update-id
//! order with no gaps. Updates from a different epoch are stale leftovers
//! from before a reconnect and are dropped.
//!
//! Two situations are unrecoverable and poison the controller connection:
//!
//! * a duplicate update id (the controller violated the protocol, and we
//!   cannot guess which record is authoritative), and
//! * a failure while applying a record (skipping it would silently corrupt
//!   the desired state, while retrying it forever would stall the stream).
//!
//! In both cases [`UpdateSequencer::submit`] returns a
//! [`FatalProtocolError`]; the caller must drop the controller connection
//! and re-authenticate, which leads to a fresh full sync.

use crate::desired::ApplyError;
use crate::desired::DesiredState;
use meridian_common::api::ApplyRecord;
use meridian_common::api::Change;
use meridian_common::api::FullSyncSnapshot;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::info;
use slog::trace;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum FatalProtocolError {
    #[error(
        "duplicate update id {update_id} within full sync {full_sync_id}"
    )]
    DuplicateUpdateId { full_sync_id: u64, update_id: u64 },
    #[error("applying update {update_id} failed")]
    ApplyFailed {
        update_id: u64,
        #[source]
        source: ApplyError,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("applying full sync {full_sync_id} failed")]
pub struct FullSyncError {
    pub full_sync_id: u64,
    #[source]
    pub source: ApplyError,
}

pub struct UpdateSequencer {
    log: Logger,
    state: Arc<DesiredState>,
    current_full_sync_id: u64,
    awaited_update_id: u64,
    pending: BTreeMap<u64, ApplyRecord>,
}

impl UpdateSequencer {
    pub fn new(log: Logger, state: Arc<DesiredState>) -> Self {
        Self {
            log,
            state,
            current_full_sync_id: 0,
            awaited_update_id: 0,
            pending: BTreeMap::new(),
        }
    }

    pub fn current_full_sync_id(&self) -> u64 {
        self.current_full_sync_id
    }

    pub fn awaited_update_id(&self) -> u64 {
        self.awaited_update_id
    }

    /// Atomically replace the desired state with a full-sync snapshot and
    /// start a new epoch. Any buffered records belong to a previous epoch
    /// and are discarded.
    ///
    /// On failure the local epoch is advanced past `full_sync_id`, so any
    /// records the controller still sends for the failed epoch are ignored
    /// as stale; the caller must drop the connection and expect a fresh
    /// full sync after re-authentication.
    pub fn begin_full_sync(
        &mut self,
        full_sync_id: u64,
        snapshot: FullSyncSnapshot,
    ) -> Result<(), FullSyncError> {
        self.pending.clear();
        self.awaited_update_id = 0;
        match self.state.replace_all(snapshot) {
            Ok(()) => {
                self.current_full_sync_id = full_sync_id;
                info!(
                    self.log, "full sync applied";
                    "full_sync_id" => full_sync_id,
                );
                Ok(())
            }
            Err(source) => {
                // Receiving this full sync again would fail the same way,
                // so make sure trailing records for it look stale.
                self.current_full_sync_id = full_sync_id.wrapping_add(1);
                error!(
                    self.log, "full sync failed";
                    "full_sync_id" => full_sync_id,
                    InlineErrorChain::new(&source),
                );
                Err(FullSyncError { full_sync_id, source })
            }
        }
    }

    /// Buffer one update and apply every buffered update that is next in
    /// sequence.
    pub fn submit(
        &mut self,
        record: ApplyRecord,
    ) -> Result<(), FatalProtocolError> {
        if record.full_sync_id != self.current_full_sync_id {
            info!(
                self.log, "ignoring stale update";
                "record_full_sync_id" => record.full_sync_id,
                "current_full_sync_id" => self.current_full_sync_id,
                "update_id" => record.update_id,
            );
            return Ok(());
        }

        if record.update_id < self.awaited_update_id
            || self.pending.contains_key(&record.update_id)
        {
            return Err(FatalProtocolError::DuplicateUpdateId {
                full_sync_id: record.full_sync_id,
                update_id: record.update_id,
            });
        }
        self.pending.insert(record.update_id, record);

        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.awaited_update_id {
                break;
            }
            let record = entry.remove();
            trace!(
                self.log, "applying update";
                "update_id" => record.update_id,
                "kind" => record.change.kind(),
            );
            if let Err(source) = self.apply(record.change) {
                error!(
                    self.log, "applying update failed";
                    "update_id" => record.update_id,
                    InlineErrorChain::new(&source),
                );
                return Err(FatalProtocolError::ApplyFailed {
                    update_id: record.update_id,
                    source,
                });
            }
            self.awaited_update_id += 1;
        }

        for update_id in self.pending.keys().copied() {
            debug!(
                self.log, "update queued until predecessor arrives";
                "update_id" => update_id,
                "awaited_update_id" => self.awaited_update_id,
            );
        }
        Ok(())
    }

    // Each category takes the lock set documented on `DesiredState`,
    // scoped to this one record.
    fn apply(&self, change: Change) -> Result<(), ApplyError> {
        match change {
            Change::ControllerProps { props } => {
                self.state.apply_controller_props(props);
            }
            Change::NodeUpsert { node } => self.state.upsert_node(node),
            Change::NodeDelete { node } => self.state.delete_node(&node),
            Change::ResourceUpsert { resource } => {
                self.state.upsert_resource(resource)?;
            }
            Change::ResourceDelete { resource } => {
                self.state.delete_resource(&resource);
            }
            Change::StorPoolUpsert { pool } => {
                self.state.upsert_storage_pool(pool);
            }
            Change::StorPoolDelete { pool } => {
                self.state.delete_storage_pool(&pool);
            }
            Change::SnapshotUpsert { snapshot } => {
                self.state.upsert_snapshot(snapshot)?;
            }
            Change::SnapshotEnded { resource, snapshot } => {
                self.state.end_snapshot(&resource, &snapshot);
            }
            Change::CryptoKey { key } => self.state.apply_crypto_key(key),
        }
        Ok(())
    }
}
