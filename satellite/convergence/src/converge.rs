// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution of the convergence plan for one resource.
//!
//! The actuator takes the scratchpad produced by [`crate::evaluate`] and
//! drives the backing storage and the replication daemon towards the
//! desired model: provision volumes, initialize meta data, rewrite the
//! configuration file, adjust the runtime state, delete what is no longer
//! wanted, and sort out the primary role. It does not loop or retry; a
//! failed pass reports a structured error and the next dispatch starts
//! from a fresh evaluation.

use crate::adm::DeviceAdm;
use crate::config_file;
use crate::desired::DispatchView;
use crate::errors::ResourceError;
use crate::errors::VolumeError;
use crate::evaluate::ResourceState;
use crate::evaluate::VolumeState;
use crate::evaluate::backing_volume_name;
use crate::facilities::SatelliteFacilities;
use camino::Utf8PathBuf;
use meridian_common::api::DesiredResource;
use meridian_common::api::PROP_PRIMARY_SET;
use meridian_common::api::PROP_STOR_POOL_NAME;
use meridian_common::api::PriorityProps;
use meridian_common::api::PropMap;
use meridian_common::error::ErrorDetails;
use meridian_common::names::NodeName;
use meridian_common::names::ResourceName;
use meridian_common::names::StorPoolName;
use satellite_storage::BackendRegistry;
use satellite_storage::VolumeBackend;
use satellite_storage::metadata;
use slog::Logger;
use slog::error;
use slog::trace;
use slog::warn;
use slog_error_chain::InlineErrorChain;
use std::sync::Arc;
use std::time::Duration;

/// Storage pool used when no property in the lookup chain selects one.
pub const DEFAULT_STOR_POOL: &str = "DfltStorPool";

/// How long a backend existence probe may take before the pass is aborted.
/// Bounds the damage a wedged storage tool can do to the reconciliation
/// loop.
pub const DEFAULT_EXISTS_TIMEOUT: Duration = Duration::from_secs(15);

const EXT_CMD_CORRECTION: &str = "- Check whether the required software is \
     installed\n\
     - Check whether the application's search path includes the location\n\
     \x20 of the external software\n\
     - Check whether the application has execute permission for the \
     external command";

fn abort_msg(rsc: &ResourceName) -> String {
    format!("Operations on resource {rsc:?} were aborted")
}

fn abort_msg_vlm(rsc: &ResourceName, vlm: &VolumeState) -> String {
    format!(
        "Operations on volume {} of resource {rsc:?} were aborted",
        vlm.number
    )
}

pub struct ConvergenceActuator {
    log: Logger,
    local_node: NodeName,
    config_dir: Utf8PathBuf,
    exists_timeout: Duration,
}

impl ConvergenceActuator {
    pub fn new(
        log: Logger,
        local_node: NodeName,
        config_dir: Utf8PathBuf,
    ) -> Self {
        Self {
            log,
            local_node,
            config_dir,
            exists_timeout: DEFAULT_EXISTS_TIMEOUT,
        }
    }

    pub fn set_exists_timeout(&mut self, timeout: Duration) {
        self.exists_timeout = timeout;
    }

    /// Drive `resource` towards its desired state. On success the device
    /// matches the generated configuration and all desired volumes have
    /// backing storage and meta data.
    pub async fn converge(
        &self,
        view: &DispatchView,
        resource: &DesiredResource,
        state: &mut ResourceState,
        adm: &dyn DeviceAdm,
        backends: &dyn BackendRegistry,
        facilities: &dyn SatelliteFacilities,
    ) -> Result<(), ResourceError> {
        for vlm in state.volumes.values().filter(|v| v.skip) {
            warn!(
                self.log,
                "device reports a volume that is not in the desired state; \
                 leaving its backing storage alone";
                "resource" => %resource.name,
                "volume" => %vlm.number,
            );
        }
        self.ensure_storage(view, resource, state, adm, backends).await?;
        self.create_meta_data(resource, state, adm).await?;
        self.write_configuration(view, resource, state).await?;
        if state.requires_adjust {
            trace!(
                self.log, "adjusting resource";
                "resource" => %resource.name,
            );
            adm.adjust(&resource.name).await.map_err(|source| {
                ResourceError::Adjust {
                    details: ErrorDetails::new(format!(
                        "Adjusting the runtime state of resource {:?} failed",
                        resource.name,
                    ))
                    .abort(abort_msg(&resource.name))
                    .cause(
                        "The external command for adjusting the resource \
                         failed",
                    )
                    .correction(EXT_CMD_CORRECTION),
                    source,
                }
            })?;
        }
        self.delete_marked_volumes(view, resource, state, backends, facilities)
            .await?;
        self.ensure_primary(resource, state, adm, facilities).await?;
        facilities.notify_resource_applied(&resource.name);
        Ok(())
    }

    /// Resolve a volume's storage pool through the property lookup chain
    /// (volume, resource, volume definition, resource definition, node)
    /// and remember it on the volume state for the rest of the pass.
    ///
    /// A missing pool or driver leaves the volume without backing storage;
    /// that is logged, not fatal. An invalid pool name is a configuration
    /// error and fails the volume.
    fn resolve_backend(
        &self,
        view: &DispatchView,
        resource: &DesiredResource,
        vlm: &mut VolumeState,
        backends: &dyn BackendRegistry,
    ) -> Result<Option<Arc<dyn VolumeBackend>>, VolumeError> {
        if vlm.pool.is_none() {
            let empty = PropMap::new();
            let node_props = view
                .nodes
                .get(&self.local_node)
                .map(|n| &n.props)
                .unwrap_or(&empty);
            let def = resource.volume(vlm.number);
            let props = PriorityProps::new(
                [
                    def.map(|d| &d.props),
                    Some(&resource.props),
                    def.map(|d| &d.dfn_props),
                    Some(&resource.dfn_props),
                    Some(node_props),
                ]
                .into_iter()
                .flatten(),
            );
            let pool_str =
                props.get(PROP_STOR_POOL_NAME).unwrap_or(DEFAULT_STOR_POOL);
            let pool: StorPoolName = pool_str.parse().map_err(|_| {
                VolumeError::new(
                    vlm.number,
                    ErrorDetails::new(format!(
                        "An invalid storage pool name is specified for \
                         volume {} of resource {:?}",
                        vlm.number, resource.name,
                    ))
                    .abort(abort_msg_vlm(&resource.name, vlm))
                    .cause(
                        "An invalid storage pool name was specified for the \
                         volume",
                    )
                    .correction(
                        "Correct the property that selects the storage pool \
                         for this volume. Note that the property may be set \
                         on the volume or may be inherited from the resource, \
                         the volume definition, the resource definition, or \
                         the node.",
                    )
                    .details(format!("The faulty storage pool name is \
                         {pool_str:?}")),
                )
            })?;
            if view.storage_pools.contains_key(&pool)
                && backends.backend_for(&pool).is_some()
            {
                vlm.pool = Some(pool);
            } else {
                warn!(
                    self.log,
                    "cannot find storage pool for volume; \
                     leaving it without backing storage";
                    "resource" => %resource.name,
                    "volume" => %vlm.number,
                    "pool" => %pool,
                );
            }
        }
        Ok(vlm
            .pool
            .as_ref()
            .and_then(|pool| backends.backend_for(pool)))
    }

    /// Make sure every desired volume has backing storage of the right
    /// size, restoring from a snapshot where one is declared.
    async fn ensure_storage(
        &self,
        view: &DispatchView,
        resource: &DesiredResource,
        state: &mut ResourceState,
        adm: &dyn DeviceAdm,
        backends: &dyn BackendRegistry,
    ) -> Result<(), ResourceError> {
        if resource.flags.diskless {
            // An intentionally disk-less client has no backing storage.
            return Ok(());
        }
        for vlm in state.volumes.values_mut() {
            if vlm.skip || vlm.marked_for_delete {
                continue;
            }
            if resource.volume(vlm.number).is_none() {
                // Referenced only by an in-progress snapshot; the snapshot
                // coordinator owns it.
                continue;
            }
            let gross_size_kib = metadata::gross_size(
                vlm.net_size_kib,
                vlm.peer_slots,
                metadata::DEFAULT_AL_STRIPES,
                metadata::DEFAULT_AL_STRIPE_SIZE_KIB,
            )
            .map_err(|source| ResourceError::MetaDataSize {
                details: ErrorDetails::new(format!(
                    "Meta data calculation for resource {:?} volume {} \
                     failed",
                    resource.name, vlm.number,
                ))
                .abort(abort_msg(&resource.name))
                .cause(
                    "The calculation of the volume's replication meta data \
                     size failed",
                )
                .correction(
                    "Check whether the volume's properties, such as size, \
                     peer count and activity log settings, are within the \
                     range supported by the replication daemon",
                )
                .details(source.to_string()),
                source,
            })?;
            vlm.gross_size_kib = Some(gross_size_kib);
            self.ensure_volume_storage(
                view,
                resource,
                vlm,
                gross_size_kib,
                adm,
                backends,
            )
            .await
            .map_err(|err| {
                ResourceError::from_volume(resource.name.as_str(), err)
            })?;
        }
        Ok(())
    }

    async fn ensure_volume_storage(
        &self,
        view: &DispatchView,
        resource: &DesiredResource,
        vlm: &mut VolumeState,
        gross_size_kib: u64,
        adm: &dyn DeviceAdm,
        backends: &dyn BackendRegistry,
    ) -> Result<(), VolumeError> {
        let Some(backend) =
            self.resolve_backend(view, resource, vlm, backends)?
        else {
            return Ok(());
        };

        if !vlm.has_disk {
            // Bounded probe: a wedged storage tool must not stall the
            // reconciliation thread forever.
            let exists = match tokio::time::timeout(
                self.exists_timeout,
                backend.exists(&vlm.backing_name),
            )
            .await
            {
                Ok(Ok(exists)) => exists,
                Ok(Err(source)) => {
                    return Err(VolumeError::with_source(
                        vlm.number,
                        storage_details(&resource.name, vlm, "check"),
                        source,
                    ));
                }
                Err(_) => {
                    return Err(VolumeError::new(
                        vlm.number,
                        ErrorDetails::new(format!(
                            "Operations on volume {} of resource {:?} \
                             aborted due to an I/O timeout",
                            vlm.number, resource.name,
                        ))
                        .abort(abort_msg_vlm(&resource.name, vlm))
                        .cause(
                            "The check for existence of the volume's backend \
                             storage timed out",
                        )
                        .correction(
                            "- Check whether the system's performance is \
                             within acceptable limits\n\
                             - Check whether the operating system's I/O \
                             subsystems work flawlessly",
                        )
                        .details(format!(
                            "The backing volume checked was: {}",
                            vlm.backing_name,
                        )),
                    ));
                }
            };

            if exists {
                // Found storage the evaluation did not know about; make
                // sure it is large enough for the desired net size.
                backend
                    .resize(&vlm.backing_name, gross_size_kib)
                    .await
                    .map_err(|source| {
                        VolumeError::with_source(
                            vlm.number,
                            storage_details(&resource.name, vlm, "resize"),
                            source,
                        )
                    })?;
                vlm.has_disk = true;
                trace!(
                    self.log, "existing backing volume found";
                    "resource" => %resource.name,
                    "volume" => %vlm.number,
                );
            } else if let Some(restore) = vlm.restore.clone() {
                let src =
                    backing_volume_name(&restore.resource, vlm.number);
                backend
                    .restore_snapshot(
                        &src,
                        restore.snapshot.as_str(),
                        &vlm.backing_name,
                        view.crypto_key.as_deref().filter(|_| vlm.encrypted),
                    )
                    .await
                    .map_err(|source| {
                        VolumeError::with_source(
                            vlm.number,
                            ErrorDetails::new(format!(
                                "Storage volume restoration failed for \
                                 resource {:?} volume {}",
                                resource.name, vlm.number,
                            ))
                            .abort(abort_msg_vlm(&resource.name, vlm))
                            .cause("Restoring the snapshot failed"),
                            source,
                        )
                    })?;
                // A restored volume is a copy of a replicated volume and
                // brings its meta data along.
                vlm.has_disk = true;
                vlm.has_meta_data = true;
                vlm.check_meta_data = false;
            } else {
                backend
                    .create(
                        &vlm.backing_name,
                        gross_size_kib,
                        view.crypto_key.as_deref().filter(|_| vlm.encrypted),
                    )
                    .await
                    .map_err(|source| {
                        VolumeError::with_source(
                            vlm.number,
                            ErrorDetails::new(format!(
                                "Storage volume creation failed for resource \
                                 {:?} volume {}",
                                resource.name, vlm.number,
                            ))
                            .abort(abort_msg_vlm(&resource.name, vlm))
                            .cause("Creation of the storage volume failed")
                            .correction(
                                "- Check whether there is sufficient space \
                                 in the storage pool selected for the \
                                 volume\n\
                                 - Check whether the storage pool is \
                                 operating flawlessly",
                            ),
                            source,
                        )
                    })?;
                vlm.has_disk = true;
                vlm.has_meta_data = false;
                vlm.check_meta_data = false;
            }
        }

        if vlm.has_disk {
            let path = backend
                .path(&vlm.backing_name, vlm.encrypted)
                .map_err(|source| {
                    VolumeError::with_source(
                        vlm.number,
                        ErrorDetails::new(format!(
                            "The storage driver could not determine the \
                             block device path for volume {} of resource \
                             {:?}",
                            vlm.number, resource.name,
                        ))
                        .abort(abort_msg_vlm(&resource.name, vlm))
                        .cause(
                            "The storage driver could not determine the \
                             block device path for the volume's backend \
                             storage",
                        )
                        .correction(
                            "- Check whether the storage driver is \
                             configured correctly\n\
                             - Check whether any external programs required \
                             by the storage driver are functional",
                        ),
                        source,
                    )
                })?;

            if vlm.check_meta_data {
                if let Some(minor) = vlm.minor {
                    match adm.has_meta_data(&path, minor).await {
                        Ok(has_md) => vlm.has_meta_data = has_md,
                        Err(err) => {
                            // The probe is best-effort; worst case the
                            // meta data is re-initialized idempotently.
                            error!(
                                self.log, "meta data probe failed";
                                "resource" => %resource.name,
                                "volume" => %vlm.number,
                                InlineErrorChain::new(&err),
                            );
                        }
                    }
                }
                vlm.check_meta_data = false;
            }
            vlm.backing_path = Some(path);
        }
        Ok(())
    }

    async fn create_meta_data(
        &self,
        resource: &DesiredResource,
        state: &mut ResourceState,
        adm: &dyn DeviceAdm,
    ) -> Result<(), ResourceError> {
        for vlm in state.volumes.values_mut() {
            if vlm.skip || vlm.marked_for_delete {
                continue;
            }
            if vlm.has_disk && !vlm.has_meta_data {
                trace!(
                    self.log, "creating meta data";
                    "resource" => %resource.name,
                    "volume" => %vlm.number,
                );
                adm.create_meta_data(
                    &resource.name,
                    vlm.number,
                    vlm.peer_slots,
                )
                .await
                .map_err(|source| ResourceError::MetaDataCreate {
                    details: ErrorDetails::new(format!(
                        "Meta data creation for resource {:?} volume {} \
                         failed",
                        resource.name, vlm.number,
                    ))
                    .abort(abort_msg(&resource.name))
                    .cause(
                        "Meta data creation failed because the execution of \
                         an external command failed",
                    )
                    .correction(EXT_CMD_CORRECTION),
                    source,
                })?;
                vlm.has_meta_data = true;
            }
        }
        Ok(())
    }

    async fn write_configuration(
        &self,
        view: &DispatchView,
        resource: &DesiredResource,
        state: &ResourceState,
    ) -> Result<(), ResourceError> {
        let content = config_file::render_res_file(
            &self.local_node,
            resource,
            state,
            &view.nodes,
        );
        config_file::write_res_file(&self.config_dir, &resource.name, &content)
            .await
            .map_err(|source| ResourceError::ConfigIo {
                details: config_io_details(&resource.name, "Creation", source.to_string()),
                source,
            })
    }

    async fn delete_marked_volumes(
        &self,
        view: &DispatchView,
        resource: &DesiredResource,
        state: &mut ResourceState,
        backends: &dyn BackendRegistry,
        facilities: &dyn SatelliteFacilities,
    ) -> Result<(), ResourceError> {
        if resource.flags.diskless {
            return Ok(());
        }
        for vlm in state.volumes.values_mut() {
            if !vlm.marked_for_delete || vlm.skip {
                continue;
            }
            if resource.volume(vlm.number).is_none() {
                continue;
            }
            self.delete_volume_storage(view, resource, vlm, backends, facilities)
                .await
                .map_err(|err| {
                    ResourceError::from_volume(resource.name.as_str(), err)
                })?;
        }
        Ok(())
    }

    async fn delete_volume_storage(
        &self,
        view: &DispatchView,
        resource: &DesiredResource,
        vlm: &mut VolumeState,
        backends: &dyn BackendRegistry,
        facilities: &dyn SatelliteFacilities,
    ) -> Result<(), VolumeError> {
        let Some(backend) =
            self.resolve_backend(view, resource, vlm, backends)?
        else {
            return Ok(());
        };
        backend.delete(&vlm.backing_name, vlm.encrypted).await.map_err(
            |source| {
                VolumeError::with_source(
                    vlm.number,
                    ErrorDetails::new(format!(
                        "Deletion of the storage volume failed for resource \
                         {:?} volume {}",
                        resource.name, vlm.number,
                    ))
                    .abort(abort_msg_vlm(&resource.name, vlm))
                    .cause("Deletion of the storage volume failed")
                    .correction(
                        "- Check whether the storage pool is operating \
                         flawlessly",
                    ),
                    source,
                )
            },
        )?;
        vlm.has_disk = false;
        vlm.backing_path = None;
        facilities.notify_volume_deleted(&resource.name, vlm.number);
        Ok(())
    }

    /// Sort out the primary role: ask the controller for the initial
    /// assignment if nobody holds it yet, or perform the local promotion
    /// if this node was chosen.
    async fn ensure_primary(
        &self,
        resource: &DesiredResource,
        state: &ResourceState,
        adm: &dyn DeviceAdm,
        facilities: &dyn SatelliteFacilities,
    ) -> Result<(), ResourceError> {
        if !resource.dfn_props.contains_key(PROP_PRIMARY_SET)
            && !resource.flags.diskless
        {
            trace!(
                self.log, "requesting primary";
                "resource" => %resource.name,
            );
            facilities.request_primary(&resource.name, resource.uuid).await;
        } else if resource.flags.create_primary && !state.primary {
            trace!(
                self.log, "setting resource primary";
                "resource" => %resource.name,
            );
            let primary_err = |source| ResourceError::PrimaryAssign {
                details: ErrorDetails::new(format!(
                    "Setting primary on resource {:?} failed",
                    resource.name,
                ))
                .abort(abort_msg(&resource.name))
                .cause(
                    "The external command for promoting the resource failed",
                )
                .correction(EXT_CMD_CORRECTION),
                source,
            };
            adm.primary(&resource.name, true).await.map_err(primary_err)?;
            // Demote again right away: the daemon cannot stop a primary
            // resource, and which node ends up primary is decided by
            // auto-promotion when the device is first opened, not by this
            // engine.
            adm.secondary(&resource.name).await.map_err(primary_err)?;
        }
        Ok(())
    }

    /// Tear down a resource: stop the device, remove the configuration
    /// file, and delete all backing volumes. Volume deletion is
    /// best-effort: a failed volume is reported but does not stop cleanup
    /// of the remaining volumes.
    pub async fn delete_resource(
        &self,
        name: &ResourceName,
        view: &DispatchView,
        state: &mut ResourceState,
        adm: &dyn DeviceAdm,
        backends: &dyn BackendRegistry,
        facilities: &dyn SatelliteFacilities,
    ) -> Result<(), ResourceError> {
        if state.present {
            adm.down(name).await.map_err(|source| {
                ResourceError::DeviceDown {
                    details: ErrorDetails::new(format!(
                        "Shutdown of the resource {name:?} failed",
                    ))
                    .abort(abort_msg(name))
                    .cause(
                        "The external command for stopping the resource \
                         failed",
                    )
                    .correction(EXT_CMD_CORRECTION),
                    source,
                }
            })?;
        }

        config_file::delete_res_file(&self.config_dir, name).await.map_err(
            |source| ResourceError::ConfigIo {
                details: config_io_details(name, "Deletion", source.to_string()),
                source,
            },
        )?;

        let mut failed_volumes = Vec::new();
        if let Some(resource) =
            view.resource.as_ref().filter(|r| !r.flags.diskless)
        {
            for vlm in state.volumes.values_mut() {
                if vlm.skip || resource.volume(vlm.number).is_none() {
                    continue;
                }
                if let Err(err) = self
                    .delete_volume_storage(
                        view, resource, vlm, backends, facilities,
                    )
                    .await
                {
                    error!(
                        self.log, "volume deletion failed";
                        "resource" => %name,
                        "volume" => %vlm.number,
                        InlineErrorChain::new(&err),
                    );
                    failed_volumes.push(err.volume);
                }
            }
        }
        if !failed_volumes.is_empty() {
            return Err(ResourceError::VolumeDeletion {
                details: ErrorDetails::new(format!(
                    "Deletion of resource {name:?} failed because deletion \
                     of the resource's volumes failed",
                ))
                .abort(abort_msg(name))
                .cause("Deletion of at least one of the resource's volumes \
                     failed")
                .correction(
                    "Review the reports and/or log entries for the failed \
                     operations on the resource's volumes for more \
                     information on the cause of the error and possible \
                     correction measures",
                )
                .details(format!(
                    "Deletion failed for volumes: {}",
                    failed_volumes
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                )),
            });
        }

        facilities.notify_resource_deleted(name);
        Ok(())
    }
}

fn storage_details(
    rsc: &ResourceName,
    vlm: &VolumeState,
    operation: &str,
) -> ErrorDetails {
    ErrorDetails::new(format!(
        "Storage volume {operation} failed for resource {rsc:?} volume {}",
        vlm.number,
    ))
    .abort(abort_msg_vlm(rsc, vlm))
    .cause("A storage backend command failed")
    .correction("- Check whether the storage pool is operating flawlessly")
}

fn config_io_details(
    rsc: &ResourceName,
    operation: &str,
    io_msg: String,
) -> ErrorDetails {
    ErrorDetails::new(format!(
        "{operation} of the device configuration file for resource {rsc:?} \
         failed due to an I/O error",
    ))
    .abort(abort_msg(rsc))
    .cause(format!(
        "{operation} of the device configuration file failed due to an I/O \
         error",
    ))
    .correction(
        "- Check whether enough free space is available for the creation of \
         the file\n\
         - Check whether the application has write access to the target \
         directory\n\
         - Check whether the storage is operating flawlessly",
    )
    .details(format!(
        "The error reported by the runtime environment or operating system \
         is:\n{io_msg}",
    ))
}
