// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Satellite-side convergence engine.
//!
//! The controller owns the desired topology of replicated storage
//! resources; each satellite is responsible for making the locally visible
//! replicated-block-device state match it. Two halves live here:
//!
//! 1. The [`sequencer::UpdateSequencer`] receives desired-state changes
//!    pushed by the controller (each tagged with a full-sync epoch and a
//!    monotonically increasing update id), buffers them, and applies them
//!    to the [`desired::DesiredState`] container strictly in order.
//! 2. A per-resource reconciliation pass, driven by
//!    [`dispatch::Dispatcher::dispatch_resource`]: evaluate the live device
//!    state against the desired model ([`evaluate`]), drive the device and
//!    its backing storage to convergence ([`converge`]), then reconcile
//!    snapshots ([`snapshots`]).
//!
//! The pass is level-triggered: every dispatch recomputes the full desired
//! vs. actual picture from scratch, so a change that races with an
//! in-flight pass is simply picked up by the next one.

pub mod adm;
pub mod config_file;
pub mod converge;
pub mod desired;
pub mod device_state;
pub mod dispatch;
pub mod errors;
pub mod evaluate;
pub mod facilities;
pub mod sequencer;
pub mod snapshots;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use desired::DesiredState;
pub use dispatch::Dispatcher;
pub use sequencer::UpdateSequencer;
