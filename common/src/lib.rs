// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the meridian controller and its satellite agents.
//!
//! Everything in this crate is either part of the controller -> satellite
//! wire model (already validated by the controller before it is sent) or a
//! small building block used on both sides, such as typed object names and
//! the structured diagnostic value attached to operation failures.

pub mod api;
pub mod error;
pub mod names;
