// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator-facing diagnostics attached to operation failures.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Structured diagnostic describing an operation failure.
///
/// Failures that end up in front of an operator carry more than a message:
/// which operations were aborted, what caused the failure, and what the
/// operator can do about it. All of the optional fields survive the trip
/// through the reporting chain to the controller, which renders them to the
/// client verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Short description of the failure.
    pub message: String,
    /// Which operations were aborted as a consequence.
    pub abort: Option<String>,
    /// What caused the failure, if known.
    pub cause: Option<String>,
    /// Steps the operator can take to correct the problem.
    pub correction: Option<String>,
    /// Additional free-form detail, e.g. the text reported by an external
    /// program.
    pub details: Option<String>,
}

impl ErrorDetails {
    pub fn new<S: Into<String>>(message: S) -> Self {
        ErrorDetails { message: message.into(), ..Default::default() }
    }

    pub fn abort<S: Into<String>>(mut self, abort: S) -> Self {
        self.abort = Some(abort.into());
        self
    }

    pub fn cause<S: Into<String>>(mut self, cause: S) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn correction<S: Into<String>>(mut self, correction: S) -> Self {
        self.correction = Some(correction.into());
        self
    }

    pub fn details<S: Into<String>>(mut self, details: S) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (cause: {cause})")?;
        }
        Ok(())
    }
}
