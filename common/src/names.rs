// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Validated names for cluster objects.
//!
//! Objects are referred to by name everywhere (the desired-state maps, the
//! generated device configuration, log output), so the names are typed and
//! validated once at the wire boundary rather than re-checked at every use.

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Longest accepted object name. Matches the limit enforced by the
/// controller's API layer.
pub const MAX_NAME_LEN: usize = 48;

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid {kind} name {name:?}: {reason}")]
pub struct InvalidNameError {
    kind: &'static str,
    name: String,
    reason: &'static str,
}

fn check_name(
    kind: &'static str,
    name: &str,
) -> Result<(), InvalidNameError> {
    let err = |reason| InvalidNameError { kind, name: name.to_string(), reason };
    let mut chars = name.chars();
    match chars.next() {
        None => return Err(err("name is empty")),
        Some(first) if !first.is_ascii_alphabetic() => {
            return Err(err("name must start with a letter"));
        }
        Some(_) => (),
    }
    if name.len() > MAX_NAME_LEN {
        return Err(err("name is too long"));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(err(
            "name may only contain letters, digits, '_', and '-'",
        ));
    }
    Ok(())
}

macro_rules! name_type {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
            JsonSchema,
        )]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        // Render as the quoted name, not the wrapper, so names read well
        // in error messages and debug output.
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", self.0)
            }
        }

        impl $name {
            pub fn new<S: Into<String>>(
                name: S,
            ) -> Result<Self, InvalidNameError> {
                let name = name.into();
                check_name($kind, &name)?;
                Ok(Self(name))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = InvalidNameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidNameError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> String {
                name.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

name_type!(
    /// Name of a cluster node.
    NodeName,
    "node"
);
name_type!(
    /// Name of a resource definition and of every per-node resource
    /// belonging to it.
    ResourceName,
    "resource"
);
name_type!(
    /// Name of a snapshot, unique within its resource definition.
    SnapshotName,
    "snapshot"
);
name_type!(
    /// Name of a storage pool definition.
    StorPoolName,
    "storage pool"
);

/// Number of a volume within a resource.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct VolumeNumber(pub u16);

impl VolumeNumber {
    /// Highest volume number supported by the replication daemon.
    pub const MAX: VolumeNumber = VolumeNumber(0x7fff);
}

impl fmt::Display for VolumeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Device minor number assigned to a volume.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct MinorNumber(pub u32);

impl fmt::Display for MinorNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
