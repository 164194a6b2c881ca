//! Device identity type

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised when parsing device identities
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdError {
    #[error("Malformed device identity: {0}")]
    Malformed(String),
}

/// Globally unique identifier for a managed device.
///
/// Assigned by the device/provisioning process and immutable afterwards; it
/// is the sole key tunnels, ownership records, and remote proxies are looked
/// up by. On the wire and in the directory it is the usual hyphenated UUID
/// string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a fresh random identity (mostly useful in tests and tools).
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the hyphenated string form.
    pub fn parse(s: &str) -> Result<Self, DeviceIdError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| DeviceIdError::Malformed(s.to_string()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Uuid> for DeviceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
