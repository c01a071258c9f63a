//! Addressing and identifier types shared across the focus.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error parsing an address or identifier.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The bare address is not of the form `local@domain`.
    #[error("invalid room address: {0}")]
    InvalidRoom(String),

    /// The full address is not of the form `local@domain/resource`.
    #[error("invalid occupant address: {0}")]
    InvalidOccupant(String),
}

/// Bare address of a conference room, `local@domain`.
///
/// Uniquely identifies a conference within a signaling realm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomJid(String);

impl RoomJid {
    /// Parse a bare `local@domain` address. The resource part, if any, is
    /// rejected.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let (local, rest) = s
            .split_once('@')
            .ok_or_else(|| AddressError::InvalidRoom(s.to_string()))?;
        if local.is_empty() || rest.is_empty() || rest.contains('@') || rest.contains('/') {
            return Err(AddressError::InvalidRoom(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// The room-local part (left of the `@`).
    #[must_use]
    pub fn local(&self) -> &str {
        self.0.split('@').next().unwrap_or_default()
    }

    /// The domain part (right of the `@`).
    #[must_use]
    pub fn domain(&self) -> &str {
        self.0.split('@').nth(1).unwrap_or_default()
    }

    /// Full address of the occupant with the given nickname.
    #[must_use]
    pub fn occupant(&self, nickname: &str) -> FullJid {
        FullJid(format!("{}/{nickname}", self.0))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomJid {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Full address of a room occupant, `local@domain/resource`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FullJid(String);

impl FullJid {
    /// Parse a full `local@domain/resource` address.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let (bare, resource) = s
            .split_once('/')
            .ok_or_else(|| AddressError::InvalidOccupant(s.to_string()))?;
        if resource.is_empty() {
            return Err(AddressError::InvalidOccupant(s.to_string()));
        }
        RoomJid::parse(bare).map_err(|_| AddressError::InvalidOccupant(s.to_string()))?;
        Ok(Self(s.to_string()))
    }

    /// The bare room address this occupant belongs to.
    pub fn room(&self) -> Result<RoomJid, AddressError> {
        let bare = self.0.split('/').next().unwrap_or_default();
        RoomJid::parse(bare)
    }

    /// The resource part, which in a conference room is the occupant
    /// nickname.
    #[must_use]
    pub fn resource(&self) -> &str {
        self.0.split_once('/').map(|(_, r)| r).unwrap_or_default()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FullJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Room-local nickname of a participant; the key in the source registry and
/// the bridge-session manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque address of a media bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BridgeId(String);

impl BridgeId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque string identifying a conference across observers and external
/// services.
///
/// Assigned by the room, or generated by the focus as a canonically
/// formatted 128-bit random value. At most one conference in the process
/// holds a given meeting identifier at any moment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeetingId(String);

impl MeetingId {
    /// Generate a fresh random meeting identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deployment region of a participant or bridge, used for bridge selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Region(String);

impl Region {
    #[must_use]
    pub fn new(region: impl Into<String>) -> Self {
        Self(region.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
