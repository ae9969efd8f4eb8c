//! Mesh addressing for upgrade servers.

use core::fmt;

use serde::{Deserialize, Serialize};

/// 16-bit network address assigned to a node when it joins the mesh.
///
/// Short addresses can change when a node rejoins, so they are never
/// persisted on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShortAddress(pub u16);

impl ShortAddress {
    /// Network address of the trust center.
    pub const TRUST_CENTER: Self = Self(0x0000);
}

impl fmt::Display for ShortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// 64-bit IEEE address, stable for the lifetime of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExtendedAddress(pub u64);

impl fmt::Display for ExtendedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// Application endpoint hosting the upgrade server cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint(pub u8);

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

/// A fully resolved upgrade server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Current network address.
    pub short_address: ShortAddress,
    /// Stable IEEE address.
    pub extended_address: ExtendedAddress,
    /// Endpoint of the upgrade server cluster.
    pub endpoint: Endpoint,
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.extended_address, self.short_address, self.endpoint
        )
    }
}

/// Server remembered across discovery cycles.
///
/// Only the stable parts of the identity are kept; the short address is
/// looked up again each time the server is contacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KnownServer {
    /// Stable IEEE address.
    pub extended_address: ExtendedAddress,
    /// Endpoint, when it has been resolved before.
    pub endpoint: Option<Endpoint>,
}

impl From<ServerIdentity> for KnownServer {
    fn from(identity: ServerIdentity) -> Self {
        Self {
            extended_address: identity.extended_address,
            endpoint: Some(identity.endpoint),
        }
    }
}
