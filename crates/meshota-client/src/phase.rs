//! The client's single phase variable.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Where the client is in its discovery/download loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientPhase {
    /// Not running.
    Stopped,
    /// Waiting for the storage driver to come up.
    InitializingStorage,
    /// Idle until the next discovery window.
    AwaitingDiscoveryWindow,
    /// Broadcast search for servers in progress.
    BroadcastingLocate,
    /// Looking up the network address of a known server.
    ResolvingAddress,
    /// Looking up a candidate's server endpoint.
    ResolvingEndpoint,
    /// Looking up a candidate's IEEE address.
    ResolvingIdentity,
    /// Obtaining a link key for the candidate.
    EstablishingKey,
    /// Asking the server for an image.
    Negotiating,
    /// Downloading with block requests.
    TransferringBlocks,
    /// Downloading with page requests.
    TransferringPages,
    /// Re-requesting bytes a page left out.
    BackfillingGaps,
    /// Checking and activating the downloaded image.
    Finalizing,
}

impl ClientPhase {
    /// Phases in which discovery is looking for a server.
    #[must_use]
    pub fn is_discovery(self) -> bool {
        matches!(
            self,
            Self::BroadcastingLocate
                | Self::ResolvingAddress
                | Self::ResolvingEndpoint
                | Self::ResolvingIdentity
                | Self::EstablishingKey
        )
    }

    /// Phases in which image data is being moved into storage.
    #[must_use]
    pub fn is_transfer(self) -> bool {
        matches!(
            self,
            Self::TransferringBlocks | Self::TransferringPages | Self::BackfillingGaps
        )
    }

    /// Phases during which a download owns the storage device.
    #[must_use]
    pub fn is_download(self) -> bool {
        self.is_transfer() || self == Self::Finalizing
    }
}

impl fmt::Display for ClientPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_classification() {
        assert!(ClientPhase::ResolvingEndpoint.is_discovery());
        assert!(!ClientPhase::Negotiating.is_discovery());
        assert!(!ClientPhase::Negotiating.is_download());
        assert!(ClientPhase::BackfillingGaps.is_transfer());
        assert!(ClientPhase::Finalizing.is_download());
        assert!(!ClientPhase::Finalizing.is_transfer());
    }
}
