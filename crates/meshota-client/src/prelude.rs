//! Convenience re-exports for common OTA client types

pub use crate::adapters::{
    Adapters, Checkpoint, ImageStorage, RecoveryStore, SettingsStore, StorageCompletion, StorageOp,
    StorageOutcome, StorageTicket, TimerService, TimerToken, Transport,
};
pub use crate::address::{Endpoint, ExtendedAddress, KnownServer, ServerIdentity, ShortAddress};
pub use crate::client::OtaClient;
pub use crate::config::{ClientConfig, ClientConfigBuilder};
pub use crate::error::{OtaError, OtaResult, TransportError};
pub use crate::event::{AbortReason, ClientEvent, ClientNotification};
pub use crate::image::{ImageDescriptor, ImageKey};
pub use crate::phase::ClientPhase;
pub use crate::progress::{AddressStatus, TransferProgress};
pub use crate::protocol::{
    Destination, ImageBlockResponse, ImageNotify, NotifyPayload, QueryNextImageResponse, Request,
    Response, UpgradeEndResponse, UpgradeStatus,
};
pub use crate::recovery::{JsonFileRecoveryStore, MemoryRecoveryStore};
pub use crate::settings::MemorySettings;
pub use crate::slot::Slot;
