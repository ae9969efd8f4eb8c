//! Request and response value types exchanged with upgrade servers.
//!
//! Every message is an owned, immutable value. The transport adapter is free
//! to encode them into whatever frames the mesh stack uses; the engine only
//! ever sees these types.

use core::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{Endpoint, ExtendedAddress, ShortAddress};
use crate::image::{ImageDescriptor, ImageKey, WILDCARD_IMAGE_TYPE, WILDCARD_MANUFACTURER};

/// Status codes carried by upgrade cluster commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpgradeStatus {
    /// Operation succeeded.
    Success,
    /// The sender abandoned the download.
    Abort,
    /// The client is not allowed to download from this server.
    NotAuthorized,
    /// The downloaded image failed verification.
    InvalidImage,
    /// The server is not ready to serve data yet.
    WaitForData,
    /// The server has no image for this client.
    NoImageAvailable,
    /// The command could not be parsed.
    MalformedCommand,
    /// The command is not supported by the receiver.
    UnsupportedCommand,
    /// The image is incomplete.
    RequireMoreImage,
}

impl UpgradeStatus {
    /// Wire code of this status.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::NotAuthorized => 0x7E,
            Self::MalformedCommand => 0x80,
            Self::UnsupportedCommand => 0x81,
            Self::Abort => 0x95,
            Self::InvalidImage => 0x96,
            Self::WaitForData => 0x97,
            Self::NoImageAvailable => 0x98,
            Self::RequireMoreImage => 0x99,
        }
    }

    /// Status for a wire code, if the code is one the client understands.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => Self::Success,
            0x7E => Self::NotAuthorized,
            0x80 => Self::MalformedCommand,
            0x81 => Self::UnsupportedCommand,
            0x95 => Self::Abort,
            0x96 => Self::InvalidImage,
            0x97 => Self::WaitForData,
            0x98 => Self::NoImageAvailable,
            0x99 => Self::RequireMoreImage,
            _ => return None,
        })
    }
}

impl fmt::Display for UpgradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}(0x{:02X})", self.code())
    }
}

/// Where a request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Every node in the network.
    Broadcast,
    /// One node, optionally addressed at a specific endpoint.
    Unicast {
        /// Network address of the node.
        address: ShortAddress,
        /// Target endpoint, when known.
        endpoint: Option<Endpoint>,
    },
    /// The network's trust center.
    TrustCenter,
}

/// Query for an image newer than the one the client runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryNextImageRequest {
    /// The client's own product key and running version.
    pub key: ImageKey,
    /// Hardware revision, when the client reports one.
    pub hardware_version: Option<u16>,
}

/// Request for one block of image data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBlockRequest {
    /// Image being downloaded.
    pub key: ImageKey,
    /// Offset of the first requested byte.
    pub offset: u32,
    /// Maximum number of data bytes the server may return.
    pub max_data_size: u8,
}

/// Request for a page of image data, answered by several block responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePageRequest {
    /// Image being downloaded.
    pub key: ImageKey,
    /// Offset of the first requested byte.
    pub offset: u32,
    /// Maximum number of data bytes in each block response.
    pub max_data_size: u8,
    /// Number of bytes the page covers.
    pub page_size: u16,
    /// Requested gap between consecutive block responses, in milliseconds.
    pub response_spacing_ms: u16,
}

/// Report of the download outcome to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeEndRequest {
    /// Outcome of the download.
    pub status: UpgradeStatus,
    /// Image the outcome refers to.
    pub key: ImageKey,
}

/// A request sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Search for nodes hosting an upgrade server cluster.
    Locate {
        /// The client's product key.
        key: ImageKey,
    },
    /// Look up the network address of a known IEEE address.
    ResolveShortAddress {
        /// IEEE address to resolve.
        extended: ExtendedAddress,
    },
    /// Look up the IEEE address behind a network address.
    ResolveExtendedAddress {
        /// Network address to resolve.
        short: ShortAddress,
    },
    /// Look up the endpoint hosting the upgrade server cluster.
    ResolveEndpoint {
        /// Node to query.
        short: ShortAddress,
    },
    /// Ask the trust center for an application link key.
    RequestLinkKey {
        /// Node the key will be shared with.
        partner: ExtendedAddress,
    },
    /// Ask for an applicable image.
    QueryNextImage(QueryNextImageRequest),
    /// Ask for one block.
    ImageBlock(ImageBlockRequest),
    /// Ask for one page.
    ImagePage(ImagePageRequest),
    /// Report the download outcome.
    UpgradeEnd(UpgradeEndRequest),
}

impl Request {
    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Locate { .. } => "locate",
            Self::ResolveShortAddress { .. } => "resolve-short",
            Self::ResolveExtendedAddress { .. } => "resolve-extended",
            Self::ResolveEndpoint { .. } => "resolve-endpoint",
            Self::RequestLinkKey { .. } => "request-link-key",
            Self::QueryNextImage(_) => "query-next-image",
            Self::ImageBlock(_) => "image-block",
            Self::ImagePage(_) => "image-page",
            Self::UpgradeEnd(_) => "upgrade-end",
        }
    }
}

/// Answer to a query-next-image request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryNextImageResponse {
    /// Outcome of the query.
    pub status: UpgradeStatus,
    /// The offered image, present when `status` is `Success`.
    pub image: Option<ImageDescriptor>,
}

impl QueryNextImageResponse {
    /// A response offering `image`.
    #[must_use]
    pub fn offer(image: ImageDescriptor) -> Self {
        Self {
            status: UpgradeStatus::Success,
            image: Some(image),
        }
    }

    /// A response without an image.
    #[must_use]
    pub fn refuse(status: UpgradeStatus) -> Self {
        Self {
            status,
            image: None,
        }
    }
}

/// Answer to an image block request, or one block of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageBlockResponse {
    /// Image data.
    Success {
        /// Image the data belongs to.
        key: ImageKey,
        /// Offset of the first byte in `data`.
        offset: u32,
        /// The bytes.
        data: Vec<u8>,
    },
    /// Flow control: the server wants the client to ask again later.
    WaitForData {
        /// Server's current time, in seconds.
        current_time: u32,
        /// Time at which the client should ask again, in seconds.
        request_time: u32,
        /// Suggested minimum delay between block requests, in milliseconds.
        minimum_block_delay_ms: u16,
    },
    /// The server abandoned the download.
    Abort,
}

/// Peer deferral requested by a wait-for-data response.
///
/// A request time in the future wins over the suggested block delay.
#[must_use]
pub fn wait_for_data_delay(current_time: u32, request_time: u32, minimum_block_delay_ms: u16) -> Duration {
    if request_time > current_time {
        Duration::from_secs(u64::from(request_time.saturating_sub(current_time)))
    } else {
        Duration::from_millis(u64::from(minimum_block_delay_ms))
    }
}

/// Server acknowledgement of a successful upgrade-end report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeEndResponse {
    /// Image the acknowledgement refers to.
    pub key: ImageKey,
    /// Server's current time, in seconds.
    pub current_time: u32,
    /// Time at which the new image should run, in seconds.
    pub upgrade_time: u32,
}

impl UpgradeEndResponse {
    /// Upgrade time value meaning "wait for a further command".
    pub const WAIT_FOR_COMMAND: u32 = 0xFFFF_FFFF;

    /// How long the application should wait before running the new image.
    ///
    /// `None` means the server will trigger the upgrade later.
    #[must_use]
    pub fn upgrade_delay(&self) -> Option<Duration> {
        if self.upgrade_time == Self::WAIT_FOR_COMMAND {
            return None;
        }
        Some(Duration::from_secs(u64::from(
            self.upgrade_time.saturating_sub(self.current_time),
        )))
    }
}

/// A response delivered to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// A node answered a locate search.
    LocateCandidate {
        /// Network address of the node.
        short: ShortAddress,
        /// Endpoint hosting the server cluster, if the answer named one.
        endpoint: Option<Endpoint>,
    },
    /// The locate search is over.
    LocateComplete,
    /// An address lookup succeeded.
    AddressResolved {
        /// Network address.
        short: ShortAddress,
        /// IEEE address.
        extended: ExtendedAddress,
    },
    /// An address lookup failed.
    AddressNotFound,
    /// An endpoint lookup succeeded.
    EndpointResolved {
        /// Node that was queried.
        short: ShortAddress,
        /// Endpoint hosting the server cluster.
        endpoint: Endpoint,
    },
    /// The queried node hosts no server cluster.
    EndpointNotFound {
        /// Node that was queried.
        short: ShortAddress,
    },
    /// Result of a link key request.
    LinkKey {
        /// Node the key is shared with.
        partner: ExtendedAddress,
        /// Whether a key is now in place.
        established: bool,
    },
    /// Answer to query-next-image.
    QueryNextImage(QueryNextImageResponse),
    /// A block of image data or a flow-control answer.
    ImageBlock(ImageBlockResponse),
    /// Acknowledgement of upgrade-end.
    UpgradeEnd(UpgradeEndResponse),
    /// Generic failure acknowledgement.
    Default {
        /// Status reported by the peer.
        status: UpgradeStatus,
    },
}

/// Contents of an image announcement, by payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyPayload {
    /// Only a query jitter.
    JitterOnly,
    /// Jitter and manufacturer.
    Manufacturer {
        /// Manufacturer code, or the wildcard.
        manufacturer_id: u16,
    },
    /// Jitter, manufacturer and image type.
    ImageType {
        /// Manufacturer code, or the wildcard.
        manufacturer_id: u16,
        /// Image type, or the wildcard.
        image_type: u16,
    },
    /// Jitter, manufacturer, image type and the new version.
    NewVersion {
        /// Announced image.
        key: ImageKey,
    },
}

/// Unsolicited announcement that a server has an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageNotify {
    /// Percentage chance, 1..=100, that a receiver should react.
    pub query_jitter: u8,
    /// Announced product details.
    pub payload: NotifyPayload,
}

impl ImageNotify {
    /// Whether the announcement concerns a device running `own`.
    #[must_use]
    pub fn concerns(&self, own: &ImageKey) -> bool {
        let manufacturer = |id: u16| id == WILDCARD_MANUFACTURER || id == own.manufacturer_id;
        let image_type = |ty: u16| ty == WILDCARD_IMAGE_TYPE || ty == own.image_type;
        match self.payload {
            NotifyPayload::JitterOnly => true,
            NotifyPayload::Manufacturer { manufacturer_id } => manufacturer(manufacturer_id),
            NotifyPayload::ImageType {
                manufacturer_id,
                image_type: ty,
            } => manufacturer(manufacturer_id) && image_type(ty),
            NotifyPayload::NewVersion { key } => {
                manufacturer(key.manufacturer_id)
                    && image_type(key.image_type)
                    && key.file_version != own.file_version
            }
        }
    }
}
