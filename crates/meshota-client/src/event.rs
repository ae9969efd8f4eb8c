//! Events the client consumes and notifications it produces.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::{StorageCompletion, StorageOp, TimerToken};
use crate::address::{Endpoint, ExtendedAddress, ServerIdentity, ShortAddress};
use crate::image::ImageDescriptor;
use crate::protocol::{ImageNotify, Response};

/// Everything that can advance the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The application wants the client running.
    Start,
    /// The application wants the client stopped.
    Stop,
    /// A response arrived from the network.
    Response {
        /// Sender's network address.
        source: ShortAddress,
        /// The response.
        response: Response,
    },
    /// An unsolicited image announcement arrived.
    ImageNotify {
        /// Sender's network address.
        source: ShortAddress,
        /// Sender's server endpoint.
        endpoint: Endpoint,
        /// The announcement.
        notify: ImageNotify,
    },
    /// A timer armed by the client expired.
    TimerFired(TimerToken),
    /// A storage operation completed.
    StorageDone(StorageCompletion),
}

/// Why a download was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The server stopped answering.
    ServerUnreachable,
    /// The server aborted the download.
    ServerAborted,
    /// The storage device reported an error.
    StorageFault,
    /// The downloaded image failed its integrity check.
    IntegrityFailure,
}

/// Outcomes reported to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientNotification {
    /// Discovery settled on a server.
    ServerFound(ServerIdentity),
    /// A server stopped responding.
    ServerLost(ExtendedAddress),
    /// A download began.
    DownloadStarted {
        /// The image.
        image: ImageDescriptor,
        /// Offset the download resumed from; zero for a fresh download.
        resumed_from: u32,
    },
    /// A download was abandoned; the previous image stays active.
    DownloadAborted {
        /// The image.
        image: ImageDescriptor,
        /// Why.
        reason: AbortReason,
    },
    /// A new image was verified and activated.
    DownloadFinished {
        /// The image.
        image: ImageDescriptor,
        /// Delay the server asked for before running it, if it answered.
        upgrade_delay: Option<Duration>,
        /// Whether the server acknowledged the completion report.
        acknowledged: bool,
    },
    /// A storage operation failed.
    StorageFault(StorageOp),
    /// The storage device could not be initialized.
    HardwareFault,
    /// The client stopped.
    Stopped,
}

/// Receives notifications.
pub type NotificationCallback = Box<dyn FnMut(&ClientNotification)>;
