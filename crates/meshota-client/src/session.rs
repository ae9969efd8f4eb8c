//! Working memory of one client.
//!
//! The engines keep no state of their own. Everything they need between two
//! events lives here, is owned by [`OtaClient`](crate::client::OtaClient),
//! and is lent to one engine call at a time.

use std::time::Duration;

use heapless::Vec as BoundedVec;

use crate::adapters::{Checkpoint, StorageOp, StorageTicket, TimerToken};
use crate::address::{ExtendedAddress, KnownServer, ServerIdentity, ShortAddress};
use crate::config::ClientConfig;
use crate::image::ImageDescriptor;
use crate::progress::{PageWindow, TransferProgress, WriteBuffer};
use crate::registry::CandidateRegistry;
use crate::retry::RetryBudgets;
use crate::slot::Slot;

/// A storage operation, kept until it completes so it can be re-issued
/// while the device is busy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StorageRequest {
    Init,
    Erase { slot: Slot, len: u32 },
    Write { slot: Slot, offset: u32, bytes: Vec<u8> },
    Checksum { slot: Slot, len: u32 },
    Verify { slot: Slot, len: u32, expected: u32 },
    Switch { from: Slot, to: Slot },
}

impl StorageRequest {
    pub(crate) fn op(&self) -> StorageOp {
        match self {
            Self::Init => StorageOp::Init,
            Self::Erase { .. } => StorageOp::Erase,
            Self::Write { .. } => StorageOp::Write,
            Self::Checksum { .. } => StorageOp::Checksum,
            Self::Verify { .. } => StorageOp::Verify,
            Self::Switch { .. } => StorageOp::Switch,
        }
    }
}

/// The one operation the client is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) enum Pending {
    #[default]
    Idle,
    Response,
    Storage {
        ticket: StorageTicket,
        request: StorageRequest,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerPurpose {
    DiscoveryWindow,
    ResponseTimeout,
    StorageBusy,
    PeerDeferral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArmedTimer {
    pub(crate) token: TimerToken,
    pub(crate) purpose: TimerPurpose,
}

/// Steps of finalization, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub(crate) enum FinalizeStep {
    #[default]
    Flush,
    FetchTrailer,
    WriteTrailer,
    Verify,
    Switch,
    ReportEnd,
}

/// Session state shared by the engines.
#[derive(Debug)]
pub struct Session {
    pub(crate) registry: CandidateRegistry,
    pub(crate) known_target: Option<KnownServer>,
    pub(crate) resume_hint: Option<Checkpoint>,
    pub(crate) key_established: Option<ExtendedAddress>,
    pub(crate) image: Option<ImageDescriptor>,
    pub(crate) target_slot: Option<Slot>,
    pub(crate) progress: Option<TransferProgress>,
    pub(crate) staging: WriteBuffer,
    pub(crate) page: Option<PageWindow>,
    pub(crate) trailer: BoundedVec<u8, 4>,
    pub(crate) finalize: FinalizeStep,
    pub(crate) retries: RetryBudgets,
    pub(crate) pending: Pending,
    pub(crate) timer: Option<ArmedTimer>,
    pub(crate) next_token: u32,
    pub(crate) next_ticket: u32,
    pub(crate) next_window: Duration,
}

impl Session {
    pub(crate) fn new(config: &ClientConfig) -> Self {
        Self {
            registry: CandidateRegistry::new(),
            known_target: None,
            resume_hint: None,
            key_established: None,
            image: None,
            target_slot: None,
            progress: None,
            staging: WriteBuffer::default(),
            page: None,
            trailer: BoundedVec::new(),
            finalize: FinalizeStep::default(),
            retries: RetryBudgets::new(config.max_retries, config.max_flash_busy_polls),
            pending: Pending::Idle,
            timer: None,
            next_token: 0,
            next_ticket: 0,
            next_window: config.startup_delay,
        }
    }

    /// Candidate bookkeeping.
    #[must_use]
    pub fn registry(&self) -> &CandidateRegistry {
        &self.registry
    }

    /// Image being downloaded.
    #[must_use]
    pub fn image(&self) -> Option<&ImageDescriptor> {
        self.image.as_ref()
    }

    /// Committed progress of the current download.
    #[must_use]
    pub fn progress(&self) -> Option<&TransferProgress> {
        self.progress.as_ref()
    }

    /// Slot the current download is written to.
    #[must_use]
    pub fn target_slot(&self) -> Option<Slot> {
        self.target_slot
    }

    /// Retry budgets.
    #[must_use]
    pub fn retries(&self) -> &RetryBudgets {
        &self.retries
    }

    /// Resolved identity of the active server.
    #[must_use]
    pub fn server(&self) -> Option<ServerIdentity> {
        self.registry.active().and_then(|c| c.identity())
    }

    pub(crate) fn active_short(&self) -> Option<ShortAddress> {
        self.registry.active().map(|c| c.short_address)
    }

    pub(crate) fn awaiting_response(&self) -> bool {
        self.pending == Pending::Response
    }

    pub(crate) fn take_ticket(&mut self) -> StorageTicket {
        self.next_ticket = self.next_ticket.wrapping_add(1);
        StorageTicket(self.next_ticket)
    }

    pub(crate) fn take_token(&mut self) -> TimerToken {
        self.next_token = self.next_token.wrapping_add(1);
        TimerToken(self.next_token)
    }

    /// Checkpoint describing the committed part of the current download.
    pub(crate) fn checkpoint(&self) -> Option<Checkpoint> {
        let progress = self.progress.as_ref()?;
        Some(Checkpoint {
            server: self.server()?,
            image: self.image?,
            offset: progress.current_file_offset.min(progress.sub_image_length),
            checksum: progress.running_checksum,
        })
    }

    /// Forget the download and the candidate being worked on.
    pub(crate) fn end_cycle(&mut self) {
        self.registry.take_active();
        self.known_target = None;
        self.key_established = None;
        self.image = None;
        self.target_slot = None;
        self.progress = None;
        self.staging = WriteBuffer::default();
        self.page = None;
        self.trailer.clear();
        self.finalize = FinalizeStep::default();
        self.pending = Pending::Idle;
    }
}
