//! Collaborator interfaces.
//!
//! The engine owns no I/O. Everything it does to the outside world goes
//! through one of these traits, and everything the outside world tells it
//! comes back as a [`ClientEvent`](crate::event::ClientEvent).
//!
//! Storage operations are asynchronous: a call only starts the operation,
//! and its result arrives later as
//! [`ClientEvent::StorageDone`](crate::event::ClientEvent::StorageDone)
//! carrying the same [`StorageTicket`].

use core::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{ExtendedAddress, KnownServer, ServerIdentity};
use crate::error::{OtaResult, TransportError};
use crate::image::ImageDescriptor;
use crate::protocol::{Destination, Request};
use crate::slot::Slot;

/// Request/response messaging over the mesh.
pub trait Transport {
    /// Queue `request` for `destination`.
    ///
    /// A successful return only means the frame was accepted by the stack.
    /// Responses arrive as events.
    fn send(&mut self, destination: Destination, request: Request) -> Result<(), TransportError>;

    /// Whether an application link key with `partner` is already installed.
    fn has_link_key(&self, partner: ExtendedAddress) -> bool;
}

/// Correlates a storage completion with the operation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageTicket(pub u32);

/// Kind of storage operation, for logs and fault reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageOp {
    /// Driver initialization.
    Init,
    /// Slot erase.
    Erase,
    /// Data write.
    Write,
    /// Checksum of a slot prefix.
    Checksum,
    /// Checksum comparison against an expected value.
    Verify,
    /// Active slot switch.
    Switch,
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Erase => "erase",
            Self::Write => "write",
            Self::Checksum => "checksum",
            Self::Verify => "verify",
            Self::Switch => "switch",
        };
        f.write_str(name)
    }
}

/// Result of one storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageOutcome {
    /// The operation completed.
    Done,
    /// The device was busy and did nothing; issue the operation again.
    Busy,
    /// Checksum result.
    Checksum(u32),
    /// Verification found a different checksum than expected.
    Mismatch,
    /// The device reported an error.
    Failed,
}

/// Completion delivered for a storage ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCompletion {
    /// Ticket of the operation.
    pub ticket: StorageTicket,
    /// What happened.
    pub outcome: StorageOutcome,
}

/// Asynchronous dual-slot image storage.
pub trait ImageStorage {
    /// Bring the driver up.
    fn init(&mut self, ticket: StorageTicket);

    /// Erase the first `len` bytes of `slot`.
    fn erase_slot(&mut self, ticket: StorageTicket, slot: Slot, len: u32);

    /// Write `bytes` at `offset` in `slot`.
    fn write_chunk(&mut self, ticket: StorageTicket, slot: Slot, offset: u32, bytes: &[u8]);

    /// Compute the CRC-32 of the first `len` bytes of `slot`.
    fn checksum(&mut self, ticket: StorageTicket, slot: Slot, len: u32);

    /// Recompute the CRC-32 of the first `len` bytes of `slot` and compare it
    /// with `expected`.
    fn verify_checksum(&mut self, ticket: StorageTicket, slot: Slot, len: u32, expected: u32);

    /// Make `to` the slot booted from, replacing `from`.
    fn switch_active(&mut self, ticket: StorageTicket, from: Slot, to: Slot);

    /// Slot the running image was booted from.
    fn active_slot(&self) -> Slot;
}

/// Download state persisted for resumption after a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Server the image was being downloaded from.
    pub server: ServerIdentity,
    /// Image being downloaded.
    pub image: ImageDescriptor,
    /// Bytes committed to storage.
    pub offset: u32,
    /// CRC-32 of the committed bytes.
    pub checksum: u32,
}

/// Crash-safe persistence of a single [`Checkpoint`].
pub trait RecoveryStore {
    /// Persist `checkpoint`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint could not be persisted.
    fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> OtaResult<()>;

    /// Load the persisted checkpoint, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if a checkpoint exists but cannot be read.
    fn load_checkpoint(&self) -> OtaResult<Option<Checkpoint>>;

    /// Remove the persisted checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint could not be removed.
    fn clear_checkpoint(&mut self) -> OtaResult<()>;
}

/// Non-volatile settings the client reads and updates.
pub trait SettingsStore {
    /// Server to contact first in each discovery cycle.
    fn known_server(&self) -> Option<KnownServer>;

    /// Replace the remembered server; `None` forgets it.
    fn store_known_server(&mut self, server: Option<KnownServer>);
}

/// Identifies one armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(pub u32);

/// One-shot timers.
///
/// When a timer expires the host delivers
/// [`ClientEvent::TimerFired`](crate::event::ClientEvent::TimerFired) with
/// its token. Firing a disarmed token is harmless.
pub trait TimerService {
    /// Arm a timer expiring after `after`.
    fn arm(&mut self, token: TimerToken, after: Duration);

    /// Cancel a timer.
    fn disarm(&mut self, token: TimerToken);
}

/// The collaborators a client is built over.
pub struct Adapters {
    /// Mesh messaging.
    pub transport: Box<dyn Transport>,
    /// Image flash.
    pub storage: Box<dyn ImageStorage>,
    /// Checkpoint persistence.
    pub recovery: Box<dyn RecoveryStore>,
    /// Non-volatile settings.
    pub settings: Box<dyn SettingsStore>,
    /// One-shot timers.
    pub timer: Box<dyn TimerService>,
}

impl fmt::Debug for Adapters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapters").finish_non_exhaustive()
    }
}
