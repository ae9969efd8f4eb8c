//! Over-the-air firmware download client for wireless mesh nodes.
//!
//! This crate provides the client side of a mesh OTA upgrade:
//! - Server discovery by broadcast search or a remembered server
//! - Link-key establishment through the trust center
//! - Image negotiation against the running firmware
//! - Block and page transfers with gap backfill and peer flow control
//! - Dual-slot storage with verification before the active slot changes
//! - Checkpoints that let an interrupted download resume after a reset
//!
//! # Architecture
//!
//! [`OtaClient`] is a single state machine driven by [`ClientEvent`]s:
//! responses from the network, timer expiries and storage completions. It
//! never blocks. Everything outside the engine is reached through the
//! collaborator traits in [`adapters`]:
//!
//! - [`adapters::Transport`]: sends requests into the mesh
//! - [`adapters::ImageStorage`]: asynchronous flash operations on the image slots
//! - [`adapters::RecoveryStore`]: persists the download checkpoint
//! - [`adapters::SettingsStore`]: persists the known server
//! - [`adapters::TimerService`]: one-shot timers
//!
//! Supporting modules:
//!
//! - [`config`]: client configuration and validation
//! - [`protocol`]: request and response messages
//! - [`registry`]: server candidates, priority queue and blacklist
//! - [`progress`]: committed progress, write staging and page windows
//! - [`recovery`]: in-memory and file-backed checkpoint stores
//! - [`error`]: error types
//!
//! # Example
//!
//! ```ignore
//! use meshota_client::prelude::*;
//!
//! let config = ClientConfig::builder()
//!     .product(0x1014, 0x0001, 3)
//!     .block_size(48)
//!     .build()?;
//! let mut client = OtaClient::new(config, adapters)?;
//! client.on_notification(|n| tracing::info!(?n, "OTA"));
//! client.handle(ClientEvent::Start);
//!
//! // Feed every response, timer expiry and storage completion back in.
//! client.handle(ClientEvent::TimerFired(token));
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod adapters;
pub mod address;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod image;
pub mod phase;
pub mod prelude;
pub mod progress;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod session;
pub mod settings;
pub mod slot;

mod discovery;
mod finalize;
mod negotiation;
mod transfer;

pub use adapters::{
    Adapters, Checkpoint, ImageStorage, RecoveryStore, SettingsStore, StorageCompletion, StorageOp,
    StorageOutcome, StorageTicket, TimerService, TimerToken, Transport,
};
pub use address::{Endpoint, ExtendedAddress, KnownServer, ServerIdentity, ShortAddress};
pub use client::OtaClient;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{OtaError, OtaResult, TransportError};
pub use event::{AbortReason, ClientEvent, ClientNotification, NotificationCallback};
pub use image::{ImageDescriptor, ImageKey, TRAILER_LEN, seal_image};
pub use phase::ClientPhase;
pub use recovery::{JsonFileRecoveryStore, MemoryRecoveryStore};
pub use settings::MemorySettings;
pub use slot::Slot;
