//! Shared test utilities for the MeshOTA client.
//!
//! # Modules
//!
//! - [`mod@must`] - Unwrap helpers with good error messages and `#[track_caller]`
//! - [`sim`] - Deterministic simulation of servers, flash, timers and persistence
//! - [`harness`] - Drives an [`OtaClient`](meshota_client::OtaClient) through a simulated world
//! - [`fixtures`] - Image and configuration builders
//!
//! # Usage
//!
//! ```rust,ignore
//! use meshota_test_helpers::prelude::*;
//!
//! let body = test_body(4096);
//! let world = SimWorld::new().with_server(SimServer::new(0x1234, 0xAA).serving(2, &body));
//! let mut harness = must(Harness::new(test_config(), world));
//! harness.start();
//! assert!(harness.run_until_finished(100_000));
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::unwrap_used, clippy::panic)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod fixtures;
pub mod harness;
pub mod must;
pub mod prelude;
pub mod sim;

pub use must::*;

/// Install a `fmt` subscriber honouring `RUST_LOG`, once per process.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
