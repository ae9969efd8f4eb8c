//! Convenience re-exports for tests

pub use crate::fixtures::{descriptor_for, test_body, test_config};
pub use crate::harness::Harness;
pub use crate::must::{must, must_some};
pub use crate::sim::{SimFlash, SimServer, SimWorld};
