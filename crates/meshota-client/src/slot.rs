//! Dual-slot image storage
//!
//! The node boots from the active slot while a download lands in the other
//! one. Only a verified image is ever switched to.

use serde::{Deserialize, Serialize};

/// Flash slot identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    /// Slot A
    A,
    /// Slot B
    B,
}

impl Slot {
    /// Get the other slot
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Zero-based index, for storage backends that keep slots in an array
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::A => write!(f, "A"),
            Slot::B => write!(f, "B"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_other() {
        assert_eq!(Slot::A.other(), Slot::B);
        assert_eq!(Slot::B.other(), Slot::A);
    }

    #[test]
    fn test_slot_display() {
        assert_eq!(format!("{}", Slot::A), "A");
        assert_eq!(format!("{}", Slot::B), "B");
    }

    #[test]
    fn test_slot_index() {
        assert_eq!(Slot::A.index(), 0);
        assert_eq!(Slot::B.index(), 1);
        assert_eq!(Slot::A.other().index(), 1);
    }
}
