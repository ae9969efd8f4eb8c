//! Bounded per-phase retry budgets.

use serde::{Deserialize, Serialize};

/// A small failure budget.
///
/// The counter starts full, loses one unit per failure and is exhausted at
/// zero. With a maximum of `N`, the `N`-th consecutive failure exhausts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounter {
    max: u16,
    remaining: u16,
}

impl RetryCounter {
    /// Create a full counter.
    #[must_use]
    pub fn new(max: u16) -> Self {
        Self {
            max,
            remaining: max,
        }
    }

    /// Refill the counter.
    pub fn reset(&mut self) {
        self.remaining = self.max;
    }

    /// Record one failure. Returns `true` when the budget is now exhausted.
    pub fn record_failure(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }

    /// Failures still tolerated.
    #[must_use]
    pub fn remaining(&self) -> u16 {
        self.remaining
    }

    /// Configured budget.
    #[must_use]
    pub fn max(&self) -> u16 {
        self.max
    }

    /// Whether the budget is used up.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// Which budget a failure is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryKind {
    /// Short/extended address resolution.
    Address,
    /// Endpoint resolution.
    Endpoint,
    /// Link key establishment.
    Key,
    /// Query, block, page and upgrade-end requests.
    Request,
    /// Busy polls of one storage operation.
    Flash,
}

/// The complete set of budgets of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudgets {
    address: RetryCounter,
    endpoint: RetryCounter,
    key: RetryCounter,
    request: RetryCounter,
    flash: RetryCounter,
}

impl RetryBudgets {
    /// Network phases get `network_max` attempts, storage operations
    /// `flash_max` busy polls.
    #[must_use]
    pub fn new(network_max: u8, flash_max: u16) -> Self {
        let network = RetryCounter::new(u16::from(network_max));
        Self {
            address: network,
            endpoint: network,
            key: network,
            request: network,
            flash: RetryCounter::new(flash_max),
        }
    }

    /// Budget for `kind`.
    #[must_use]
    pub fn get(&self, kind: RetryKind) -> &RetryCounter {
        match kind {
            RetryKind::Address => &self.address,
            RetryKind::Endpoint => &self.endpoint,
            RetryKind::Key => &self.key,
            RetryKind::Request => &self.request,
            RetryKind::Flash => &self.flash,
        }
    }

    /// Mutable budget for `kind`.
    pub fn get_mut(&mut self, kind: RetryKind) -> &mut RetryCounter {
        match kind {
            RetryKind::Address => &mut self.address,
            RetryKind::Endpoint => &mut self.endpoint,
            RetryKind::Key => &mut self.key,
            RetryKind::Request => &mut self.request,
            RetryKind::Flash => &mut self.flash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausts_on_nth_failure() {
        let mut counter = RetryCounter::new(3);
        assert!(!counter.record_failure());
        assert!(!counter.record_failure());
        assert!(counter.record_failure());
        assert!(counter.is_exhausted());
        assert!(counter.record_failure());
    }

    #[test]
    fn test_reset_refills() {
        let mut counter = RetryCounter::new(2);
        counter.record_failure();
        assert_eq!(counter.remaining(), 1);
        counter.reset();
        assert_eq!(counter.remaining(), counter.max());
    }

    #[test]
    fn test_budgets_are_independent() {
        let mut budgets = RetryBudgets::new(3, 20);
        budgets.get_mut(RetryKind::Address).record_failure();
        assert_eq!(budgets.get(RetryKind::Address).remaining(), 2);
        assert_eq!(budgets.get(RetryKind::Endpoint).remaining(), 3);
        assert_eq!(budgets.get(RetryKind::Flash).remaining(), 20);
    }
}
