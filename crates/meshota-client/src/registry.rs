//! Server candidates found during discovery.
//!
//! The registry holds one *active* candidate (the one discovery is currently
//! working on), an optional *priority* candidate taken from an unsolicited
//! announcement, a FIFO queue of the rest, and a short blacklist of servers
//! that refused this client. A candidate is in at most one of the active,
//! priority and queue positions at a time.

use heapless::{Deque, Vec};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::address::{Endpoint, ExtendedAddress, ServerIdentity, ShortAddress};

/// Capacity of the candidate queue.
pub const MAX_CANDIDATES: usize = 8;

/// Capacity of the blacklist. The oldest entry is evicted when it is full.
pub const MAX_BLACKLISTED: usize = 4;

/// A device that may host an upgrade server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCandidate {
    /// Network address.
    pub short_address: ShortAddress,
    /// IEEE address, once resolved.
    pub extended_address: Option<ExtendedAddress>,
    /// Server cluster endpoint, once resolved.
    pub endpoint: Option<Endpoint>,
}

impl ServerCandidate {
    /// A candidate known only by its network address.
    #[must_use]
    pub fn new(short_address: ShortAddress) -> Self {
        Self {
            short_address,
            extended_address: None,
            endpoint: None,
        }
    }

    /// Attach an endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Option<Endpoint>) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Fully resolved identity, when both addresses and the endpoint are known.
    #[must_use]
    pub fn identity(&self) -> Option<ServerIdentity> {
        Some(ServerIdentity {
            short_address: self.short_address,
            extended_address: self.extended_address?,
            endpoint: self.endpoint?,
        })
    }
}

/// Candidate bookkeeping for one discovery cycle.
#[derive(Debug, Default, Clone)]
pub struct CandidateRegistry {
    active: Option<ServerCandidate>,
    priority: Option<ServerCandidate>,
    queue: Deque<ServerCandidate, MAX_CANDIDATES>,
    blacklist: Vec<ExtendedAddress, MAX_BLACKLISTED>,
}

impl CandidateRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a discovery cycle: forget queued candidates, the active one and
    /// the blacklist. A pending priority candidate survives.
    pub fn begin_cycle(&mut self) {
        self.active = None;
        self.queue.clear();
        self.blacklist.clear();
        trace!("Candidate registry reset for new cycle");
    }

    /// Append a discovered candidate.
    ///
    /// Returns `false` when the candidate is already known, blacklisted, or
    /// the queue is full.
    pub fn enqueue(&mut self, candidate: ServerCandidate) -> bool {
        if self.contains(candidate.short_address) || self.rejects(&candidate) {
            return false;
        }
        match self.queue.push_back(candidate) {
            Ok(()) => true,
            Err(dropped) => {
                debug!(address = %dropped.short_address, "Candidate queue full, dropping");
                false
            }
        }
    }

    /// Put an announced candidate ahead of everything queued.
    ///
    /// A queued entry for the same node is removed. An older priority
    /// candidate moves to the back of the queue. Returns `false` if the
    /// candidate is the active one or blacklisted.
    pub fn prioritize(&mut self, candidate: ServerCandidate) -> bool {
        if self.is_active(candidate.short_address) || self.rejects(&candidate) {
            return false;
        }
        self.remove_queued(candidate.short_address);
        if let Some(previous) = self.priority.replace(candidate) {
            if previous.short_address != candidate.short_address {
                self.enqueue(previous);
            }
        }
        true
    }

    /// Whether an announced candidate is waiting.
    #[must_use]
    pub fn has_priority(&self) -> bool {
        self.priority.is_some()
    }

    /// Make the next candidate active, preferring the priority slot.
    ///
    /// Any current active candidate is dropped.
    pub fn promote_next(&mut self) -> Option<&ServerCandidate> {
        self.active = self.priority.take().or_else(|| self.queue.pop_front());
        self.active.as_ref()
    }

    /// Make `candidate` the active one, outside the queue.
    pub fn activate(&mut self, candidate: ServerCandidate) {
        self.remove_queued(candidate.short_address);
        self.active = Some(candidate);
    }

    /// The candidate discovery is working on.
    #[must_use]
    pub fn active(&self) -> Option<&ServerCandidate> {
        self.active.as_ref()
    }

    /// Mutable access to the active candidate.
    pub fn active_mut(&mut self) -> Option<&mut ServerCandidate> {
        self.active.as_mut()
    }

    /// Drop the active candidate.
    pub fn take_active(&mut self) -> Option<ServerCandidate> {
        self.active.take()
    }

    /// Move the active candidate to the back of the queue.
    pub fn requeue_active(&mut self) {
        if let Some(candidate) = self.active.take() {
            if !self.enqueue(candidate) {
                debug!(address = %candidate.short_address, "Could not requeue candidate");
            }
        }
    }

    /// Blacklist the active candidate and drop it.
    pub fn blacklist_active(&mut self) {
        if let Some(extended) = self.active.take().and_then(|c| c.extended_address) {
            self.blacklist(extended);
        }
    }

    /// Refuse `extended` until the next cycle.
    pub fn blacklist(&mut self, extended: ExtendedAddress) {
        if self.is_blacklisted(extended) {
            return;
        }
        if self.blacklist.is_full() && !self.blacklist.is_empty() {
            let evicted = self.blacklist.remove(0);
            trace!(%evicted, "Blacklist full, evicting oldest");
        }
        if self.blacklist.push(extended).is_ok() {
            debug!(%extended, "Server blacklisted");
        }
    }

    /// Whether `extended` is blacklisted.
    #[must_use]
    pub fn is_blacklisted(&self, extended: ExtendedAddress) -> bool {
        self.blacklist.contains(&extended)
    }

    /// Whether the node is active, prioritized or queued.
    #[must_use]
    pub fn contains(&self, short: ShortAddress) -> bool {
        self.is_active(short)
            || self.priority.is_some_and(|c| c.short_address == short)
            || self.queue.iter().any(|c| c.short_address == short)
    }

    /// Queued candidates in order, excluding the priority slot.
    pub fn queued(&self) -> impl Iterator<Item = &ServerCandidate> {
        self.queue.iter()
    }

    /// Candidates waiting, including the priority slot.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.queue.len() + usize::from(self.priority.is_some())
    }

    /// Forget everything, including a pending priority candidate.
    pub fn clear(&mut self) {
        self.begin_cycle();
        self.priority = None;
    }

    fn is_active(&self, short: ShortAddress) -> bool {
        self.active.is_some_and(|c| c.short_address == short)
    }

    fn rejects(&self, candidate: &ServerCandidate) -> bool {
        candidate
            .extended_address
            .is_some_and(|extended| self.is_blacklisted(extended))
    }

    fn remove_queued(&mut self, short: ShortAddress) {
        let mut kept = Deque::new();
        while let Some(candidate) = self.queue.pop_front() {
            if candidate.short_address != short {
                if let Err(dropped) = kept.push_back(candidate) {
                    debug!(address = %dropped.short_address, "Candidate lost while compacting queue");
                }
            }
        }
        self.queue = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(short: u16) -> ServerCandidate {
        ServerCandidate::new(ShortAddress(short))
    }

    #[test]
    fn test_fifo_order() {
        let mut registry = CandidateRegistry::new();
        assert!(registry.enqueue(candidate(1)));
        assert!(registry.enqueue(candidate(2)));
        assert!(!registry.enqueue(candidate(1)));

        assert_eq!(registry.promote_next().map(|c| c.short_address), Some(ShortAddress(1)));
        assert_eq!(registry.promote_next().map(|c| c.short_address), Some(ShortAddress(2)));
        assert!(registry.promote_next().is_none());
    }

    #[test]
    fn test_active_never_queued() {
        let mut registry = CandidateRegistry::new();
        registry.enqueue(candidate(1));
        registry.promote_next();
        assert!(!registry.enqueue(candidate(1)));
        assert_eq!(registry.queued().count(), 0);

        registry.activate(candidate(2));
        assert!(registry.queued().all(|c| c.short_address != ShortAddress(2)));
    }

    #[test]
    fn test_priority_preempts_queue_and_requeues_active() {
        let mut registry = CandidateRegistry::new();
        registry.enqueue(candidate(1));
        registry.enqueue(candidate(2));
        registry.promote_next();

        assert!(registry.prioritize(candidate(3)));
        registry.requeue_active();
        assert_eq!(registry.promote_next().map(|c| c.short_address), Some(ShortAddress(3)));

        let order: std::vec::Vec<_> = registry.queued().map(|c| c.short_address.0).collect();
        assert_eq!(order, [2, 1]);
    }

    #[test]
    fn test_prioritize_removes_queued_duplicate() {
        let mut registry = CandidateRegistry::new();
        registry.enqueue(candidate(1));
        registry.enqueue(candidate(2));
        assert!(registry.prioritize(candidate(2)));
        assert_eq!(registry.waiting(), 2);
        assert_eq!(registry.queued().count(), 1);
    }

    #[test]
    fn test_blacklist_rejects_and_evicts_oldest() {
        let mut registry = CandidateRegistry::new();
        for extended in 0..=MAX_BLACKLISTED as u64 {
            registry.blacklist(ExtendedAddress(extended));
        }
        assert!(!registry.is_blacklisted(ExtendedAddress(0)));
        assert!(registry.is_blacklisted(ExtendedAddress(MAX_BLACKLISTED as u64)));

        let mut refused = candidate(9);
        refused.extended_address = Some(ExtendedAddress(1));
        assert!(!registry.enqueue(refused));
        assert!(!registry.prioritize(refused));
    }

    #[test]
    fn test_begin_cycle_keeps_priority() {
        let mut registry = CandidateRegistry::new();
        registry.enqueue(candidate(1));
        registry.blacklist(ExtendedAddress(5));
        registry.prioritize(candidate(2));

        registry.begin_cycle();
        assert!(!registry.is_blacklisted(ExtendedAddress(5)));
        assert_eq!(registry.waiting(), 1);
        assert!(registry.has_priority());

        registry.clear();
        assert_eq!(registry.waiting(), 0);
    }

    #[test]
    fn test_blacklist_active() {
        let mut registry = CandidateRegistry::new();
        let mut server = candidate(1);
        server.extended_address = Some(ExtendedAddress(77));
        registry.activate(server);

        registry.blacklist_active();
        assert!(registry.active().is_none());
        assert!(registry.is_blacklisted(ExtendedAddress(77)));
    }
}
