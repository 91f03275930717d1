//! Cancellation token registry
//!
//! Live requests are tracked by id together with a shared ticket holding
//! their cancel flag and current state. The dispatcher reads tickets without
//! taking the scheduler lock; `cancel` only ever flips a flag.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use super::request::{RequestId, RequestKind, RequestState};

/// Terminal states remembered after a request leaves the registry
const RETIRED_HISTORY: usize = 1024;

/// Cancel flag and state of one request
#[derive(Debug)]
pub(crate) struct RequestTicket {
    kind: RequestKind,
    cancelled: AtomicBool,
    state: AtomicU8,
}

impl RequestTicket {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            cancelled: AtomicBool::new(false),
            state: AtomicU8::new(RequestState::Queued as u8),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Set the cancel flag. Returns `true` on the first call only.
    pub fn request_cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `next` unless already terminal
    pub fn set_state(&self, next: RequestState) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if RequestState::from_u8(current).is_terminal() {
                    None
                } else {
                    Some(next as u8)
                }
            })
            .is_ok()
    }
}

/// Id allocation plus the live ticket table
#[derive(Debug, Default)]
pub(crate) struct CancelRegistry {
    last_id: u64,
    live: HashMap<RequestId, Arc<RequestTicket>>,
    retired: BTreeMap<RequestId, RequestState>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id and track its ticket
    pub fn register(&mut self, kind: RequestKind) -> (RequestId, Arc<RequestTicket>) {
        self.last_id += 1;
        let id = RequestId::new(self.last_id);
        let ticket = Arc::new(RequestTicket::new(kind));
        self.live.insert(id, Arc::clone(&ticket));
        (id, ticket)
    }

    /// Flag a live request. Unknown and finished ids are ignored.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.live
            .get(&id)
            .is_some_and(|ticket| ticket.request_cancel())
    }

    pub fn state(&self, id: RequestId) -> Option<RequestState> {
        self.live
            .get(&id)
            .map(|ticket| ticket.state())
            .or_else(|| self.retired.get(&id).copied())
    }

    /// Drop a finished request, remembering its terminal state
    pub fn retire(&mut self, id: RequestId) {
        if let Some(ticket) = self.live.remove(&id) {
            self.retired.insert(id, ticket.state());
            while self.retired.len() > RETIRED_HISTORY {
                self.retired.pop_first();
            }
        }
    }

    /// Flag every request of `kind` that holds a slot; returns how many were flagged
    pub fn cancel_active(&self, kind: RequestKind) -> usize {
        self.live
            .values()
            .filter(|ticket| ticket.kind() == kind && ticket.state().is_active())
            .filter(|ticket| ticket.request_cancel())
            .count()
    }

    /// Whether any request of `kind` currently holds a slot
    pub fn any_active(&self, kind: RequestKind) -> bool {
        self.live
            .values()
            .any(|ticket| ticket.kind() == kind && ticket.state().is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let mut registry = CancelRegistry::new();
        let (a, _) = registry.register(RequestKind::Completion);
        let (b, _) = registry.register(RequestKind::Embedding);
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);
        assert_eq!(registry.state(a), Some(RequestState::Queued));
        assert_eq!(registry.state(b), Some(RequestState::Queued));
    }

    #[test]
    fn test_cancel_active_skips_queued_and_other_kinds() {
        let mut registry = CancelRegistry::new();
        let (_, running) = registry.register(RequestKind::Completion);
        let (_, queued) = registry.register(RequestKind::Completion);
        let (_, embedding) = registry.register(RequestKind::Embedding);
        running.set_state(RequestState::Streaming);
        embedding.set_state(RequestState::Running);

        assert_eq!(registry.cancel_active(RequestKind::Completion), 1);
        assert!(running.is_cancelled());
        assert!(!queued.is_cancelled());
        assert!(!embedding.is_cancelled());
        assert_eq!(registry.cancel_active(RequestKind::Completion), 0);
    }

    #[test]
    fn test_cancel_is_idempotent_and_ignores_unknown() {
        let mut registry = CancelRegistry::new();
        let (id, ticket) = registry.register(RequestKind::Completion);
        assert!(registry.cancel(id));
        assert!(!registry.cancel(id));
        assert!(ticket.is_cancelled());
        assert!(!registry.cancel(RequestId::new(99)));
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let ticket = RequestTicket::new(RequestKind::Rerank);
        assert!(ticket.set_state(RequestState::Running));
        assert!(ticket.set_state(RequestState::Failed));
        assert!(!ticket.set_state(RequestState::Running));
        assert_eq!(ticket.state(), RequestState::Failed);
    }

    #[test]
    fn test_retire_keeps_final_state() {
        let mut registry = CancelRegistry::new();
        let (id, ticket) = registry.register(RequestKind::Completion);
        ticket.set_state(RequestState::Streaming);
        assert!(registry.any_active(RequestKind::Completion));
        assert!(!registry.any_active(RequestKind::Embedding));

        ticket.set_state(RequestState::Completed);
        registry.retire(id);
        assert_eq!(registry.state(id), Some(RequestState::Completed));
        assert!(!registry.cancel(id));
        assert_eq!(registry.state(RequestId::new(42)), None);
    }
}
