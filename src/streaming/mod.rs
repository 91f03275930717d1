//! Streaming emitter
//!
//! Results leave the scheduler through an [`EventSink`]. Callbacks run on
//! the dispatch thread with no scheduler lock held, so a sink may call back
//! into the scheduler (cancel, enqueue, queries). A panicking sink is caught
//! and logged; the request still finishes normally.

mod blocking;
mod channel;

pub(crate) use blocking::BlockingSink;
pub use channel::{event_stream, ChannelSink, StreamEvent};

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;

use crate::scheduler::{Outcome, RequestId};

/// One generated token
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenEvent {
    pub token_id: u32,
    /// UTF-8 fragment; empty while a character or stop word is incomplete
    pub text: String,
    /// 0-based position among this request's token events
    pub index: usize,
}

/// Receiver of per-request events
pub trait EventSink: Send + Sync {
    /// Called once per generated token, in generation order
    fn on_token(&self, _id: RequestId, _event: &TokenEvent) {}

    /// Called exactly once, after every token event of the request
    fn on_result(&self, id: RequestId, outcome: &Outcome);

    /// Nobody is listening any more; the request gets cancelled
    fn is_closed(&self) -> bool {
        false
    }
}

/// Per-request delivery handle
pub(crate) struct Emitter {
    id: RequestId,
    sink: Arc<dyn EventSink>,
    finished: bool,
}

impl Emitter {
    pub fn new(id: RequestId, sink: Arc<dyn EventSink>) -> Self {
        Self {
            id,
            sink,
            finished: false,
        }
    }

    pub fn token(&self, event: &TokenEvent) {
        if self.finished {
            return;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.sink.on_token(self.id, event)));
        if result.is_err() {
            tracing::error!(id = %self.id, index = event.index, "on_token callback panicked");
        }
    }

    /// Whether the sink reports its receiver gone
    pub fn is_closed(&self) -> bool {
        panic::catch_unwind(AssertUnwindSafe(|| self.sink.is_closed())).unwrap_or(false)
    }

    /// Deliver the final outcome. Later calls are ignored.
    pub fn finish(&mut self, outcome: &Outcome) {
        if std::mem::replace(&mut self.finished, true) {
            tracing::warn!(id = %self.id, "duplicate final result suppressed");
            return;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.sink.on_result(self.id, outcome)));
        if result.is_err() {
            tracing::error!(id = %self.id, "on_result callback panicked");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Sinks used by the test-suite

    use std::sync::{Arc, Condvar, Mutex};
    use std::time::{Duration, Instant};

    use super::{EventSink, TokenEvent};
    use crate::scheduler::{Outcome, RequestId};

    #[derive(Debug, Clone)]
    pub enum Recorded {
        Token(RequestId, TokenEvent),
        Result(Outcome),
    }

    /// Records every event in arrival order
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<Recorded>>,
        cond: Condvar,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn events(&self) -> Vec<Recorded> {
            self.events.lock().unwrap().clone()
        }

        pub fn tokens(&self, id: RequestId) -> Vec<TokenEvent> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Recorded::Token(rid, event) if rid == id => Some(event),
                    _ => None,
                })
                .collect()
        }

        pub fn outcomes(&self) -> Vec<Outcome> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Recorded::Result(outcome) => Some(outcome),
                    _ => None,
                })
                .collect()
        }

        pub fn outcome(&self, id: RequestId) -> Option<Outcome> {
            self.outcomes().into_iter().find(|o| o.id == id)
        }

        /// Position of the first event matching `pred`
        pub fn position(&self, pred: impl Fn(&Recorded) -> bool) -> Option<usize> {
            self.events().iter().position(pred)
        }

        pub fn wait_for(&self, id: RequestId) -> Outcome {
            self.wait_until(|events| {
                events
                    .iter()
                    .any(|e| matches!(e, Recorded::Result(o) if o.id == id))
            });
            self.outcome(id).expect("no final result recorded")
        }

        pub fn wait_for_tokens(&self, id: RequestId, count: usize) {
            self.wait_until(|events| {
                events
                    .iter()
                    .filter(|e| matches!(e, Recorded::Token(rid, _) if *rid == id))
                    .count()
                    >= count
            });
        }

        fn wait_until(&self, done: impl Fn(&[Recorded]) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut events = self.events.lock().unwrap();
            while !done(&events) {
                let now = Instant::now();
                assert!(now < deadline, "timed out waiting for events");
                events = self.cond.wait_timeout(events, deadline - now).unwrap().0;
            }
        }

        fn push(&self, event: Recorded) {
            self.events.lock().unwrap().push(event);
            self.cond.notify_all();
        }
    }

    impl EventSink for RecordingSink {
        fn on_token(&self, id: RequestId, event: &TokenEvent) {
            self.push(Recorded::Token(id, event.clone()));
        }

        fn on_result(&self, _id: RequestId, outcome: &Outcome) {
            self.push(Recorded::Result(outcome.clone()));
        }
    }

    /// Runs a closure on every final result
    pub struct FnSink<F>(pub F);

    impl<F> EventSink for FnSink<F>
    where
        F: Fn(RequestId, &Outcome) + Send + Sync,
    {
        fn on_result(&self, id: RequestId, outcome: &Outcome) {
            (self.0)(id, outcome)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use crate::scheduler::RequestKind;

    struct PanickingSink;

    impl EventSink for PanickingSink {
        fn on_token(&self, _id: RequestId, _event: &TokenEvent) {
            panic!("token sink exploded");
        }

        fn on_result(&self, _id: RequestId, _outcome: &Outcome) {
            panic!("result sink exploded");
        }
    }

    fn event(index: usize) -> TokenEvent {
        TokenEvent {
            token_id: 1,
            text: "x".to_string(),
            index,
        }
    }

    #[test]
    fn test_final_result_delivered_once() {
        let sink = RecordingSink::new();
        let id = RequestId::new(1);
        let mut emitter = Emitter::new(id, sink.clone());
        emitter.token(&event(0));
        let outcome = Outcome::cancelled(id, RequestKind::Completion);
        emitter.finish(&outcome);
        emitter.finish(&outcome);
        emitter.token(&event(1));

        assert_eq!(sink.outcomes().len(), 1);
        assert_eq!(sink.tokens(id).len(), 1);
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        let id = RequestId::new(2);
        let mut emitter = Emitter::new(id, Arc::new(PanickingSink));
        emitter.token(&event(0));
        emitter.finish(&Outcome::cancelled(id, RequestKind::Embedding));
    }
}
