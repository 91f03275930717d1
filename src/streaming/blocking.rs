//! Sink behind the blocking completion call

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use super::{EventSink, TokenEvent};
use crate::scheduler::{Outcome, RequestId};

/// Forwards tokens to a closure and hands the outcome to the waiting caller
pub(crate) struct BlockingSink<F> {
    on_token: F,
    done: Sender<Outcome>,
}

impl<F> BlockingSink<F>
where
    F: Fn(&TokenEvent) + Send + Sync,
{
    pub fn new(on_token: F) -> (Arc<Self>, Receiver<Outcome>) {
        let (done, rx) = mpsc::channel();
        (Arc::new(Self { on_token, done }), rx)
    }
}

impl<F> EventSink for BlockingSink<F>
where
    F: Fn(&TokenEvent) + Send + Sync,
{
    fn on_token(&self, _id: RequestId, event: &TokenEvent) {
        (self.on_token)(event)
    }

    fn on_result(&self, _id: RequestId, outcome: &Outcome) {
        let _ = self.done.send(outcome.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RequestKind;
    use std::sync::Mutex;

    #[test]
    fn test_forwards_tokens_and_outcome() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (sink, rx) = {
            let seen = Arc::clone(&seen);
            BlockingSink::new(move |event: &TokenEvent| seen.lock().unwrap().push(event.index))
        };
        let id = RequestId::new(3);
        sink.on_token(
            id,
            &TokenEvent {
                token_id: 1,
                text: "a".to_string(),
                index: 0,
            },
        );
        sink.on_result(id, &Outcome::cancelled(id, RequestKind::Completion));

        assert_eq!(*seen.lock().unwrap(), vec![0]);
        assert!(rx.recv().unwrap().is_cancelled());
    }
}
