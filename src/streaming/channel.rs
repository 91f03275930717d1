//! Channel-backed sink and async stream adapter

use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{EventSink, TokenEvent};
use crate::scheduler::{Outcome, RequestId};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(TokenEvent),
    Done(Outcome),
}

/// Forwards events into an unbounded tokio channel
pub struct ChannelSink {
    tx: UnboundedSender<StreamEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Arc<Self>, UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventSink for ChannelSink {
    fn on_token(&self, _id: RequestId, event: &TokenEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(StreamEvent::Token(event.clone()));
    }

    fn on_result(&self, _id: RequestId, outcome: &Outcome) {
        let _ = self.tx.send(StreamEvent::Done(outcome.clone()));
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Stream of one request's events, ending after its final result
pub fn event_stream(
    mut rx: UnboundedReceiver<StreamEvent>,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let done = matches!(event, StreamEvent::Done(_));
            yield event;
            if done {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RequestKind;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_stream_stops_after_done() {
        let (sink, rx) = ChannelSink::channel();
        let id = RequestId::new(1);
        sink.on_token(
            id,
            &TokenEvent {
                token_id: 4,
                text: "hi".to_string(),
                index: 0,
            },
        );
        sink.on_result(id, &Outcome::cancelled(id, RequestKind::Completion));
        sink.on_result(id, &Outcome::cancelled(id, RequestKind::Completion));

        let events: Vec<StreamEvent> = event_stream(rx).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], StreamEvent::Done(_)));
    }

    #[test]
    fn test_sink_closes_with_receiver() {
        let (sink, rx) = ChannelSink::channel();
        assert!(!sink.is_closed());
        drop(rx);
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_stream_ends_when_sink_dropped() {
        let (sink, rx) = ChannelSink::channel();
        drop(sink);
        let events: Vec<StreamEvent> = event_stream(rx).collect().await;
        assert!(events.is_empty());
    }
}
