//! Batching of outbound traffic into envelopes.

use crate::batcher::{PendingUpdate, UpdateOp};
use crate::queue::BatchingQueue;
use std::time::Duration;
use tracing::warn;
use treesync_protocol::{Envelope, Node, Path, ServerBound, WireEvent};

/// One item fed into an [`EventOutbox`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A ready protocol event.
    Event(WireEvent),
    /// A tree mutation, coalesced with neighbouring mutations.
    Mutation(UpdateOp),
}

#[derive(Debug)]
enum Entry {
    Event(WireEvent),
    Update(PendingUpdate),
}

/// Everything queued during one window, in send order.
///
/// Consecutive mutations share one [`PendingUpdate`]; an event in between
/// starts a new one, so a mutation never overtakes an event queued after it.
#[derive(Debug, Default)]
pub struct OutboxWindow {
    entries: Vec<Entry>,
}

impl OutboxWindow {
    /// Folds one item into the window.
    pub fn push(&mut self, item: Outbound) {
        match item {
            Outbound::Event(event) => self.entries.push(Entry::Event(event)),
            Outbound::Mutation(op) => {
                if let Some(Entry::Update(pending)) = self.entries.last_mut() {
                    pending.push(op);
                    return;
                }
                let mut pending = PendingUpdate::default();
                pending.push(op);
                self.entries.push(Entry::Update(pending));
            }
        }
    }

    /// Turns the window into wire events. Mutations become `data:update`.
    pub fn into_events(self) -> Vec<WireEvent> {
        let mut events = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            match entry {
                Entry::Event(event) => events.push(event),
                Entry::Update(pending) => {
                    let update = pending.into_update();
                    if update.is_empty() {
                        continue;
                    }
                    match ServerBound::Update(update).to_event() {
                        Ok(event) => events.push(event),
                        Err(err) => warn!(%err, "dropping unencodable update"),
                    }
                }
            }
        }
        events
    }
}

/// Collects the traffic of one window into a single [`Envelope`].
pub struct EventOutbox {
    queue: BatchingQueue<OutboxWindow, Outbound>,
}

impl EventOutbox {
    /// Creates an outbox that hands each window's envelope to `sink`.
    pub fn new(interval: Duration, sink: impl Fn(Envelope) + Send + Sync + 'static) -> Self {
        let queue = BatchingQueue::new(
            interval,
            |window: &mut OutboxWindow, item| window.push(item),
            move |window: OutboxWindow| {
                let events = window.into_events();
                if !events.is_empty() {
                    sink(Envelope::new(events));
                }
            },
        );
        Self { queue }
    }

    /// Queues an event.
    pub fn push(&self, event: WireEvent) {
        self.queue.enqueue(Outbound::Event(event));
    }

    /// Queues a root-relative diff.
    pub fn change(&self, diff: Node) {
        self.queue.enqueue(Outbound::Mutation(UpdateOp::Change(diff)));
    }

    /// Queues a delete.
    pub fn delete(&self, path: Path) {
        self.queue.enqueue(Outbound::Mutation(UpdateOp::Delete(path)));
    }

    /// Sends the current window immediately.
    pub fn flush_now(&self) {
        self.queue.flush_now();
    }

    /// Returns true while a window holds unsent traffic.
    pub fn is_pending(&self) -> bool {
        self.queue.is_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn event(name: &str) -> WireEvent {
        WireEvent {
            event: name.into(),
            data: json!({}),
        }
    }

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn diff(value: serde_json::Value) -> Node {
        Node::from_json(value).unwrap()
    }

    fn recording(interval: Duration) -> (EventOutbox, Arc<Mutex<Vec<Envelope>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        let outbox = EventOutbox::new(interval, move |envelope| sink.lock().push(envelope));
        (outbox, sent)
    }

    #[tokio::test(start_paused = true)]
    async fn window_becomes_one_envelope_in_order() {
        let (outbox, sent) = recording(Duration::from_millis(10));

        outbox.push(event("data:subscribe"));
        outbox.push(event("data:unsubscribe"));
        tokio::time::sleep(Duration::from_millis(15)).await;

        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        let names: Vec<&str> = sent[0].events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, vec!["data:subscribe", "data:unsubscribe"]);
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_coalesce_into_one_update() {
        let (outbox, sent) = recording(Duration::from_millis(20));

        outbox.change(diff(json!({"x": 1})));
        outbox.change(diff(json!({"y": 2})));
        outbox.delete(p("w"));
        outbox.change(diff(json!({"x": 3})));
        assert!(outbox.is_pending());

        tokio::time::sleep(Duration::from_millis(25)).await;
        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].events.len(), 1);
        assert_eq!(sent[0].events[0].event, "data:update");
        assert_eq!(
            sent[0].events[0].data,
            json!({
                "change": {"value": {"x": {"value": 3}, "y": {"value": 2}}},
                "delete": ["w"]
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn events_keep_their_place_between_mutations() {
        let (outbox, sent) = recording(Duration::from_millis(20));

        outbox.push(event("data:subscribe"));
        outbox.change(diff(json!({"a": 1})));
        outbox.push(event("data:unsubscribe"));
        outbox.change(diff(json!({"b": 2})));
        outbox.change(diff(json!({"b": 3})));

        tokio::time::sleep(Duration::from_millis(25)).await;
        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        let events: Vec<(&str, &serde_json::Value)> = sent[0]
            .events
            .iter()
            .map(|e| (e.event.as_str(), &e.data))
            .collect();
        assert_eq!(
            events,
            vec![
                ("data:subscribe", &json!({})),
                ("data:update", &json!({"change": {"value": {"a": {"value": 1}}}})),
                ("data:unsubscribe", &json!({})),
                ("data:update", &json!({"change": {"value": {"b": {"value": 3}}}})),
            ]
        );
    }

    #[test]
    fn delete_of_a_fresh_path_is_still_sent() {
        let mut window = OutboxWindow::default();
        window.push(Outbound::Mutation(UpdateOp::Change(diff(json!({"a": 1})))));
        // deleting a path only this window created still reports the delete
        window.push(Outbound::Mutation(UpdateOp::Delete(p("a"))));
        let events = window.into_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, json!({"delete": ["a"]}));

        assert!(OutboxWindow::default().into_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_now_sends_pending_events() {
        let (outbox, sent) = recording(Duration::from_secs(60));
        outbox.push(event("keep-alive:ping"));
        outbox.flush_now();
        assert_eq!(sent.lock().len(), 1);
        assert_eq!(sent.lock()[0].events.len(), 1);
        assert!(!outbox.is_pending());
    }
}
