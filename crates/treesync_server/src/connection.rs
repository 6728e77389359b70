//! Per-connection state.

use crate::fanout::Fanout;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use treesync_core::{send_envelope, EventOutbox, Hooks, Transport, Unsubscribe};
use treesync_protocol::{ClientBound, Path};
use uuid::Uuid;

/// Unique identifier for a server-side connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a new random connection ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Converts to a UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One accepted client.
///
/// Owns the outbox that batches events for the client, the keep-alive flag
/// and the handles of the client's value and key subscriptions in the
/// server's fan-out.
pub(crate) struct Connection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    outbox: EventOutbox,
    alive: AtomicBool,
    values: Mutex<HashMap<Path, Unsubscribe<Fanout>>>,
    keys: Mutex<HashMap<Path, Unsubscribe<Fanout>>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        transport: Arc<dyn Transport>,
        interval: Duration,
        hooks: Arc<Hooks>,
    ) -> Arc<Self> {
        let sink_transport = Arc::clone(&transport);
        let outbox = EventOutbox::new(interval, move |envelope| {
            send_envelope(sink_transport.as_ref(), &hooks, envelope)
        });
        Arc::new(Self {
            id,
            transport,
            outbox,
            alive: AtomicBool::new(true),
            values: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Queues a message for the next window.
    pub(crate) fn push(&self, message: ClientBound) {
        match message.to_event() {
            Ok(event) => self.outbox.push(event),
            Err(err) => warn!(connection = %self.id, %err, "failed to encode event"),
        }
    }

    pub(crate) fn flush(&self) {
        self.outbox.flush_now();
    }

    pub(crate) fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Clears the keep-alive flag and returns its previous value.
    pub(crate) fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn has_value_subscription(&self, path: &Path) -> bool {
        self.values.lock().contains_key(path)
    }

    pub(crate) fn add_value_subscription(&self, handle: Unsubscribe<Fanout>) {
        let replaced = self.values.lock().insert(handle.path().clone(), handle);
        if let Some(old) = replaced {
            old.unsubscribe();
        }
    }

    pub(crate) fn add_key_subscription(&self, handle: Unsubscribe<Fanout>) {
        let replaced = self.keys.lock().insert(handle.path().clone(), handle);
        if let Some(old) = replaced {
            old.unsubscribe();
        }
    }

    /// Drops the value or key subscription at `path`. Returns false if there
    /// was none.
    pub(crate) fn remove_subscription(&self, path: &Path) -> bool {
        let removed = if path.is_wildcard() {
            self.keys.lock().remove(path)
        } else {
            self.values.lock().remove(path)
        };
        match removed {
            Some(handle) => {
                handle.unsubscribe();
                true
            }
            None => false,
        }
    }

    /// Drops every subscription of this connection.
    pub(crate) fn clear_subscriptions(&self) {
        let values: Vec<_> = self.values.lock().drain().map(|(_, h)| h).collect();
        let keys: Vec<_> = self.keys.lock().drain().map(|(_, h)| h).collect();
        for handle in values.into_iter().chain(keys) {
            handle.unsubscribe();
        }
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.values.lock().len() + self.keys.lock().len()
    }
}
