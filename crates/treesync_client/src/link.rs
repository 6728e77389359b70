//! Wire side of the client's subscription ledger.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use treesync_core::{EventOutbox, Transport, WireLink};
use treesync_protocol::{BatchedUpdate, Path, PathError, ServerBound, SubscribeRequest};

/// Wire subscriptions whose next inbound message is a full snapshot.
///
/// The server answers a subscribe with the state it holds at that moment,
/// so local writes sent after the request are missing from the snapshot and
/// are never echoed back. Each awaiting path keeps those writes, scoped to
/// the path, until its snapshot lands and they can be replayed over it.
#[derive(Debug, Default)]
pub(crate) struct AwaitingSnapshots {
    paths: HashMap<Path, Vec<BatchedUpdate>>,
}

impl AwaitingSnapshots {
    pub(crate) fn contains(&self, path: &Path) -> bool {
        self.paths.contains_key(path)
    }

    fn expect(&mut self, path: &Path) {
        self.paths.insert(path.clone(), Vec::new());
    }

    fn cancel(&mut self, path: &Path) {
        self.paths.remove(path);
    }

    /// Remembers a root-relative local mutation for every awaiting value path
    /// it touches.
    pub(crate) fn record(&mut self, update: &BatchedUpdate) {
        for (path, log) in &mut self.paths {
            if path.is_wildcard() {
                continue;
            }
            let scoped = update.scoped(path);
            if !scoped.is_empty() {
                log.push(scoped);
            }
        }
    }

    /// Ends the wait for `path`, returning the root-relative writes to replay
    /// over its snapshot. `None` means the message is not a snapshot.
    pub(crate) fn settle(&mut self, path: &Path) -> Result<Option<Vec<BatchedUpdate>>, PathError> {
        let Some(log) = self.paths.remove(path) else {
            return Ok(None);
        };
        let replay = log
            .into_iter()
            .map(|scoped| scoped.rebase(path))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(replay))
    }
}

/// Shared between the client and its link.
pub(crate) type SharedAwaiting = Arc<Mutex<AwaitingSnapshots>>;

/// Turns ledger changes into subscribe and unsubscribe events.
///
/// Opening or restoring a path marks it as awaiting a snapshot, so the first
/// message for it replaces the cached sub-tree instead of merging into it.
/// Nothing is queued while offline; the ledger is restored on connect.
pub(crate) struct ClientLink {
    transport: Arc<dyn Transport>,
    outbox: Arc<EventOutbox>,
    awaiting: SharedAwaiting,
}

impl ClientLink {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        outbox: Arc<EventOutbox>,
        awaiting: SharedAwaiting,
    ) -> Self {
        Self {
            transport,
            outbox,
            awaiting,
        }
    }

    fn push(&self, message: ServerBound) {
        if !self.transport.is_connected() {
            return;
        }
        match message.to_event() {
            Ok(event) => self.outbox.push(event),
            Err(err) => warn!(%err, "failed to encode subscription event"),
        }
    }

    fn request(&self, path: &Path) {
        let message = if path.is_wildcard() {
            ServerBound::SubscribeKeys(path.anchor())
        } else {
            ServerBound::Subscribe(SubscribeRequest {
                path: path.clone(),
                once: false,
            })
        };
        // queued under the lock so recorded writes are exactly those sent
        // after this request
        let mut awaiting = self.awaiting.lock();
        awaiting.expect(path);
        self.push(message);
    }
}

impl WireLink for ClientLink {
    fn open(&self, path: &Path) {
        self.request(path);
    }

    fn close(&self, path: &Path) {
        self.awaiting.lock().cancel(path);
        self.push(ServerBound::Unsubscribe(path.clone()));
    }

    fn restore(&self, path: &Path) {
        self.request(path);
    }
}
