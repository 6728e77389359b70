//! Transport abstraction and an in-memory implementation.

use crate::error::{TransportError, TransportResult};
use crate::hooks::{Diagnostic, Hooks};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use treesync_protocol::Envelope;

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link came up.
    Connected,
    /// The link went down.
    Disconnected,
    /// A text frame arrived.
    Frame(String),
}

/// Receiving half of a transport's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Sending half of a transport's event stream.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// An ordered, reliable, bidirectional text channel.
///
/// Inbound traffic is not pulled through this trait; each adapter pushes
/// [`TransportEvent`]s to an [`EventReceiver`] handed out at construction.
pub trait Transport: Send + Sync {
    /// Sends one frame.
    fn send(&self, frame: String) -> TransportResult<()>;

    /// Closes the link.
    fn close(&self);

    /// Returns true while frames can be sent.
    fn is_connected(&self) -> bool;
}

/// Encodes and sends one envelope.
///
/// Envelopes are dropped while the transport is down; the subscription
/// ledger is restored on reconnect instead. Encode and send failures go to
/// the diagnostics sink.
pub fn send_envelope(transport: &dyn Transport, hooks: &Hooks, envelope: Envelope) {
    if !transport.is_connected() {
        debug!(events = envelope.events.len(), "dropping envelope while disconnected");
        return;
    }
    let result = envelope
        .encode()
        .map_err(|err| err.to_string())
        .and_then(|frame| transport.send(frame).map_err(|err| err.to_string()));
    if let Err(message) = result {
        hooks.report(Diagnostic::SendFailed { message });
    }
}

/// One end of an in-memory transport pair.
///
/// Both ends share a link state. [`MemoryTransport::connect`] and
/// [`MemoryTransport::drop_link`] toggle it and notify both sides, which lets
/// tests script disconnects and reconnects deterministically.
pub struct MemoryTransport {
    link: Arc<AtomicBool>,
    local: EventSender,
    peer: EventSender,
    sent: Mutex<Vec<String>>,
}

impl MemoryTransport {
    /// Creates two linked ends, initially disconnected.
    pub fn pair() -> ((Arc<Self>, EventReceiver), (Arc<Self>, EventReceiver)) {
        let link = Arc::new(AtomicBool::new(false));
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a = Arc::new(Self {
            link: Arc::clone(&link),
            local: a_tx.clone(),
            peer: b_tx.clone(),
            sent: Mutex::new(Vec::new()),
        });
        let b = Arc::new(Self {
            link,
            local: b_tx,
            peer: a_tx,
            sent: Mutex::new(Vec::new()),
        });
        ((a, a_rx), (b, b_rx))
    }

    /// Brings the link up and emits `Connected` on both ends.
    pub fn connect(&self) {
        if !self.link.swap(true, Ordering::SeqCst) {
            self.notify_both(TransportEvent::Connected);
        }
    }

    /// Takes the link down and emits `Disconnected` on both ends.
    pub fn drop_link(&self) {
        if self.link.swap(false, Ordering::SeqCst) {
            self.notify_both(TransportEvent::Disconnected);
        }
    }

    /// Returns every frame this end has sent.
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Forgets the recorded frames.
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    fn notify_both(&self, event: TransportEvent) {
        // a side that stopped listening has nothing left to notify
        let _ = self.local.send(event.clone());
        let _ = self.peer.send(event);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, frame: String) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().push(frame.clone());
        self.peer
            .send(TransportEvent::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        debug!("closing memory transport");
        self.drop_link();
    }

    fn is_connected(&self) -> bool {
        self.link.load(Ordering::SeqCst)
    }
}
