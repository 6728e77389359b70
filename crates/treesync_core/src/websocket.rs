//! WebSocket transport over `tokio-tungstenite`.

use crate::error::{TransportError, TransportResult};
use crate::transport::{EventReceiver, Transport, TransportEvent};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info};

/// A transport backed by one WebSocket connection.
///
/// Frames are sent as text messages by a writer task; a reader task turns
/// inbound text messages into [`TransportEvent::Frame`]s and reports
/// [`TransportEvent::Disconnected`] once the socket ends. Reconnecting means
/// creating a new transport.
pub struct WsTransport {
    outgoing: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
}

impl WsTransport {
    /// Dials `url` and starts the socket tasks.
    pub async fn connect(url: &str) -> TransportResult<(Arc<Self>, EventReceiver)> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;
        info!(url, "websocket connected");
        Ok(Self::spawn(stream))
    }

    /// Starts the socket tasks for an established stream.
    ///
    /// The returned receiver yields `Connected` first. Must be called from
    /// within a tokio runtime.
    pub fn spawn<S>(stream: WebSocketStream<S>) -> (Arc<Self>, EventReceiver)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let connected = Arc::new(AtomicBool::new(true));
        let (mut sink, mut source) = stream.split();
        let _ = events_tx.send(TransportEvent::Connected);

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    debug!(%err, "websocket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if events_tx.send(TransportEvent::Frame(text)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(%err, "websocket read failed");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            let _ = events_tx.send(TransportEvent::Disconnected);
        });

        (
            Arc::new(Self {
                outgoing,
                connected,
            }),
            events_rx,
        )
    }
}

impl Transport for WsTransport {
    fn send(&self, frame: String) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outgoing
            .send(Message::Text(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.outgoing.send(Message::Close(None));
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
