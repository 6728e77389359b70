//! WebSocket listener.

use crate::error::ServerResult;
use crate::server::SyncServer;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use treesync_core::WsTransport;

/// Binds `bind_addr` from the server's configuration and serves WebSocket
/// clients until the listener fails.
pub async fn serve(server: Arc<SyncServer>) -> ServerResult<()> {
    let listener = TcpListener::bind(server.config().bind_addr).await?;
    serve_listener(server, listener).await
}

/// Serves WebSocket clients accepted on an already bound listener.
///
/// Each accepted socket gets its own task, which performs the handshake and
/// then drives the connection with [`SyncServer::serve_connection`].
pub async fn serve_listener(server: Arc<SyncServer>, listener: TcpListener) -> ServerResult<()> {
    info!(addr = %listener.local_addr()?, "listening for websocket clients");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "tcp connection");
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(socket) => {
                    let (transport, events) = WsTransport::spawn(socket);
                    server.serve_connection(transport, events).await;
                    debug!(%peer, "websocket finished");
                }
                Err(err) => warn!(%peer, %err, "websocket handshake failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use serde_json::json;
    use std::time::Duration;
    use treesync_core::{Hooks, Store, Transport, TransportEvent};
    use treesync_protocol::{ClientBound, Envelope, Node, Path, ServerBound, SubscribeRequest};

    #[tokio::test]
    async fn websocket_client_gets_a_snapshot() {
        let store = Store::shared();
        store
            .write()
            .put_at(
                &Path::parse("greeting").unwrap(),
                Node::from_json(json!("hello")).unwrap(),
            )
            .unwrap();
        let config = ServerConfig::default().with_update_interval(Duration::ZERO);
        let server = Arc::new(SyncServer::new(config, store, Hooks::new()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_listener(Arc::clone(&server), listener));

        let (client, mut events) = WsTransport::connect(&format!("ws://{addr}"))
            .await
            .unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        let subscribe = ServerBound::Subscribe(SubscribeRequest {
            path: Path::parse("greeting").unwrap(),
            once: true,
        });
        let frame = Envelope::new(vec![subscribe.to_event().unwrap()])
            .encode()
            .unwrap();
        client.send(frame).unwrap();

        let Some(TransportEvent::Frame(reply)) = events.recv().await else {
            panic!("expected a frame");
        };
        let event = Envelope::decode(&reply).unwrap().events.remove(0);
        match ClientBound::from_event(event).unwrap() {
            ClientBound::Data { path, update } => {
                assert_eq!(path.to_string(), "greeting");
                assert_eq!(update.change.unwrap().to_json(), json!("hello"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        client.close();
        assert!(!client.is_connected());
    }
}
