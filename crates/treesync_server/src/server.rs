//! The server sync coordinator.

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::{ServerError, ServerResult};
use crate::fanout::{current_keys, touched_paths, Fanout, KeyLedger};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use treesync_core::{
    Callback, Diagnostic, EventReceiver, HookFailure, Hooks, SharedStore, SubscriptionManager,
    Transport, TransportEvent,
};
use treesync_protocol::{
    BatchedUpdate, ClientBound, Envelope, KeyDelta, Node, Path, PathError, ServerBound,
    SubscribeRequest, KEEP_ALIVE_FAILED,
};

/// Result of a mutation applied by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The store changed and subscribers were notified.
    Applied,
    /// The update matched the store; nothing was sent.
    Unchanged,
    /// The `BeforeUpdate` hook chain rejected the update.
    Rejected(HookFailure),
}

/// Accepts connections, answers subscriptions and fans out updates.
///
/// One store and one subscription ledger are shared by every connection.
/// Each connection registers listeners for the paths it subscribed to; an
/// applied update is scoped to every affected listener path and queued on
/// that connection's outbox. The connection that sent an update does not
/// get its own value update back, but does get key deltas.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use treesync_core::{Hooks, Store};
/// use treesync_server::{serve, ServerConfig, SyncServer};
///
/// let server = Arc::new(SyncServer::new(ServerConfig::default(), Store::shared(), Hooks::new()));
/// let _keep_alive = server.spawn_keep_alive();
/// serve(server).await?;
/// ```
pub struct SyncServer {
    config: ServerConfig,
    store: SharedStore,
    hooks: Arc<Hooks>,
    subscriptions: Arc<SubscriptionManager<Fanout>>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl SyncServer {
    /// Creates a server over `store`.
    pub fn new(config: ServerConfig, store: SharedStore, hooks: Hooks) -> Self {
        Self {
            config,
            store,
            hooks: Arc::new(hooks),
            subscriptions: SubscriptionManager::detached(),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the shared store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Returns the subscription ledger shared by all connections.
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager<Fanout>> {
        &self.subscriptions
    }

    /// Returns the number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns the ids of all open connections.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().copied().collect()
    }

    /// Registers a connection over `transport`.
    pub fn accept(&self, transport: Arc<dyn Transport>) -> ServerResult<ConnectionId> {
        let mut connections = self.connections.write();
        if connections.len() >= self.config.max_connections {
            return Err(ServerError::ConnectionLimit {
                max: self.config.max_connections,
            });
        }
        let id = ConnectionId::new();
        let connection = Connection::new(
            id,
            transport,
            self.config.update_interval,
            Arc::clone(&self.hooks),
        );
        connections.insert(id, connection);
        info!(connection = %id, open = connections.len(), "connection accepted");
        Ok(id)
    }

    /// Forgets a connection whose transport went away.
    ///
    /// Returns false if the connection was already gone.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = self.connections.write().remove(&id);
        match removed {
            Some(connection) => {
                connection.clear_subscriptions();
                info!(connection = %id, "connection dropped");
                true
            }
            None => false,
        }
    }

    /// Flushes pending events, sends a goodbye with `reason` and closes.
    pub fn close_connection(&self, id: ConnectionId, reason: &str) -> ServerResult<()> {
        let connection = self
            .connections
            .write()
            .remove(&id)
            .ok_or(ServerError::UnknownConnection(id))?;
        connection.push(ClientBound::Goodbye(reason.to_string()));
        connection.flush();
        connection.transport().close();
        connection.clear_subscriptions();
        info!(connection = %id, reason, "connection closed");
        Ok(())
    }

    /// Drives one transport until its event stream ends.
    ///
    /// Every `Connected` event registers a fresh connection, so a transport
    /// that reconnects starts over with no subscriptions.
    pub async fn serve_connection(&self, transport: Arc<dyn Transport>, mut events: EventReceiver) {
        let mut current = None;
        while let Some(event) = events.recv().await {
            current = self.handle_transport_event(current, &transport, event).await;
        }
        if let Some(id) = current {
            self.disconnect(id);
        }
    }

    /// Handles one event of a transport whose connection is `current`, and
    /// returns the connection that is current afterwards.
    pub async fn handle_transport_event(
        &self,
        current: Option<ConnectionId>,
        transport: &Arc<dyn Transport>,
        event: TransportEvent,
    ) -> Option<ConnectionId> {
        match event {
            TransportEvent::Connected => {
                if let Some(id) = current {
                    self.disconnect(id);
                }
                match self.accept(Arc::clone(transport)) {
                    Ok(id) => Some(id),
                    Err(err) => {
                        warn!(%err, "rejecting connection");
                        transport.close();
                        None
                    }
                }
            }
            TransportEvent::Disconnected => {
                if let Some(id) = current {
                    self.disconnect(id);
                }
                None
            }
            TransportEvent::Frame(frame) => {
                if let Some(id) = current {
                    self.handle_frame(id, &frame).await;
                }
                current
            }
        }
    }

    /// Decodes and handles one inbound frame of connection `id`.
    pub async fn handle_frame(&self, id: ConnectionId, frame: &str) {
        let Some(connection) = self.connection(id) else {
            debug!(connection = %id, "frame for unknown connection");
            return;
        };
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.report_malformed(err);
                return;
            }
        };
        for event in envelope.events {
            match ServerBound::from_event(event) {
                Ok(message) => self.on_message(&connection, message).await,
                Err(err) => self.report_malformed(err),
            }
        }
    }

    /// Returns the value at `path`.
    pub fn get(&self, path: &str) -> ServerResult<Option<Node>> {
        let path = parse_literal(path)?;
        Ok(self.store.read().get(&path).cloned())
    }

    /// Replaces the value at `path` and notifies every subscriber.
    ///
    /// Setting `null` deletes. Server-side writes skip the `BeforeUpdate`
    /// hook chain.
    pub async fn set(&self, path: &str, value: Value) -> ServerResult<UpdateOutcome> {
        let path = parse_literal(path)?;
        if value.is_null() {
            return self.remove(path).await;
        }
        let node = Node::from_json(value)?;
        let mut delete = Vec::new();
        if let Some(old) = self.store.read().root().get(&path) {
            Node::removed_paths(old, &node, &path, &mut delete);
        }
        let update = BatchedUpdate {
            change: Some(Node::wrap(&path, node)),
            delete,
        };
        self.apply_update(None, update).await
    }

    /// Merges `value` into the value at `path` and notifies every subscriber.
    pub async fn update(&self, path: &str, value: Value) -> ServerResult<UpdateOutcome> {
        let path = parse_literal(path)?;
        if value.is_null() {
            return self.remove(path).await;
        }
        let node = Node::from_json(value)?;
        self.apply_update(None, BatchedUpdate::change(Node::wrap(&path, node)))
            .await
    }

    /// Deletes the value at `path` and notifies every subscriber.
    pub async fn delete(&self, path: &str) -> ServerResult<UpdateOutcome> {
        let path = parse_literal(path)?;
        self.remove(path).await
    }

    /// Applies a root-relative update and fans it out.
    ///
    /// Updates from a connection run through the `BeforeUpdate` hook chain
    /// first and are not echoed back to it. Deletes are applied before the
    /// change, under one store write lock.
    pub async fn apply_update(
        &self,
        origin: Option<ConnectionId>,
        update: BatchedUpdate,
    ) -> ServerResult<UpdateOutcome> {
        let update = match origin {
            Some(_) => match self.hooks.before_update.run(update).await {
                Ok(update) => update,
                Err(failure) => {
                    self.hooks.report(Diagnostic::HookFailed(failure.clone()));
                    return Ok(UpdateOutcome::Rejected(failure));
                }
            },
            None => update,
        };
        let BatchedUpdate { change, delete } = update;
        for path in &delete {
            path.literal()?;
        }

        let dispatch = {
            let mut store = self.store.write();
            for path in &delete {
                store.del(path)?;
            }
            let changed = change.and_then(|change| store.put(change));
            if delete.is_empty() && changed.is_none() {
                return Ok(UpdateOutcome::Unchanged);
            }
            let applied = BatchedUpdate {
                change: changed,
                delete,
            };
            self.subscriptions
                .collect_many(&touched_paths(&applied), |listener| {
                    Fanout::for_listener(&store, listener, origin, &applied)
                })
        };

        debug!(listeners = dispatch.len(), "fanning out update");
        dispatch.deliver();
        Ok(UpdateOutcome::Applied)
    }

    /// Pings every live connection and closes those that missed the last
    /// ping.
    pub async fn keep_alive_tick(&self) {
        let payload = match self.hooks.keep_alive_ping.run(json!({})).await {
            Ok(payload) => payload,
            Err(failure) => {
                self.hooks.report(Diagnostic::HookFailed(failure));
                json!({})
            }
        };
        let connections: Vec<Arc<Connection>> =
            self.connections.read().values().cloned().collect();
        for connection in connections {
            if connection.take_alive() {
                connection.push(ClientBound::Ping(payload.clone()));
                continue;
            }
            info!(connection = %connection.id(), "keep-alive check failed");
            if let Err(err) = self.close_connection(connection.id(), KEEP_ALIVE_FAILED) {
                debug!(%err, "connection already gone");
            }
        }
    }

    /// Starts a task that runs [`keep_alive_tick`](Self::keep_alive_tick)
    /// every `keep_alive_interval`.
    ///
    /// Returns `None` when the interval is zero. The task stops once the
    /// server is dropped.
    pub fn spawn_keep_alive(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.keep_alive_interval;
        if period.is_zero() {
            return None;
        }
        let server = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(server) = server.upgrade() else {
                    break;
                };
                server.keep_alive_tick().await;
            }
        }))
    }

    fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    async fn on_message(&self, connection: &Arc<Connection>, message: ServerBound) {
        match message {
            ServerBound::Update(update) => self.apply_inbound(connection, update).await,
            ServerBound::Data { path, update } => match update.rebase(&path) {
                Ok(update) => self.apply_inbound(connection, update).await,
                Err(err) => self.report_malformed(err),
            },
            ServerBound::Subscribe(request) => self.subscribe_values(connection, request),
            ServerBound::SubscribeKeys(anchor) => self.subscribe_keys(connection, anchor),
            ServerBound::Unsubscribe(path) => {
                if !connection.remove_subscription(&path) {
                    debug!(connection = %connection.id(), %path, "unsubscribe without subscription");
                }
            }
            ServerBound::Pong(_) => connection.mark_alive(),
        }
    }

    async fn apply_inbound(&self, connection: &Arc<Connection>, update: BatchedUpdate) {
        if let Err(err) = self.apply_update(Some(connection.id()), update).await {
            self.report_malformed(err);
        }
    }

    /// Sends a snapshot of `path` and, unless `once`, keeps `connection`
    /// subscribed to it.
    ///
    /// The snapshot is queued under the store lock, so no update to `path`
    /// can reach the connection ahead of it.
    fn subscribe_values(&self, connection: &Arc<Connection>, request: SubscribeRequest) {
        let SubscribeRequest { path, once } = request;
        if let Err(err) = path.literal() {
            self.report_malformed(err);
            return;
        }

        let store = self.store.read();
        let snapshot = match store.get(&path) {
            Some(node) => BatchedUpdate::change(node.clone()),
            None => BatchedUpdate::delete(vec![Path::root()]),
        };
        if !once && !connection.has_value_subscription(&path) {
            let handle = self
                .subscriptions
                .subscribe(path.clone(), value_listener(connection));
            connection.add_value_subscription(handle);
        }
        connection.push(ClientBound::Data {
            path,
            update: snapshot,
        });
    }

    /// Sends the current keys under `anchor` and subscribes `connection` to
    /// later key deltas.
    fn subscribe_keys(&self, connection: &Arc<Connection>, anchor: Path) {
        let path = match anchor.wildcard() {
            Ok(path) => path,
            Err(err) => {
                self.report_malformed(err);
                return;
            }
        };

        let store = self.store.read();
        let keys = current_keys(&store, &anchor);
        let listener = key_listener(connection, KeyLedger::new(keys.clone()));
        connection.add_key_subscription(self.subscriptions.subscribe(path.clone(), listener));
        connection.push(ClientBound::Keys {
            path,
            delta: KeyDelta {
                added: keys.into_iter().collect(),
                deleted: Vec::new(),
            },
        });
    }

    async fn remove(&self, path: Path) -> ServerResult<UpdateOutcome> {
        let absent = {
            let store = self.store.read();
            if path.is_root() {
                store.is_empty()
            } else {
                store.root().get(&path).is_none()
            }
        };
        if absent {
            return Ok(UpdateOutcome::Unchanged);
        }
        self.apply_update(None, BatchedUpdate::delete(vec![path]))
            .await
    }

    fn report_malformed(&self, err: impl ToString) {
        self.hooks.report(Diagnostic::MalformedInbound {
            message: err.to_string(),
        });
    }
}

/// Queues scoped value updates for `connection`, skipping its own.
fn value_listener(connection: &Arc<Connection>) -> Callback<Fanout> {
    let weak = Arc::downgrade(connection);
    Arc::new(move |path: &Path, fanout: &Fanout| {
        let (Some(connection), Fanout::Update { origin, update }) = (weak.upgrade(), fanout) else {
            return;
        };
        if *origin == Some(connection.id()) {
            return;
        }
        connection.push(ClientBound::Data {
            path: path.clone(),
            update: update.clone(),
        });
    })
}

/// Queues key deltas for `connection`.
fn key_listener(connection: &Arc<Connection>, ledger: KeyLedger) -> Callback<Fanout> {
    let weak = Arc::downgrade(connection);
    Arc::new(move |path: &Path, fanout: &Fanout| {
        let (Some(connection), Fanout::Keys(keys)) = (weak.upgrade(), fanout) else {
            return;
        };
        let delta = ledger.advance(keys);
        if !delta.is_empty() {
            connection.push(ClientBound::Keys {
                path: path.clone(),
                delta,
            });
        }
    })
}

fn parse_literal(path: &str) -> Result<Path, PathError> {
    let path = Path::parse(path)?;
    path.literal()?;
    Ok(path)
}
