//! The client sync coordinator.

use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::keys::{KeyChange, KeyTracker, Notification};
use crate::link::{ClientLink, SharedAwaiting};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use treesync_core::{
    diff, send_envelope, Callback, Diagnostic, EventOutbox, EventReceiver, HookFailure, Hooks,
    NotifyOptions, SetRequest, SharedStore, Store, SubscriptionManager, Transport,
    TransportEvent, Unsubscribe,
};
use treesync_protocol::{
    BatchedUpdate, ClientBound, Envelope, KeyDelta, Node, Path, PathError, ServerBound,
};

/// Handle returned by [`SyncClient::on`] and [`SyncClient::each`].
pub type Subscription = Unsubscribe<Notification>;

/// Connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected {
        /// Whether a connection was ever established.
        ever_connected: bool,
    },
    /// Connected.
    Connected {
        /// Whether this connection follows an earlier one.
        reconnected: bool,
    },
}

impl ConnectionState {
    /// Returns true while connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// Outcome of a local write.
#[derive(Debug, Clone, PartialEq)]
pub enum SetOutcome {
    /// The cache changed, listeners were notified and the change was queued.
    Applied,
    /// The cache already held the value.
    Unchanged,
    /// The client is offline; the write was dropped.
    Offline,
    /// A `before-set` hook rejected the write.
    Rejected(HookFailure),
}

/// Client side of the sync protocol.
///
/// Writes are optimistic: they land in the local cache and reach local
/// listeners before the server sees them. Subscriptions consolidate into as
/// few wire subscriptions as possible and survive reconnects.
///
/// Drive the client by passing transport events to
/// [`handle_event`](Self::handle_event), or spawn [`run`](Self::run).
pub struct SyncClient {
    config: ClientConfig,
    store: SharedStore,
    transport: Arc<dyn Transport>,
    hooks: Arc<Hooks>,
    subscriptions: Arc<SubscriptionManager<Notification>>,
    outbox: Arc<EventOutbox>,
    awaiting: SharedAwaiting,
    state: Mutex<ConnectionState>,
}

impl SyncClient {
    /// Creates a client over an injected cache store.
    pub fn new(
        config: ClientConfig,
        store: SharedStore,
        transport: Arc<dyn Transport>,
        hooks: Hooks,
    ) -> Self {
        let hooks = Arc::new(hooks);

        let outbox = {
            let transport = Arc::clone(&transport);
            let hooks = Arc::clone(&hooks);
            Arc::new(EventOutbox::new(config.update_interval, move |envelope| {
                send_envelope(transport.as_ref(), &hooks, envelope)
            }))
        };

        let awaiting = SharedAwaiting::default();
        let link = ClientLink::new(
            Arc::clone(&transport),
            Arc::clone(&outbox),
            Arc::clone(&awaiting),
        );

        Self {
            config,
            store,
            transport,
            hooks,
            subscriptions: SubscriptionManager::new(Arc::new(link)),
            outbox,
            awaiting,
            state: Mutex::new(ConnectionState::Disconnected {
                ever_connected: false,
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the cache store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Returns the subscription manager.
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager<Notification>> {
        &self.subscriptions
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Returns true while connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Reads a cached value.
    pub fn get(&self, path: &str) -> ClientResult<Option<Node>> {
        let path = parse_literal(path)?;
        Ok(self.store.read().get(&path).cloned())
    }

    /// Reads a cached value as plain JSON.
    pub fn get_json(&self, path: &str) -> ClientResult<Option<Value>> {
        Ok(self.get(path)?.map(|node| node.to_json()))
    }

    /// Replaces the value at `path`. Keys the new value lacks are deleted.
    ///
    /// Writing `null` deletes the path.
    pub async fn set(&self, path: &str, value: Value) -> ClientResult<SetOutcome> {
        let path = parse_literal(path)?;
        if value.is_null() {
            return self.delete_path(path);
        }
        self.write(path, Node::from_json(value)?, true).await
    }

    /// Merges `value` into the value at `path`, keeping absent keys.
    pub async fn update(&self, path: &str, value: Value) -> ClientResult<SetOutcome> {
        let path = parse_literal(path)?;
        if value.is_null() {
            return self.delete_path(path);
        }
        self.write(path, Node::from_json(value)?, false).await
    }

    /// Deletes the value at `path`.
    pub fn delete(&self, path: &str) -> ClientResult<SetOutcome> {
        self.delete_path(parse_literal(path)?)
    }

    /// Listens for changes at `path`.
    ///
    /// Value paths receive [`Notification::Value`]; wildcard paths receive
    /// [`Notification::Keys`]. When a wire subscription already covers the
    /// path, cached data is delivered before this returns.
    pub fn on<F>(&self, path: &str, callback: F) -> ClientResult<Subscription>
    where
        F: Fn(&Path, &Notification) + Send + Sync + 'static,
    {
        let path = Path::parse(path)?;
        Ok(self.subscribe(path, Arc::new(callback)))
    }

    /// Like [`on`](Self::on), but removes itself after the first delivery.
    pub fn once<F>(&self, path: &str, callback: F) -> ClientResult<()>
    where
        F: Fn(&Path, &Notification) + Send + Sync + 'static,
    {
        let fired = Arc::new(AtomicBool::new(false));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::default();

        let handle = {
            let fired = Arc::clone(&fired);
            let slot = Arc::clone(&slot);
            self.on(path, move |path: &Path, notification: &Notification| {
                if fired.swap(true, Ordering::SeqCst) {
                    return;
                }
                let handle = slot.lock().take();
                if let Some(handle) = handle {
                    handle.unsubscribe();
                }
                callback(path, notification);
            })?
        };

        *slot.lock() = Some(handle);
        // delivery may have happened before the handle was stored
        if fired.load(Ordering::SeqCst) {
            let handle = slot.lock().take();
            if let Some(handle) = handle {
                handle.unsubscribe();
            }
        }
        Ok(())
    }

    /// Calls `on_key` once for every key that appears under `path`.
    ///
    /// A key that is deleted and later re-created is reported again.
    pub fn each<F>(&self, path: &str, on_key: F) -> ClientResult<Subscription>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let keys_path = parse_literal(path)?.wildcard()?;
        let tracker = Mutex::new(KeyTracker::new());
        let callback: Callback<Notification> =
            Arc::new(move |_: &Path, notification: &Notification| {
                let Notification::Keys(change) = notification else {
                    return;
                };
                let fresh = tracker.lock().apply(change);
                for key in fresh {
                    on_key(&key);
                }
            });
        Ok(self.subscribe(keys_path, callback))
    }

    /// Sends queued mutations and events now.
    pub fn flush(&self) {
        self.outbox.flush_now();
    }

    /// Flushes and closes the transport.
    pub fn close(&self) {
        self.flush();
        self.transport.close();
    }

    /// Processes transport events until the stream ends.
    pub async fn run(&self, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("transport event stream ended");
    }

    /// Processes one transport event.
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected().await,
            TransportEvent::Disconnected => self.on_disconnected(),
            TransportEvent::Frame(frame) => self.on_frame(&frame).await,
        }
    }

    async fn on_connected(&self) {
        let reconnected = {
            let mut state = self.state.lock();
            let ConnectionState::Disconnected { ever_connected } = *state else {
                return;
            };
            *state = ConnectionState::Connected {
                reconnected: ever_connected,
            };
            ever_connected
        };
        info!(reconnected, "connected");

        self.subscriptions.resubscribe();
        let chain = if reconnected {
            &self.hooks.reconnect
        } else {
            &self.hooks.first_connect
        };
        if let Err(failure) = chain.run(()).await {
            self.hooks.report(Diagnostic::HookFailed(failure));
        }
    }

    fn on_disconnected(&self) {
        let mut state = self.state.lock();
        if state.is_connected() {
            *state = ConnectionState::Disconnected {
                ever_connected: true,
            };
            info!("disconnected");
        }
    }

    async fn on_frame(&self, frame: &str) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.report_malformed(err);
                return;
            }
        };
        for event in envelope.events {
            match ClientBound::from_event(event) {
                Ok(message) => self.on_message(message).await,
                Err(err) => self.report_malformed(err),
            }
        }
    }

    async fn on_message(&self, message: ClientBound) {
        match message {
            ClientBound::Data { path, update } => self.apply_remote(path, update),
            ClientBound::Keys { path, delta } => self.apply_keys(path, delta),
            ClientBound::Ping(payload) => self.answer_ping(payload).await,
            ClientBound::Goodbye(reason) => info!(%reason, "server said goodbye"),
        }
    }

    fn apply_remote(&self, path: Path, update: BatchedUpdate) {
        let result = update.rebase(&path).and_then(|rooted| {
            let mut store = self.store.write();
            let replay = self.awaiting.lock().settle(&path)?;
            if replay.is_some() {
                store.del(&path)?;
            }
            store.apply(rooted)?;
            // local writes the snapshot predates
            for local in replay.into_iter().flatten() {
                store.apply(local)?;
            }
            Ok(self
                .subscriptions
                .collect(&path, NotifyOptions::both(), |listener| {
                    self.read(&store, listener)
                }))
        });
        match result {
            Ok(dispatch) => dispatch.deliver(),
            Err(err) => self.report_malformed(err),
        }
    }

    fn apply_keys(&self, path: Path, delta: KeyDelta) {
        let snapshot = matches!(self.awaiting.lock().settle(&path), Ok(Some(_)));
        let change = if snapshot {
            KeyChange::Snapshot(Some(delta.added))
        } else {
            KeyChange::Delta(delta)
        };
        let notification = Notification::Keys(change);
        self.subscriptions
            .notify(&path, NotifyOptions::exact(), |_| Some(notification.clone()));
    }

    async fn answer_ping(&self, payload: Value) {
        match self.hooks.keep_alive_pong.run(payload).await {
            Ok(pong) => match ServerBound::Pong(pong).to_event() {
                Ok(event) => self.outbox.push(event),
                Err(err) => self.hooks.report(Diagnostic::SendFailed {
                    message: err.to_string(),
                }),
            },
            Err(failure) => self.hooks.report(Diagnostic::HookFailed(failure)),
        }
    }

    async fn write(&self, path: Path, node: Node, replace: bool) -> ClientResult<SetOutcome> {
        if !self.is_connected() {
            debug!(%path, "dropping write while offline");
            return Ok(SetOutcome::Offline);
        }
        if !self.would_change(&path, &node, replace) {
            return Ok(SetOutcome::Unchanged);
        }

        let request = SetRequest { path, node };
        let SetRequest { path, node } = match self.hooks.before_set.run(request).await {
            Ok(request) => request,
            Err(failure) => {
                self.hooks.report(Diagnostic::HookFailed(failure.clone()));
                return Ok(SetOutcome::Rejected(failure));
            }
        };
        path.literal()?;

        let dispatch = {
            let mut store = self.store.write();
            let mut removed = Vec::new();
            if replace {
                if let Some(old) = store.root().get(&path) {
                    Node::removed_paths(old, &node, &path, &mut removed);
                }
            }
            for stale in &removed {
                store.del(stale)?;
            }
            let changed = store.put(Node::wrap(&path, node));
            if removed.is_empty() && changed.is_none() {
                return Ok(SetOutcome::Unchanged);
            }
            let dispatch = self
                .subscriptions
                .collect(&path, NotifyOptions::both(), |listener| {
                    self.read(&store, listener)
                });
            self.send_local(BatchedUpdate {
                change: changed,
                delete: removed,
            });
            dispatch
        };

        dispatch.deliver();
        Ok(SetOutcome::Applied)
    }

    fn delete_path(&self, path: Path) -> ClientResult<SetOutcome> {
        if !self.is_connected() {
            debug!(%path, "dropping delete while offline");
            return Ok(SetOutcome::Offline);
        }

        let dispatch = {
            let mut store = self.store.write();
            let absent = if path.is_root() {
                store.is_empty()
            } else {
                store.root().get(&path).is_none()
            };
            if absent {
                return Ok(SetOutcome::Unchanged);
            }
            store.del(&path)?;
            let dispatch = self
                .subscriptions
                .collect(&path, NotifyOptions::both(), |listener| {
                    self.read(&store, listener)
                });
            self.send_local(BatchedUpdate::delete(vec![path]));
            dispatch
        };

        dispatch.deliver();
        Ok(SetOutcome::Applied)
    }

    /// Queues a local mutation and records it for paths awaiting a snapshot.
    ///
    /// Runs with the store locked, so an inbound snapshot lands entirely
    /// before or entirely after the write.
    fn send_local(&self, update: BatchedUpdate) {
        let mut awaiting = self.awaiting.lock();
        awaiting.record(&update);
        for stale in update.delete {
            self.outbox.delete(stale);
        }
        if let Some(change) = update.change {
            self.outbox.change(change);
        }
    }

    fn would_change(&self, path: &Path, node: &Node, replace: bool) -> bool {
        let store = self.store.read();
        let current = store.root().get(path);
        if diff(current, node).is_some() {
            return true;
        }
        replace
            && current.is_some_and(|old| {
                let mut removed = Vec::new();
                Node::removed_paths(old, node, path, &mut removed);
                !removed.is_empty()
            })
    }

    fn subscribe(&self, path: Path, callback: Callback<Notification>) -> Subscription {
        let cached = path.clone();
        self.subscriptions.subscribe_cached(path, callback, || {
            let store = self.store.read();
            match self.read(&store, &cached)? {
                Notification::Value(None) | Notification::Keys(KeyChange::Snapshot(None)) => None,
                notification => Some(notification),
            }
        })
    }

    /// Builds the notification for one listener path from the cache.
    fn read(&self, store: &Store, listener: &Path) -> Option<Notification> {
        if !listener.is_wildcard() {
            return Some(Notification::Value(store.get(listener).cloned()));
        }
        let anchor = listener.anchor();
        let keys = store.keys(&anchor);
        let change = if self.cache_holds(&anchor) {
            KeyChange::Snapshot(keys)
        } else {
            KeyChange::Observed(keys.unwrap_or_default())
        };
        Some(Notification::Keys(change))
    }

    /// Returns true if a settled value subscription covers `path`, so the
    /// cache holds every key under it.
    fn cache_holds(&self, path: &Path) -> bool {
        let wire = self.subscriptions.wire_paths();
        let awaiting = self.awaiting.lock();
        wire.iter()
            .any(|w| !w.is_wildcard() && w.covers(path) && !awaiting.contains(w))
    }

    fn report_malformed(&self, err: impl ToString) {
        self.hooks.report(Diagnostic::MalformedInbound {
            message: err.to_string(),
        });
    }
}

fn parse_literal(path: &str) -> Result<Path, PathError> {
    let path = Path::parse(path)?;
    path.literal()?;
    Ok(path)
}
