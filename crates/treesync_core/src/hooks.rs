//! Typed hook chains and the diagnostics sink.
//!
//! Each extension point has a fixed payload type. Handlers run in
//! registration order; each receives the previous handler's output, and the
//! first failure aborts the chain. A failed chain aborts only the operation
//! that ran it: the failure goes to the diagnostics sink and is never
//! returned to the caller of `set` or `update`.

use futures_util::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use treesync_protocol::{BatchedUpdate, Node, Path};

/// The extension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookName {
    /// Client, before a local write is applied.
    BeforeSet,
    /// Server, before a client update is applied.
    BeforeUpdate,
    /// Client, on the first successful connect.
    FirstConnect,
    /// Client, on every connect after a disconnect.
    Reconnect,
    /// Server, builds the keep-alive ping payload.
    KeepAlivePing,
    /// Client, builds the keep-alive pong payload.
    KeepAlivePong,
}

impl HookName {
    /// Returns the hook's name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::BeforeSet => "before-set",
            HookName::BeforeUpdate => "before-update",
            HookName::FirstConnect => "first-connect",
            HookName::Reconnect => "reconnect",
            HookName::KeepAlivePing => "keep-alive-ping",
            HookName::KeepAlivePong => "keep-alive-pong",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a hook handler to reject an operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    /// Creates a rejection with a reason.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the rejection reason.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A hook rejection together with the chain that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("hook {hook} failed: {source}")]
pub struct HookFailure {
    /// The chain that failed.
    pub hook: HookName,
    /// The handler's error.
    #[source]
    pub source: HookError,
}

/// Payload of the [`HookName::BeforeSet`] chain.
#[derive(Debug, Clone, PartialEq)]
pub struct SetRequest {
    /// The written path.
    pub path: Path,
    /// The node about to be merged at `path`. Handlers may attach metadata.
    pub node: Node,
}

/// A boxed handler future.
pub type HookFuture<P> = BoxFuture<'static, Result<P, HookError>>;

type Handler<P> = Arc<dyn Fn(P) -> HookFuture<P> + Send + Sync>;

/// An ordered list of handlers for one extension point.
pub struct HookChain<P> {
    name: HookName,
    handlers: Vec<Handler<P>>,
}

impl<P: Send + 'static> HookChain<P> {
    fn new(name: HookName) -> Self {
        Self {
            name,
            handlers: Vec::new(),
        }
    }

    /// Returns the extension point this chain serves.
    pub fn name(&self) -> HookName {
        self.name
    }

    /// Appends an async handler.
    pub fn register<F, Fut>(&mut self, handler: F)
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<P, HookError>> + Send + 'static,
    {
        self.handlers
            .push(Arc::new(move |payload| Box::pin(handler(payload))));
    }

    /// Appends a synchronous handler.
    pub fn register_sync<F>(&mut self, handler: F)
    where
        F: Fn(P) -> Result<P, HookError> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(move |payload| {
            let handler = Arc::clone(&handler);
            async move { handler(payload) }
        });
    }

    /// Returns the number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Folds `payload` through every handler in order.
    pub fn run(&self, payload: P) -> BoxFuture<'static, Result<P, HookFailure>> {
        let handlers = self.handlers.clone();
        let hook = self.name;
        Box::pin(async move {
            let mut payload = payload;
            for handler in handlers {
                payload = handler(payload)
                    .await
                    .map_err(|source| HookFailure { hook, source })?;
            }
            Ok(payload)
        })
    }
}

/// Something worth reporting that is not returned to any caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// A hook chain rejected an operation.
    HookFailed(HookFailure),
    /// An inbound frame or event could not be decoded and was dropped.
    MalformedInbound {
        /// Decode error.
        message: String,
    },
    /// An outbound frame could not be delivered.
    SendFailed {
        /// Transport error.
        message: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::HookFailed(failure) => write!(f, "{failure}"),
            Diagnostic::MalformedInbound { message } => write!(f, "dropped inbound: {message}"),
            Diagnostic::SendFailed { message } => write!(f, "send failed: {message}"),
        }
    }
}

type DiagnosticSink = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

/// Hook chains for every extension point plus the diagnostics sink.
///
/// Configure before handing the registry to a coordinator; coordinators
/// hold it immutably.
pub struct Hooks {
    /// See [`HookName::BeforeSet`].
    pub before_set: HookChain<SetRequest>,
    /// See [`HookName::BeforeUpdate`].
    pub before_update: HookChain<BatchedUpdate>,
    /// See [`HookName::FirstConnect`].
    pub first_connect: HookChain<()>,
    /// See [`HookName::Reconnect`].
    pub reconnect: HookChain<()>,
    /// See [`HookName::KeepAlivePing`].
    pub keep_alive_ping: HookChain<Value>,
    /// See [`HookName::KeepAlivePong`].
    pub keep_alive_pong: HookChain<Value>,
    diagnostics: Vec<DiagnosticSink>,
}

impl Hooks {
    /// Creates a registry with empty chains.
    pub fn new() -> Self {
        Self {
            before_set: HookChain::new(HookName::BeforeSet),
            before_update: HookChain::new(HookName::BeforeUpdate),
            first_connect: HookChain::new(HookName::FirstConnect),
            reconnect: HookChain::new(HookName::Reconnect),
            keep_alive_ping: HookChain::new(HookName::KeepAlivePing),
            keep_alive_pong: HookChain::new(HookName::KeepAlivePong),
            diagnostics: Vec::new(),
        }
    }

    /// Adds a diagnostics callback.
    pub fn on_diagnostic(&mut self, sink: impl Fn(&Diagnostic) + Send + Sync + 'static) {
        self.diagnostics.push(Arc::new(sink));
    }

    /// Logs a diagnostic and hands it to every callback.
    pub fn report(&self, diagnostic: Diagnostic) {
        warn!(%diagnostic, "sync diagnostic");
        for sink in &self.diagnostics {
            sink(&diagnostic);
        }
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new()
    }
}
