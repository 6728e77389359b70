//! Protocol messages and the batching envelope.
//!
//! Every physical frame is an [`Envelope`]: `{"events": [{"event", "data"}, …]}`.
//! Event names are decoded per direction, so a user path that happens to be
//! called `update` is never mistaken for the `data:update` command.

use crate::error::{ProtocolError, ProtocolResult};
use crate::path::Path;
use crate::update::{BatchedUpdate, KeyDelta};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names.
pub mod event {
    /// Client mutation.
    pub const UPDATE: &str = "data:update";
    /// Request value updates for a path.
    pub const SUBSCRIBE: &str = "data:subscribe";
    /// Stop updates for a path.
    pub const UNSUBSCRIBE: &str = "data:unsubscribe";
    /// Request child-key events for a path.
    pub const SUBSCRIBE_KEYS: &str = "data:subscribeKeys";
    /// Prefix of per-path value and key events.
    pub const DATA_PREFIX: &str = "data:";
    /// Liveness check.
    pub const PING: &str = "keep-alive:ping";
    /// Liveness response.
    pub const PONG: &str = "keep-alive:pong";
    /// Sent right before a server-initiated close.
    pub const GOODBYE: &str = "connection:goodbye";
}

/// Goodbye reason used when a connection misses a keep-alive round.
pub const KEEP_ALIVE_FAILED: &str = "keep-alive-check-failed";

/// One logical event inside an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

impl WireEvent {
    fn new<T: Serialize>(event: impl Into<String>, data: &T) -> ProtocolResult<Self> {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_value(data)?,
        })
    }

    fn payload<T: DeserializeOwned>(self) -> ProtocolResult<T> {
        let event = self.event;
        serde_json::from_value(self.data).map_err(|source| ProtocolError::Payload { event, source })
    }
}

/// The physical frame: all events of one batching window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Events in send order.
    pub events: Vec<WireEvent>,
}

impl Envelope {
    /// Creates an envelope from events.
    pub fn new(events: Vec<WireEvent>) -> Self {
        Self { events }
    }

    /// Encodes to a JSON text frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a JSON text frame.
    pub fn decode(frame: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// Payload of `data:subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Subscribed path.
    pub path: Path,
    /// Deliver the current value once without registering.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub once: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PathRequest {
    path: Path,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Goodbye {
    reason: String,
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerBound {
    /// Root-relative mutation.
    Update(BatchedUpdate),
    /// Value subscription.
    Subscribe(SubscribeRequest),
    /// Drop a value or key subscription.
    Unsubscribe(Path),
    /// Key-membership subscription for the children of a path.
    SubscribeKeys(Path),
    /// Mutation relative to a path.
    ///
    /// A path whose event name would read as a command, such as `update`,
    /// is sent as the equivalent root-relative [`ServerBound::Update`].
    Data {
        /// Base path.
        path: Path,
        /// Update relative to `path`.
        update: BatchedUpdate,
    },
    /// Keep-alive response.
    Pong(Value),
}

impl ServerBound {
    /// Encodes into a wire event.
    pub fn to_event(&self) -> ProtocolResult<WireEvent> {
        match self {
            ServerBound::Update(update) => WireEvent::new(event::UPDATE, update),
            ServerBound::Subscribe(request) => WireEvent::new(event::SUBSCRIBE, request),
            ServerBound::Unsubscribe(path) => WireEvent::new(
                event::UNSUBSCRIBE,
                &PathRequest { path: path.clone() },
            ),
            ServerBound::SubscribeKeys(path) => WireEvent::new(
                event::SUBSCRIBE_KEYS,
                &PathRequest { path: path.clone() },
            ),
            ServerBound::Data { path, update } if is_command_path(path) => {
                let rooted = update.clone().rebase(path)?;
                WireEvent::new(event::UPDATE, &rooted)
            }
            ServerBound::Data { path, update } => {
                WireEvent::new(format!("{}{}", event::DATA_PREFIX, path), update)
            }
            ServerBound::Pong(payload) => WireEvent::new(event::PONG, payload),
        }
    }

    /// Decodes a wire event received by the server.
    pub fn from_event(wire: WireEvent) -> ProtocolResult<Self> {
        match wire.event.as_str() {
            event::UPDATE => Ok(ServerBound::Update(wire.payload()?)),
            event::SUBSCRIBE => Ok(ServerBound::Subscribe(wire.payload()?)),
            event::UNSUBSCRIBE => {
                let request: PathRequest = wire.payload()?;
                Ok(ServerBound::Unsubscribe(request.path))
            }
            event::SUBSCRIBE_KEYS => {
                let request: PathRequest = wire.payload()?;
                Ok(ServerBound::SubscribeKeys(request.path))
            }
            event::PONG => Ok(ServerBound::Pong(wire.data)),
            name => match name.strip_prefix(event::DATA_PREFIX) {
                Some(raw) => {
                    let path = Path::parse(raw)?;
                    if path.is_wildcard() {
                        return Err(ProtocolError::UnknownEvent(wire.event));
                    }
                    Ok(ServerBound::Data {
                        path,
                        update: wire.payload()?,
                    })
                }
                None => Err(ProtocolError::UnknownEvent(wire.event)),
            },
        }
    }
}

/// Returns true if `data:<path>` is one of the server-bound commands.
fn is_command_path(path: &Path) -> bool {
    let name = format!("{}{}", event::DATA_PREFIX, path);
    [
        event::UPDATE,
        event::SUBSCRIBE,
        event::UNSUBSCRIBE,
        event::SUBSCRIBE_KEYS,
    ]
    .contains(&name.as_str())
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientBound {
    /// Value update relative to `path`.
    Data {
        /// Subscribed path.
        path: Path,
        /// Update relative to `path`.
        update: BatchedUpdate,
    },
    /// Key-membership delta for a wildcard path.
    Keys {
        /// The wildcard path (`prefix/*`).
        path: Path,
        /// Added and deleted keys.
        delta: KeyDelta,
    },
    /// Keep-alive check.
    Ping(Value),
    /// Server is about to close the connection.
    Goodbye(String),
}

impl ClientBound {
    /// Encodes into a wire event.
    pub fn to_event(&self) -> ProtocolResult<WireEvent> {
        match self {
            ClientBound::Data { path, update } => {
                WireEvent::new(format!("{}{}", event::DATA_PREFIX, path), update)
            }
            ClientBound::Keys { path, delta } => {
                WireEvent::new(format!("{}{}", event::DATA_PREFIX, path), delta)
            }
            ClientBound::Ping(payload) => WireEvent::new(event::PING, payload),
            ClientBound::Goodbye(reason) => WireEvent::new(
                event::GOODBYE,
                &Goodbye {
                    reason: reason.clone(),
                },
            ),
        }
    }

    /// Decodes a wire event received by a client.
    pub fn from_event(wire: WireEvent) -> ProtocolResult<Self> {
        match wire.event.as_str() {
            event::PING => Ok(ClientBound::Ping(wire.data)),
            event::GOODBYE => {
                let goodbye: Goodbye = wire.payload()?;
                Ok(ClientBound::Goodbye(goodbye.reason))
            }
            name => match name.strip_prefix(event::DATA_PREFIX) {
                Some(raw) => {
                    let path = Path::parse(raw)?;
                    if path.is_wildcard() {
                        Ok(ClientBound::Keys {
                            path,
                            delta: wire.payload()?,
                        })
                    } else {
                        Ok(ClientBound::Data {
                            path,
                            update: wire.payload()?,
                        })
                    }
                }
                None => Err(ProtocolError::UnknownEvent(wire.event)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use serde_json::json;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn data_event_matches_wire_shape() {
        let message = ClientBound::Data {
            path: p("players/1"),
            update: BatchedUpdate::change(Node::from_json(json!({"name": "Ralph"})).unwrap()),
        };
        let wire = message.to_event().unwrap();
        assert_eq!(wire.event, "data:players/1");
        assert_eq!(
            wire.data,
            json!({"change": {"value": {"name": {"value": "Ralph"}}}})
        );
        assert_eq!(ClientBound::from_event(wire).unwrap(), message);
    }

    #[test]
    fn wildcard_events_decode_as_keys() {
        let wire = WireEvent {
            event: "data:players/*".into(),
            data: json!({"added": ["1", "2"]}),
        };
        match ClientBound::from_event(wire).unwrap() {
            ClientBound::Keys { path, delta } => {
                assert_eq!(path, p("players/*"));
                assert_eq!(delta.added, vec!["1", "2"]);
                assert!(delta.deleted.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn commands_are_direction_aware() {
        let wire = WireEvent {
            event: "data:update".into(),
            data: json!({}),
        };
        // the server reads a command, a client reads a value update for `update`
        assert!(matches!(
            ServerBound::from_event(wire.clone()).unwrap(),
            ServerBound::Update(_)
        ));
        assert!(matches!(
            ClientBound::from_event(wire).unwrap(),
            ClientBound::Data { path, .. } if path == p("update")
        ));
    }

    #[test]
    fn relative_mutations_never_read_as_commands() {
        let node = Node::from_json(json!({"x": 1})).unwrap();
        for name in ["update", "subscribe", "unsubscribe", "subscribeKeys"] {
            let wire = ServerBound::Data {
                path: p(name),
                update: BatchedUpdate {
                    change: Some(node.clone()),
                    delete: vec![p("old")],
                },
            }
            .to_event()
            .unwrap();
            assert_eq!(wire.event, event::UPDATE);

            let ServerBound::Update(rooted) = ServerBound::from_event(wire).unwrap() else {
                panic!("{name} did not decode as a root-relative update");
            };
            assert_eq!(rooted.delete, vec![p(&format!("{name}/old"))]);
            let mut expected = serde_json::Map::new();
            expected.insert(name.to_string(), json!({"x": 1}));
            assert_eq!(
                rooted.change.map(|n| n.to_json()),
                Some(Value::Object(expected))
            );
        }

        // nested paths keep the relative form
        let wire = ServerBound::Data {
            path: p("update/1"),
            update: BatchedUpdate::change(node),
        }
        .to_event()
        .unwrap();
        assert_eq!(wire.event, "data:update/1");
        assert!(matches!(
            ServerBound::from_event(wire).unwrap(),
            ServerBound::Data { path, .. } if path == p("update/1")
        ));
    }

    #[test]
    fn subscribe_payloads() {
        let wire = ServerBound::Subscribe(SubscribeRequest {
            path: p("a/b"),
            once: false,
        })
        .to_event()
        .unwrap();
        assert_eq!(wire.data, json!({"path": "a/b"}));

        let decoded = ServerBound::from_event(WireEvent {
            event: event::SUBSCRIBE.into(),
            data: json!({"path": "a", "once": true}),
        })
        .unwrap();
        assert_eq!(
            decoded,
            ServerBound::Subscribe(SubscribeRequest {
                path: p("a"),
                once: true
            })
        );
    }

    #[test]
    fn bad_payloads_and_names() {
        let err = ServerBound::from_event(WireEvent {
            event: event::SUBSCRIBE.into(),
            data: json!({"nope": 1}),
        })
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Payload { .. }));

        let err = ClientBound::from_event(WireEvent {
            event: "chat:message".into(),
            data: json!(null),
        })
        .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownEvent(_)));
    }

    #[test]
    fn envelope_roundtrip_preserves_order() {
        let envelope = Envelope::new(vec![
            ClientBound::Ping(json!({"t": 1})).to_event().unwrap(),
            ClientBound::Goodbye(KEEP_ALIVE_FAILED.into())
                .to_event()
                .unwrap(),
        ]);
        let frame = envelope.encode().unwrap();
        let decoded = Envelope::decode(&frame).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.events[1].data, json!({"reason": "keep-alive-check-failed"}));

        assert!(Envelope::decode("not json").is_err());
    }
}
