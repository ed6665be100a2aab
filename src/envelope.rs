//! Wire codec for chat envelopes
//!
//! Every frame on the wire is one UTF-8 JSON object. An [`Envelope`] holds
//! both views of such a record, the structured field map and its
//! serialized text, computed once at construction and immutable after.
//!
//! The `message` field carries either one of the control tokens
//! ([`NEW_CONNECTION_REQUEST`], [`CLOSED_CONNECTION_REQUEST`]) or ordinary
//! chat text. Control messages additionally announce the sender's own
//! listen endpoint in `serverIP`/`serverPort`.

use crate::endpoint::{resolve, Endpoint};
use crate::error::EnvelopeError;
use serde_json::{Map, Value};

/// Control token announcing a newly-reachable peer
pub const NEW_CONNECTION_REQUEST: &str = "$$$NEWCONNECT";

/// Control token announcing an orderly departure
pub const CLOSED_CONNECTION_REQUEST: &str = "$$$EXIT";

/// Username attached to locally-synthesized system notices
pub const SYSTEM_USERNAME: &str = "group chat";

/// Upper bound on a single receive call; larger records are a known
/// limitation and are not reassembled
pub const RECV_BUFFER_SIZE: usize = 2048;

/// A decoded or to-be-encoded protocol message
///
/// `decode(encode(r))` reproduces `r`'s fields exactly for flat records;
/// the reverse direction preserves meaning but not necessarily bytes.
#[derive(Debug, Clone)]
pub struct Envelope {
    fields: Map<String, Value>,
    wire: String,
}

impl Envelope {
    /// Build an envelope from a structured field map
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        let wire = Value::Object(fields.clone()).to_string();
        Self { fields, wire }
    }

    /// Build an envelope from its serialized wire text
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::Malformed`] when the text does not deserialize,
    /// [`EnvelopeError::NotARecord`] when it deserializes to something
    /// other than a key/value record.
    pub fn from_wire(wire: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(wire).map_err(|e| EnvelopeError::Malformed {
                reason: e.to_string(),
            })?;
        match value {
            Value::Object(fields) => Ok(Self {
                fields,
                wire: wire.to_string(),
            }),
            _ => Err(EnvelopeError::NotARecord),
        }
    }

    /// Build an envelope from either representation
    ///
    /// Accepts a record (the structured view) or a string (the wire view,
    /// which is re-parsed). Anything else (an array, a number, `null`)
    /// fails with [`EnvelopeError::NotARecord`].
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::Object(fields) => Ok(Self::from_fields(fields)),
            Value::String(wire) => Self::from_wire(&wire),
            _ => Err(EnvelopeError::NotARecord),
        }
    }

    /// The new-connection announcement sent right after a successful dial
    pub fn announcement(listen: Endpoint, username: &str) -> Self {
        Self::control(NEW_CONNECTION_REQUEST, listen, username)
    }

    /// The close announcement sent to every open channel during shutdown
    pub fn farewell(listen: Endpoint, username: &str) -> Self {
        Self::control(CLOSED_CONNECTION_REQUEST, listen, username)
    }

    /// An ordinary chat message
    pub fn chat(username: &str, text: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("username".to_string(), Value::from(username));
        fields.insert("message".to_string(), Value::from(text));
        Self::from_fields(fields)
    }

    /// A locally-synthesized notice, e.g. describing a failed dial
    ///
    /// Never sent on the wire; published on the observer bus under
    /// [`SYSTEM_USERNAME`].
    pub fn system(text: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("username".to_string(), Value::from(SYSTEM_USERNAME));
        fields.insert("message".to_string(), Value::from(text));
        Self::from_fields(fields)
    }

    fn control(kind: &str, listen: Endpoint, username: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("serverIP".to_string(), Value::from(listen.ip().to_string()));
        fields.insert("serverPort".to_string(), Value::from(listen.port()));
        fields.insert("username".to_string(), Value::from(username));
        fields.insert("message".to_string(), Value::from(kind));
        Self::from_fields(fields)
    }

    /// The structured view
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// The serialized view
    pub fn wire(&self) -> &str {
        &self.wire
    }

    /// The `message` field: a control token or chat text
    pub fn kind(&self) -> Option<&str> {
        self.fields.get("message").and_then(Value::as_str)
    }

    /// The sender's display name, if present
    pub fn username(&self) -> Option<&str> {
        self.fields.get("username").and_then(Value::as_str)
    }

    /// The listen endpoint announced by a control message
    ///
    /// Joins `serverIP` and `serverPort` through the address resolver, so
    /// the result is canonical and comparable against table keys. `None`
    /// when either field is absent or does not validate.
    pub fn announced_endpoint(&self) -> Option<Endpoint> {
        let ip = self.fields.get("serverIP")?.as_str()?;
        let port = self.fields.get("serverPort")?.as_u64()?;
        let port = u16::try_from(port).ok()?;
        resolve(ip, Some(port)).ok()
    }

    /// Whether this is a new-connection announcement
    pub fn is_announcement(&self) -> bool {
        self.kind() == Some(NEW_CONNECTION_REQUEST)
    }

    /// Whether this is a close announcement
    pub fn is_farewell(&self) -> bool {
        self.kind() == Some(CLOSED_CONNECTION_REQUEST)
    }
}
