//! The token message model.
//!
//! A [`Token`] is the structured application-level message exchanged once
//! the WebSocket handshake is complete: a namespace, a type, an ordered map
//! of named fields, and an optional caller-supplied correlation id. The
//! routing layer rejects tokens without a namespace, so construction always
//! takes one.

use serde_json::{Map, Value};

/// A structured, namespaced application message.
///
/// Fields keep their insertion order, so a token survives an
/// encode/decode round-trip with the same field sequence.
///
/// # Examples
///
/// ```rust
/// use tokamak_protocol::Token;
///
/// let mut token = Token::new("tokamak.system", "login");
/// token.set_string("username", "guest");
/// token.set_i64("attempt", 1);
/// assert_eq!(token.get_string("username"), Some("guest"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// The plugin namespace this token is addressed to
    pub namespace: String,
    /// The token type within the namespace
    pub token_type: String,
    /// Caller-supplied correlation id, echoed back on responses
    pub id: Option<String>,
    /// Named fields in insertion order
    pub fields: Map<String, Value>,
}

impl Token {
    /// Creates a token with the given namespace and type and no fields.
    pub fn new(namespace: impl Into<String>, token_type: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            token_type: token_type.into(),
            id: None,
            fields: Map::new(),
        }
    }

    /// Sets the correlation id, consuming and returning the token.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Inserts a raw JSON value field.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// Inserts a string field.
    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), Value::String(value.into()));
    }

    /// Inserts an integer field.
    pub fn set_i64(&mut self, key: impl Into<String>, value: i64) {
        self.fields.insert(key.into(), Value::from(value));
    }

    /// Inserts a boolean field.
    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.fields.insert(key.into(), Value::Bool(value));
    }

    /// Returns a field as a raw JSON value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns a string field.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Returns an integer field.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_i64)
    }

    /// Returns a boolean field.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    /// Whether the token requests out-of-band execution on the dispatch pool.
    pub fn spawn_thread(&self) -> bool {
        self.get_bool("spawnThread").unwrap_or(false)
    }

    /// Builds the conventional response token for this one: same namespace,
    /// type `"response"`, with the request type and correlation id echoed.
    pub fn response(&self) -> Token {
        let mut response = Token::new(self.namespace.clone(), "response");
        response.set_string("reqType", self.token_type.clone());
        if let Some(id) = &self.id {
            response.id = Some(id.clone());
        }
        response
    }
}
