//! Token wire codecs.
//!
//! A codec translates between a [`Token`] and the bytes carried in a frame,
//! keyed by the sub-protocol format negotiated during the handshake. The
//! routing layer only requires the `encode`/`decode` pair; concrete formats
//! beyond JSON (CSV, XML) are external collaborators implementing the same
//! trait.

use crate::error::ProtocolError;
use crate::token::Token;
use serde_json::{Map, Value};

/// Format string for the built-in JSON codec.
pub const FORMAT_JSON: &str = "json";

/// Reserved field carrying the namespace on the wire.
const FIELD_NS: &str = "ns";
/// Reserved field carrying the token type on the wire.
const FIELD_TYPE: &str = "type";
/// Reserved field carrying the correlation id on the wire.
const FIELD_UTID: &str = "utid";

/// Translates tokens to and from wire bytes for one format.
pub trait TokenCodec: Send + Sync {
    /// The format string this codec is registered under.
    fn format(&self) -> &str;

    /// Encodes a token into wire bytes.
    fn encode(&self, token: &Token) -> Result<Vec<u8>, ProtocolError>;

    /// Decodes wire bytes into a token.
    ///
    /// Returns [`ProtocolError::MissingNamespace`] when the payload carries
    /// no namespace, so malformed traffic is dropped before routing.
    fn decode(&self, data: &[u8]) -> Result<Token, ProtocolError>;
}

/// The built-in JSON token codec.
///
/// Tokens map to a flat JSON object: the reserved keys `ns`, `type`, and
/// `utid` carry the envelope, everything else is a field. Field order is
/// preserved both ways.
#[derive(Debug, Default, Clone)]
pub struct JsonTokenCodec;

impl JsonTokenCodec {
    /// Creates the JSON codec.
    pub fn new() -> Self {
        Self
    }
}

impl TokenCodec for JsonTokenCodec {
    fn format(&self) -> &str {
        FORMAT_JSON
    }

    fn encode(&self, token: &Token) -> Result<Vec<u8>, ProtocolError> {
        let mut object = Map::with_capacity(token.fields.len() + 3);
        object.insert(FIELD_NS.into(), Value::String(token.namespace.clone()));
        object.insert(FIELD_TYPE.into(), Value::String(token.token_type.clone()));
        if let Some(id) = &token.id {
            object.insert(FIELD_UTID.into(), Value::String(id.clone()));
        }
        for (key, value) in &token.fields {
            object.insert(key.clone(), value.clone());
        }
        serde_json::to_vec(&Value::Object(object)).map_err(|e| ProtocolError::Codec(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<Token, ProtocolError> {
        let value: Value =
            serde_json::from_slice(data).map_err(|e| ProtocolError::Codec(e.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::Codec("expected a JSON object".into()));
        };

        let namespace = match object.remove(FIELD_NS) {
            Some(Value::String(ns)) if !ns.is_empty() => ns,
            _ => return Err(ProtocolError::MissingNamespace),
        };
        let token_type = match object.remove(FIELD_TYPE) {
            Some(Value::String(t)) => t,
            _ => return Err(ProtocolError::Codec("token has no type".into())),
        };
        let id = match object.remove(FIELD_UTID) {
            Some(Value::String(id)) => Some(id),
            _ => None,
        };

        Ok(Token {
            namespace,
            token_type,
            id,
            fields: object,
        })
    }
}
