//! Tag-based message dispatch.
//!
//! In-process channels carry the typed enums directly and handlers match on
//! them exhaustively. Text transports go through [`dispatch_envelope`], which
//! checks the `__type` tag before decoding so an unknown message kind is
//! reported as such instead of as a generic parse failure.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Field carrying the discriminant in every envelope.
pub const TAG_FIELD: &str = "__type";

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message tag: {0}")]
    UnknownTag(String),
    #[error("Envelope has no __type tag")]
    MissingTag,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A message kind with a stable short discriminant.
pub trait Tagged {
    fn tag(&self) -> &'static str;

    /// Every discriminant this message kind can carry.
    fn known_tags() -> &'static [&'static str];
}

/// Handler for one direction of the protocol.
///
/// Implementors match on the message enum; each call runs to completion
/// before the next message is dispatched.
pub trait Dispatch {
    type Message: Tagged + DeserializeOwned;

    fn dispatch(&mut self, msg: Self::Message);
}

/// Decode a JSON envelope into a message.
///
/// # Errors
/// Returns `UnknownTag` if the tag is not one of `M::known_tags()`,
/// `MissingTag` if there is no tag, and `Json` for malformed bodies.
pub fn decode_envelope<M>(json: &str) -> Result<M, ProtocolError>
where
    M: Tagged + DeserializeOwned,
{
    let value: Value = serde_json::from_str(json)?;
    let tag = value
        .get(TAG_FIELD)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingTag)?;
    if !M::known_tags().contains(&tag) {
        return Err(ProtocolError::UnknownTag(tag.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

/// Encode a message as a JSON envelope.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode_envelope<M: Serialize>(msg: &M) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode `json` and hand it to `dispatcher`.
///
/// Envelopes that fail to decode are logged and dropped; the error is
/// returned so callers can count or report them.
///
/// # Errors
/// Returns the decode error for dropped envelopes.
pub fn dispatch_envelope<D: Dispatch>(dispatcher: &mut D, json: &str) -> Result<(), ProtocolError> {
    match decode_envelope::<D::Message>(json) {
        Ok(msg) => {
            tracing::trace!(tag = msg.tag(), "Dispatching envelope");
            dispatcher.dispatch(msg);
            Ok(())
        }
        Err(e) => {
            tracing::warn!("Dropping envelope: {e}");
            Err(e)
        }
    }
}
