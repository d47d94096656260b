//! Envelope codec: converts application messages to and from wire frames.
//!
//! Typed messages travel as text frames holding `{"type": .., "payload": ..}`,
//! with the `payload` key omitted when there is none. Binary frames are raw
//! payloads and are passed through untouched in both directions.

use std::fmt;
use std::ops::Deref;
use std::str::Utf8Error;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::errors::CodecError;

/// UTF-8 text in a shared [`Bytes`] buffer. Clones share the buffer, and
/// [`into_bytes`](Self::into_bytes) hands it to a socket without copying.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Utf8Text(Bytes);

impl Utf8Text {
    /// The text as a string slice.
    pub fn as_str(&self) -> &str {
        // Every constructor checks the bytes, so this never falls back.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    /// The underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The shared buffer.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Deref for Utf8Text {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl From<String> for Utf8Text {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<&str> for Utf8Text {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl TryFrom<Bytes> for Utf8Text {
    type Error = Utf8Error;

    fn try_from(bytes: Bytes) -> Result<Self, Utf8Error> {
        let _ = std::str::from_utf8(&bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Utf8Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Utf8Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

/// One message as it crosses the transport boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame. Clones share the same buffer.
    Text(Utf8Text),
    /// Binary frame.
    Binary(Bytes),
}

impl Frame {
    /// Build a text frame.
    pub fn text(text: impl Into<Utf8Text>) -> Self {
        Self::Text(text.into())
    }

    /// Build a binary frame.
    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Self::Binary(bytes.into())
    }

    /// Length of the frame body in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the frame body is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this is a text frame.
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }
}

/// A decoded message.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// `{type, payload?}`. Drives the type-scoped notification.
    Typed {
        /// Message type, never empty.
        kind: String,
        /// Optional payload; `None` is omitted on the wire.
        payload: Option<Value>,
    },
    /// JSON text that does not carry a usable `type`.
    Untyped(Value),
    /// Binary data, passed through unchanged.
    Raw(Bytes),
}

impl Envelope {
    /// Build a typed envelope, serializing `payload`.
    ///
    /// A payload that serializes to `null` (including `()` and `None`) is
    /// treated as absent.
    pub fn typed(kind: impl Into<String>, payload: impl Serialize) -> Result<Self, CodecError> {
        let kind = kind.into();
        if kind.is_empty() {
            return Err(CodecError::EmptyType);
        }
        let payload = serde_json::to_value(payload)?;
        Ok(Self::Typed {
            kind,
            payload: present(payload),
        })
    }

    /// Build a typed envelope with no payload.
    pub fn signal(kind: impl Into<String>) -> Result<Self, CodecError> {
        Self::typed(kind, ())
    }

    /// Wrap raw bytes.
    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        Self::Raw(bytes.into())
    }

    /// Message type, for typed envelopes.
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Typed { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Payload, for typed envelopes that carry one.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Typed { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }

    /// Whether this is a binary passthrough.
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Value>,
}

fn present(value: Value) -> Option<Value> {
    if value.is_null() { None } else { Some(value) }
}

/// Encode an envelope into a frame.
pub fn encode(envelope: &Envelope) -> Result<Frame, CodecError> {
    match envelope {
        Envelope::Typed { kind, payload } => {
            if kind.is_empty() {
                return Err(CodecError::EmptyType);
            }
            let wire = WireMessage {
                kind,
                payload: payload.as_ref().filter(|p| !p.is_null()),
            };
            Ok(Frame::text(serde_json::to_string(&wire)?))
        }
        Envelope::Untyped(value) => Ok(Frame::text(serde_json::to_string(value)?)),
        Envelope::Raw(bytes) => Ok(Frame::Binary(bytes.clone())),
    }
}

/// Decode a frame into an envelope.
///
/// Binary frames never fail. Text frames fail only when they are not JSON;
/// JSON without a non-empty string `type` decodes as [`Envelope::Untyped`].
pub fn decode(frame: &Frame) -> Result<Envelope, CodecError> {
    match frame {
        Frame::Text(text) => {
            let value: Value = serde_json::from_slice(text.as_bytes())?;
            Ok(classify(value))
        }
        Frame::Binary(bytes) => Ok(Envelope::Raw(bytes.clone())),
    }
}

fn classify(value: Value) -> Envelope {
    let Value::Object(mut map) = value else {
        return Envelope::Untyped(value);
    };
    match map.remove("type") {
        Some(Value::String(kind)) if !kind.is_empty() => Envelope::Typed {
            kind,
            payload: map.remove("payload").and_then(present),
        },
        other => {
            if let Some(original) = other {
                let _ = map.insert("type".into(), original);
            }
            Envelope::Untyped(Value::Object(map))
        }
    }
}

/// A message encoded once and shared by every recipient of a broadcast.
#[derive(Debug)]
pub struct PreparedMessage {
    frame: Frame,
}

impl PreparedMessage {
    /// Encode `envelope` into the staging frame.
    pub fn new(envelope: &Envelope) -> Result<Self, CodecError> {
        Ok(Self {
            frame: encode(envelope)?,
        })
    }

    /// The encoded frame.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Release the staging frame once every recipient has been handed a copy.
    #[allow(clippy::needless_pass_by_value)]
    pub fn finalize(self) {
        trace!(len = self.frame.len(), "released prepared message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn text_of(frame: &Frame) -> &str {
        match frame {
            Frame::Text(t) => t.as_str(),
            Frame::Binary(_) => panic!("expected text frame"),
        }
    }

    #[test]
    fn typed_round_trip() {
        let env = Envelope::typed("echo", json!({"text": "hi"})).unwrap();
        let decoded = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(
            decoded,
            Envelope::Typed {
                kind: "echo".into(),
                payload: Some(json!({"text": "hi"})),
            }
        );
    }

    #[test]
    fn raw_bytes_pass_through_unchanged() {
        let bytes = Bytes::from_static(&[0, 159, 146, 150, 255]);
        let frame = encode(&Envelope::raw(bytes.clone())).unwrap();
        assert_eq!(frame, Frame::Binary(bytes.clone()));
        assert_eq!(decode(&frame).unwrap(), Envelope::Raw(bytes));
    }

    #[test]
    fn absent_payload_is_omitted() {
        let frame = encode(&Envelope::signal("clear").unwrap()).unwrap();
        assert_eq!(text_of(&frame), r#"{"type":"clear"}"#);
    }

    #[test]
    fn null_payload_is_omitted() {
        let env = Envelope::Typed {
            kind: "ping".into(),
            payload: Some(Value::Null),
        };
        assert_eq!(text_of(&encode(&env).unwrap()), r#"{"type":"ping"}"#);
    }

    #[test]
    fn falsy_payloads_are_kept() {
        let frame = encode(&Envelope::typed("count", 0).unwrap()).unwrap();
        assert_eq!(text_of(&frame), r#"{"type":"count","payload":0}"#);
        let frame = encode(&Envelope::typed("flag", false).unwrap()).unwrap();
        assert_eq!(text_of(&frame), r#"{"type":"flag","payload":false}"#);
    }

    #[test]
    fn empty_type_is_rejected() {
        assert_matches!(Envelope::typed("", 1), Err(CodecError::EmptyType));
        let env = Envelope::Typed {
            kind: String::new(),
            payload: None,
        };
        assert_matches!(encode(&env), Err(CodecError::EmptyType));
    }

    #[test]
    fn invalid_json_is_a_codec_error() {
        assert_matches!(decode(&Frame::text("not json")), Err(CodecError::Json(_)));
        assert_matches!(decode(&Frame::text("")), Err(CodecError::Json(_)));
    }

    #[test]
    fn json_without_type_is_untyped() {
        let env = decode(&Frame::text(r#"{"text":"hi"}"#)).unwrap();
        assert_eq!(env, Envelope::Untyped(json!({"text": "hi"})));
        let env = decode(&Frame::text("[1,2,3]")).unwrap();
        assert_eq!(env, Envelope::Untyped(json!([1, 2, 3])));
    }

    #[test]
    fn empty_or_non_string_type_is_untyped() {
        let env = decode(&Frame::text(r#"{"type":"","payload":1}"#)).unwrap();
        assert_eq!(env, Envelope::Untyped(json!({"type": "", "payload": 1})));
        let env = decode(&Frame::text(r#"{"type":7}"#)).unwrap();
        assert_eq!(env, Envelope::Untyped(json!({"type": 7})));
    }

    #[test]
    fn untyped_object_with_type_decodes_as_typed() {
        let env = Envelope::Untyped(json!({"type": "position", "payload": {"x": 10}}));
        let decoded = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(decoded.kind(), Some("position"));
        assert_eq!(decoded.payload(), Some(&json!({"x": 10})));
    }

    #[test]
    fn prepared_message_shares_one_allocation() {
        let prepared = PreparedMessage::new(&Envelope::typed("say", "hi").unwrap()).unwrap();
        let a = prepared.frame().clone();
        let b = prepared.frame().clone();
        prepared.finalize();
        match (a, b) {
            (Frame::Text(a), Frame::Text(b)) => {
                assert_eq!(a.as_bytes().as_ptr(), b.as_bytes().as_ptr());
            }
            _ => panic!("expected text frames"),
        }
    }

    #[test]
    fn text_from_bytes_is_checked_without_copying() {
        let bytes = Bytes::from_static("héllo".as_bytes());
        let text = Utf8Text::try_from(bytes.clone()).unwrap();
        assert_eq!(text.as_str(), "héllo");
        assert_eq!(text.into_bytes().as_ptr(), bytes.as_ptr());
        assert!(Utf8Text::try_from(Bytes::from_static(&[0xff, 0xfe])).is_err());
    }

    #[test]
    fn frame_len() {
        assert_eq!(Frame::text("abc").len(), 3);
        assert!(Frame::binary(Vec::new()).is_empty());
        assert!(Frame::text("x").is_text());
    }
}
