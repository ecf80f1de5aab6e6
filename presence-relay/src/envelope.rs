//! Envelopes: the unit of communication between endpoints and the broker.
//!
//! In memory an [`Envelope`] is a tagged value: the variant decides which
//! fields exist, and routing is explicit ([`Route::Direct`] or
//! [`Route::Broadcast`]). On the wire it is a flat record with a numeric
//! `msg_type` discriminator; decoding rejects records whose discriminator and
//! populated fields disagree.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::{ConnId, EndpointDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub from: ConnId,
    pub route: Route,
    /// Milliseconds since the Unix epoch, stamped at construction.
    pub sent_at: u64,
    pub is_success: bool,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Broadcast,
    Direct(ConnId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Text { message: String },
    Command(Command),
    LineState(LineState),
}

/// Presence payload. `is_success` on the envelope says online or offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineState {
    /// One arrival or departure.
    Single(EndpointDescriptor),
    /// Full roster of one role, sent in answer to a roster query.
    Bulk(Vec<EndpointDescriptor>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MsgType {
    Text = 0,
    Command = 1,
    LineState = 2,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("unknown msg_type {0}")]
    UnknownMsgType(u8),
    #[error("text envelope is missing its message")]
    MissingMessage,
    #[error("command envelope is missing its command")]
    MissingCommand,
    #[error("line state envelope must carry exactly one of im_model or im_models")]
    AmbiguousLineState,
}

impl Envelope {
    pub fn text(from: impl Into<ConnId>, route: Route, message: impl Into<String>) -> Self {
        Self::build(
            from.into(),
            route,
            true,
            Body::Text {
                message: message.into(),
            },
        )
    }

    pub fn command(from: impl Into<ConnId>, route: Route, command: Command) -> Self {
        Self::build(from.into(), route, true, Body::Command(command))
    }

    /// Presence event announcing that `descriptor` came online.
    pub fn online(descriptor: EndpointDescriptor) -> Self {
        Self::presence(descriptor, true)
    }

    /// Presence event announcing that `descriptor` went offline.
    pub fn offline(descriptor: EndpointDescriptor) -> Self {
        Self::presence(descriptor, false)
    }

    /// Roster answer addressed to `requester`.
    pub fn roster(requester: impl Into<ConnId>, descriptors: Vec<EndpointDescriptor>) -> Self {
        Self::build(
            ConnId::new(),
            Route::Direct(requester.into()),
            true,
            Body::LineState(LineState::Bulk(descriptors)),
        )
    }

    fn presence(descriptor: EndpointDescriptor, is_success: bool) -> Self {
        Self::build(
            descriptor.conn_id.clone(),
            Route::Broadcast,
            is_success,
            Body::LineState(LineState::Single(descriptor)),
        )
    }

    fn build(from: ConnId, route: Route, is_success: bool, body: Body) -> Self {
        Self {
            from,
            route,
            sent_at: now_millis(),
            is_success,
            body,
        }
    }

    pub fn msg_type(&self) -> MsgType {
        match self.body {
            Body::Text { .. } => MsgType::Text,
            Body::Command(_) => MsgType::Command,
            Body::LineState(_) => MsgType::LineState,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

impl From<MsgType> for u8 {
    fn from(value: MsgType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = EnvelopeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MsgType::Text),
            1 => Ok(MsgType::Command),
            2 => Ok(MsgType::LineState),
            other => Err(EnvelopeError::UnknownMsgType(other)),
        }
    }
}

/// Flat wire record. An empty `to_conn_id` means broadcast.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    from_conn_id: String,
    #[serde(default)]
    to_conn_id: String,
    trans_time: u64,
    is_success: bool,
    msg_type: MsgType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    im_model: Option<EndpointDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    im_models: Option<Vec<EndpointDescriptor>>,
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let msg_type = envelope.msg_type();
        let mut wire = WireEnvelope {
            from_conn_id: envelope.from,
            to_conn_id: match envelope.route {
                Route::Broadcast => String::new(),
                Route::Direct(recipient) => recipient,
            },
            trans_time: envelope.sent_at,
            is_success: envelope.is_success,
            msg_type,
            message: None,
            command: None,
            im_model: None,
            im_models: None,
        };

        match envelope.body {
            Body::Text { message } => wire.message = Some(message),
            Body::Command(command) => wire.command = Some(command),
            Body::LineState(LineState::Single(descriptor)) => wire.im_model = Some(descriptor),
            Body::LineState(LineState::Bulk(descriptors)) => wire.im_models = Some(descriptors),
        }
        wire
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let body = match wire.msg_type {
            MsgType::Text => Body::Text {
                message: wire.message.ok_or(EnvelopeError::MissingMessage)?,
            },
            MsgType::Command => Body::Command(wire.command.ok_or(EnvelopeError::MissingCommand)?),
            MsgType::LineState => match (wire.im_model, wire.im_models) {
                (Some(descriptor), None) => Body::LineState(LineState::Single(descriptor)),
                (None, Some(descriptors)) => Body::LineState(LineState::Bulk(descriptors)),
                _ => return Err(EnvelopeError::AmbiguousLineState),
            },
        };

        let route = if wire.to_conn_id.is_empty() {
            Route::Broadcast
        } else {
            Route::Direct(wire.to_conn_id)
        };

        Ok(Envelope {
            from: wire.from_conn_id,
            route,
            sent_at: wire.trans_time,
            is_success: wire.is_success,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::descriptor::Role;

    #[test]
    fn discriminator_is_numeric_on_the_wire() {
        let text = serde_json::to_value(Envelope::text("a", Route::Broadcast, "hi")).unwrap();
        let ping = serde_json::to_value(Envelope::command(
            "a",
            Route::Direct("b".into()),
            Command::Ping { nonce: 7 },
        ))
        .unwrap();
        let online = serde_json::to_value(Envelope::online(
            EndpointDescriptor::new("svc", Role::Service).with_conn_id("s1"),
        ))
        .unwrap();

        assert_eq!(text["msg_type"], json!(0));
        assert_eq!(text["to_conn_id"], json!(""));
        assert_eq!(ping["msg_type"], json!(1));
        assert_eq!(ping["to_conn_id"], json!("b"));
        assert_eq!(online["msg_type"], json!(2));
        assert_eq!(online["from_conn_id"], json!("s1"));
        assert_eq!(online["im_model"]["conn_id"], json!("s1"));
        assert_eq!(online.get("im_models"), None);
    }

    #[test]
    fn empty_roster_stays_bulk() {
        let encoded = serde_json::to_string(&Envelope::roster("c1", Vec::new())).unwrap();
        let decoded: Envelope = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.route, Route::Direct("c1".into()));
        assert_eq!(decoded.body, Body::LineState(LineState::Bulk(Vec::new())));
    }

    #[test]
    fn rejects_text_without_message() {
        let record = json!({
            "from_conn_id": "a",
            "trans_time": 0,
            "is_success": true,
            "msg_type": 0,
        });

        let err = serde_json::from_value::<Envelope>(record).unwrap_err();
        assert!(err.to_string().contains("missing its message"), "{err}");
    }

    #[test]
    fn rejects_line_state_with_both_payloads() {
        let descriptor = serde_json::to_value(EndpointDescriptor::new("x", Role::Client)).unwrap();
        let record = json!({
            "from_conn_id": "a",
            "trans_time": 0,
            "is_success": true,
            "msg_type": 2,
            "im_model": descriptor.clone(),
            "im_models": [descriptor],
        });

        assert!(serde_json::from_value::<Envelope>(record).is_err());
    }

    #[test]
    fn rejects_unknown_discriminator() {
        let record: Value = json!({
            "from_conn_id": "a",
            "trans_time": 0,
            "is_success": true,
            "msg_type": 9,
            "message": "hi",
        });

        let err = serde_json::from_value::<Envelope>(record).unwrap_err();
        assert!(err.to_string().contains("unknown msg_type 9"), "{err}");
    }
}
