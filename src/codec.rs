//! Wire codec for the client/relay JSON array protocol.
//!
//! Inbound frames are only checked for envelope shape here. Event bodies are
//! kept as raw JSON so the validator can report field-level failures.

use nostr::{Event, Filter};
use serde_json::{json, Value};
use thiserror::Error as ThisError;

pub const MAX_SUBSCRIPTION_ID_LEN: usize = 64;

#[derive(Debug, ThisError, PartialEq)]
pub enum CodecError {
    #[error("invalid: malformed JSON: {0}")]
    MalformedJson(String),
    #[error("invalid: message must be a non-empty JSON array")]
    NotAnArray,
    #[error("invalid: message type must be a string")]
    MissingType,
    #[error("unsupported: unknown message type {0}")]
    UnknownType(String),
    #[error("invalid: {0} message has the wrong number of elements")]
    WrongArity(&'static str),
    #[error("invalid: {0} payload must be a JSON object")]
    NotAnObject(&'static str),
    #[error("invalid: subscription id must be a string of 1 to 64 characters")]
    InvalidSubscriptionId,
    #[error("invalid: malformed filter: {reason}")]
    InvalidFilter {
        subscription_id: String,
        reason: String,
    },
}

impl CodecError {
    /// Subscription the error belongs to, when the envelope got that far.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            CodecError::InvalidFilter {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        }
    }
}

/// An event payload that passed envelope parsing but not validation.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    raw: Value,
}

impl InboundEvent {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// The id the client claims, used to address OK replies even when the
    /// event later fails validation.
    pub fn claimed_id(&self) -> Option<&str> {
        self.raw.get("id").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Event(Box<InboundEvent>),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
    Auth(Box<InboundEvent>),
}

impl ClientMessage {
    pub fn from_json(text: &str) -> Result<Self, CodecError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| CodecError::MalformedJson(e.to_string()))?;
        let Value::Array(mut items) = value else {
            return Err(CodecError::NotAnArray);
        };
        if items.is_empty() {
            return Err(CodecError::NotAnArray);
        }

        let message_type = match items.remove(0) {
            Value::String(s) => s,
            _ => return Err(CodecError::MissingType),
        };

        match message_type.as_str() {
            "EVENT" => Ok(ClientMessage::Event(Box::new(event_payload(
                "EVENT", items,
            )?))),
            "AUTH" => Ok(ClientMessage::Auth(Box::new(event_payload("AUTH", items)?))),
            "CLOSE" => {
                if items.len() != 1 {
                    return Err(CodecError::WrongArity("CLOSE"));
                }
                let subscription_id = subscription_id(&items[0])?;
                Ok(ClientMessage::Close(subscription_id))
            }
            "REQ" => {
                if items.len() < 2 {
                    return Err(CodecError::WrongArity("REQ"));
                }
                let subscription_id = subscription_id(&items[0])?;
                let filters = items
                    .into_iter()
                    .skip(1)
                    .map(|value| {
                        if !value.is_object() {
                            return Err(CodecError::InvalidFilter {
                                subscription_id: subscription_id.clone(),
                                reason: "filter must be a JSON object".to_string(),
                            });
                        }
                        serde_json::from_value::<Filter>(value).map_err(|e| {
                            CodecError::InvalidFilter {
                                subscription_id: subscription_id.clone(),
                                reason: e.to_string(),
                            }
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            other => Err(CodecError::UnknownType(other.to_string())),
        }
    }
}

fn event_payload(message_type: &'static str, items: Vec<Value>) -> Result<InboundEvent, CodecError> {
    let mut items = items.into_iter();
    match (items.next(), items.next()) {
        (Some(value @ Value::Object(_)), None) => Ok(InboundEvent::new(value)),
        (Some(_), None) => Err(CodecError::NotAnObject(message_type)),
        _ => Err(CodecError::WrongArity(message_type)),
    }
}

fn subscription_id(value: &Value) -> Result<String, CodecError> {
    match value.as_str() {
        Some(id) if !id.is_empty() && id.chars().count() <= MAX_SUBSCRIPTION_ID_LEN => {
            Ok(id.to_string())
        }
        _ => Err(CodecError::InvalidSubscriptionId),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Ok {
        event_id: String,
        status: bool,
        message: String,
    },
    EndOfStoredEvents(String),
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice {
        message: String,
    },
    Auth {
        challenge: String,
    },
}

impl RelayMessage {
    pub fn event<S: Into<String>>(subscription_id: S, event: Event) -> Self {
        RelayMessage::Event {
            subscription_id: subscription_id.into(),
            event: Box::new(event),
        }
    }

    pub fn ok<I: Into<String>, M: Into<String>>(event_id: I, status: bool, message: M) -> Self {
        RelayMessage::Ok {
            event_id: event_id.into(),
            status,
            message: message.into(),
        }
    }

    pub fn eose<S: Into<String>>(subscription_id: S) -> Self {
        RelayMessage::EndOfStoredEvents(subscription_id.into())
    }

    pub fn closed<S: Into<String>, M: Into<String>>(subscription_id: S, message: M) -> Self {
        RelayMessage::Closed {
            subscription_id: subscription_id.into(),
            message: message.into(),
        }
    }

    pub fn notice<M: Into<String>>(message: M) -> Self {
        RelayMessage::Notice {
            message: message.into(),
        }
    }

    pub fn auth<S: Into<String>>(challenge: S) -> Self {
        RelayMessage::Auth {
            challenge: challenge.into(),
        }
    }

    pub fn to_json(&self) -> String {
        let value = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok {
                event_id,
                status,
                message,
            } => json!(["OK", event_id, status, message]),
            RelayMessage::EndOfStoredEvents(subscription_id) => json!(["EOSE", subscription_id]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
            RelayMessage::Notice { message } => json!(["NOTICE", message]),
            RelayMessage::Auth { challenge } => json!(["AUTH", challenge]),
        };
        value.to_string()
    }
}
