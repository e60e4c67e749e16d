//! Wire messages exchanged with clients.
//!
//! Inbound frames are decoded once into [`ClientMessage`]; everything the relay
//! sends is a [`RelayMessage`] serialized as a JSON array.

use std::sync::Arc;

use serde::{ser::SerializeSeq, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::{
    event::Event,
    filter::{Filter, FilterError},
};

/// Longest subscription id accepted in a REQ.
pub const MAX_SUB_ID_LEN: usize = 64;

/// Requests a client can send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`; the payload is validated by the publish path.
    Event(Value),
    /// `["REQ", <sub id>, <filter>...]`
    Req { sub_id: String, filters: Vec<Filter> },
    /// `["CLOSE", <sub id>]`
    Close(String),
}

/// Malformed inbound input. Reported to the peer as a NOTICE.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message format: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message must be a JSON array")]
    NotArray,
    #[error("empty message")]
    Empty,
    #[error("invalid message type")]
    BadType,
    #[error("unknown message type: {0}")]
    Unknown(String),
    #[error("invalid {0} message")]
    Arity(&'static str),
    #[error("invalid subscription id")]
    SubId,
    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),
}

impl ClientMessage {
    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let val: Value = serde_json::from_str(text)?;
        let Value::Array(mut arr) = val else {
            return Err(ProtocolError::NotArray);
        };
        if arr.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let kind = match arr.first() {
            Some(Value::String(s)) => s.clone(),
            _ => return Err(ProtocolError::BadType),
        };
        match kind.as_str() {
            "EVENT" => {
                if arr.len() < 2 {
                    return Err(ProtocolError::Arity("EVENT"));
                }
                Ok(ClientMessage::Event(arr.swap_remove(1)))
            }
            "REQ" => {
                if arr.len() < 2 {
                    return Err(ProtocolError::Arity("REQ"));
                }
                let sub_id = sub_id(&arr[1])?;
                let filters = arr[2..]
                    .iter()
                    .map(Filter::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ClientMessage::Req { sub_id, filters })
            }
            "CLOSE" => {
                if arr.len() < 2 {
                    return Err(ProtocolError::Arity("CLOSE"));
                }
                Ok(ClientMessage::Close(sub_id(&arr[1])?))
            }
            _ => Err(ProtocolError::Unknown(kind)),
        }
    }
}

fn sub_id(val: &Value) -> Result<String, ProtocolError> {
    match val.as_str() {
        Some(id) if !id.is_empty() && id.chars().count() <= MAX_SUB_ID_LEN => Ok(id.to_string()),
        _ => Err(ProtocolError::SubId),
    }
}

/// Messages the relay sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", <sub id>, <event>]`
    Event { sub_id: String, event: Arc<Event> },
    /// `["OK", <event id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["EOSE", <sub id>]`
    Eose(String),
    /// `["NOTICE", <message>]`
    Notice(String),
}

impl RelayMessage {
    pub fn accepted(event_id: impl Into<String>) -> Self {
        RelayMessage::Ok {
            event_id: event_id.into(),
            accepted: true,
            message: String::new(),
        }
    }

    pub fn rejected(event_id: impl Into<String>, message: impl Into<String>) -> Self {
        RelayMessage::Ok {
            event_id: event_id.into(),
            accepted: false,
            message: message.into(),
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Serialize for RelayMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RelayMessage::Event { sub_id, event } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("EVENT")?;
                seq.serialize_element(sub_id)?;
                seq.serialize_element(event.as_ref())?;
                seq.end()
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element("OK")?;
                seq.serialize_element(event_id)?;
                seq.serialize_element(accepted)?;
                seq.serialize_element(message)?;
                seq.end()
            }
            RelayMessage::Eose(sub_id) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("EOSE")?;
                seq.serialize_element(sub_id)?;
                seq.end()
            }
            RelayMessage::Notice(message) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("NOTICE")?;
                seq.serialize_element(message)?;
                seq.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_req_with_filters() {
        let msg = ClientMessage::parse(r#"["REQ","s1",{"kinds":[1]},{"authors":["ab"]}]"#).unwrap();
        let ClientMessage::Req { sub_id, filters } = msg else {
            panic!("expected REQ");
        };
        assert_eq!(sub_id, "s1");
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].kinds, vec![1]);
        assert_eq!(filters[1].authors, vec!["ab"]);
    }

    #[test]
    fn parses_req_without_filters() {
        let msg = ClientMessage::parse(r#"["REQ","s1"]"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Req {
                sub_id: "s1".into(),
                filters: vec![]
            }
        );
    }

    #[test]
    fn parses_event_and_close() {
        let msg = ClientMessage::parse(r#"["EVENT",{"id":"x"}]"#).unwrap();
        assert_eq!(msg, ClientMessage::Event(json!({"id": "x"})));
        let msg = ClientMessage::parse(r#"["CLOSE","s1"]"#).unwrap();
        assert_eq!(msg, ClientMessage::Close("s1".into()));
    }

    #[test]
    fn malformed_inputs() {
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            ClientMessage::parse("{}"),
            Err(ProtocolError::NotArray)
        ));
        assert!(matches!(ClientMessage::parse("[]"), Err(ProtocolError::Empty)));
        assert!(matches!(
            ClientMessage::parse("[1]"),
            Err(ProtocolError::BadType)
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["AUTH","x"]"#),
            Err(ProtocolError::Unknown(t)) if t == "AUTH"
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["EVENT"]"#),
            Err(ProtocolError::Arity("EVENT"))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["CLOSE",5]"#),
            Err(ProtocolError::SubId)
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["REQ",""]"#),
            Err(ProtocolError::SubId)
        ));
        let long = "x".repeat(MAX_SUB_ID_LEN + 1);
        assert!(matches!(
            ClientMessage::parse(&json!(["REQ", long]).to_string()),
            Err(ProtocolError::SubId)
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["REQ","s",{"kinds":"1"}]"#),
            Err(ProtocolError::Filter(_))
        ));
    }

    #[test]
    fn relay_messages_serialize_as_arrays() {
        let ok = RelayMessage::accepted("abc").to_json().unwrap();
        assert_eq!(ok, r#"["OK","abc",true,""]"#);
        let rejected = RelayMessage::rejected("abc", "invalid signature")
            .to_json()
            .unwrap();
        assert_eq!(rejected, r#"["OK","abc",false,"invalid signature"]"#);
        assert_eq!(
            RelayMessage::Eose("s1".into()).to_json().unwrap(),
            r#"["EOSE","s1"]"#
        );
        assert_eq!(
            RelayMessage::Notice("hi".into()).to_json().unwrap(),
            r#"["NOTICE","hi"]"#
        );
        let ev = Arc::new(Event {
            id: "aa".into(),
            pubkey: "bb".into(),
            kind: 1,
            created_at: 2,
            tags: vec![],
            content: "c".into(),
            sig: "dd".into(),
        });
        let val: Value = serde_json::from_str(
            &RelayMessage::Event {
                sub_id: "s".into(),
                event: ev,
            }
            .to_json()
            .unwrap(),
        )
        .unwrap();
        assert_eq!(val[0], "EVENT");
        assert_eq!(val[1], "s");
        assert_eq!(val[2]["id"], "aa");
        assert_eq!(val[2]["kind"], 1);
    }
}
