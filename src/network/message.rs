use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::{Error, Result};

/*
    Every message is a single JSON object on its own line:

        {"src": "n1", "dest": "n2", "body": {"type": "propagate", "message": 42}}

    The body always names its kind in `type`. Requests that expect an answer
    carry a `msg_id`; answers point back at it through `in_reply_to`. All
    other fields are specific to the message kind and stay flattened in the
    body next to those three.
*/

pub const INIT: &str = "init";
pub const INIT_OK: &str = "init_ok";
pub const ERROR: &str = "error";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub src: String,
    pub dest: String,
    pub body: Body,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Body {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Timeout,
    NodeNotFound,
    NotSupported,
    TemporarilyUnavailable,
    MalformedRequest,
    Crash,
    Abort,
    KeyDoesNotExist,
    KeyAlreadyExists,
    PreconditionFailed,
    TxnConflict,
    Other(u64),
}

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub node_id: String,
    pub node_ids: Vec<String>,
}

impl Message {
    pub fn new(src: impl Into<String>, dest: impl Into<String>, body: Body) -> Self {
        Message {
            src: src.into(),
            dest: dest.into(),
            body,
        }
    }

    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(Error::malformed)
    }

    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_reply(&self) -> bool {
        self.body.in_reply_to.is_some()
    }
}

impl Body {
    pub fn new(kind: impl Into<String>) -> Self {
        Body {
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Builds a body of the given kind whose fields are the serialized payload.
    pub fn from_payload<T: Serialize>(kind: &str, payload: &T) -> Result<Self> {
        let fields = match serde_json::to_value(payload)? {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            other => {
                return Err(Error::malformed(format!(
                    "payload for `{kind}` must be an object, got {other}"
                )))
            }
        };

        Ok(Body {
            kind: kind.to_owned(),
            fields,
            ..Default::default()
        })
    }

    pub fn error(code: ErrorCode, text: impl Into<String>) -> Self {
        let mut body = Body::new(ERROR);
        body.fields.insert("code".into(), Value::from(u64::from(code)));
        body.fields.insert("text".into(), Value::from(text.into()));
        body
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_owned(), value.into());
        self
    }

    /// Decodes the kind-specific fields. Missing or mistyped fields are a
    /// malformed request, never a panic.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.fields.clone()))
            .map_err(|e| Error::malformed(format!("`{}`: {e}", self.kind)))
    }

    pub fn is_error(&self) -> bool {
        self.kind == ERROR
    }
}

impl From<u64> for ErrorCode {
    fn from(code: u64) -> Self {
        match code {
            0 => ErrorCode::Timeout,
            1 => ErrorCode::NodeNotFound,
            10 => ErrorCode::NotSupported,
            11 => ErrorCode::TemporarilyUnavailable,
            12 => ErrorCode::MalformedRequest,
            13 => ErrorCode::Crash,
            14 => ErrorCode::Abort,
            20 => ErrorCode::KeyDoesNotExist,
            21 => ErrorCode::KeyAlreadyExists,
            22 => ErrorCode::PreconditionFailed,
            30 => ErrorCode::TxnConflict,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u64 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Timeout => 0,
            ErrorCode::NodeNotFound => 1,
            ErrorCode::NotSupported => 10,
            ErrorCode::TemporarilyUnavailable => 11,
            ErrorCode::MalformedRequest => 12,
            ErrorCode::Crash => 13,
            ErrorCode::Abort => 14,
            ErrorCode::KeyDoesNotExist => 20,
            ErrorCode::KeyAlreadyExists => 21,
            ErrorCode::PreconditionFailed => 22,
            ErrorCode::TxnConflict => 30,
            ErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u64::from(*self))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decode_line() {
        let line = r#"{"src":"c1","dest":"n1","body":{"type":"broadcast","msg_id":7,"message":42}}"#;
        let message = Message::from_line(line).unwrap();

        assert_eq!(message.src, "c1");
        assert_eq!(message.body.kind, "broadcast");
        assert_eq!(message.body.msg_id, Some(7));
        assert_eq!(message.body.in_reply_to, None);
        assert_eq!(message.body.fields.get("message"), Some(&json!(42)));
    }

    #[test]
    fn test_encode_omits_absent_ids() {
        let message = Message::new("n1", "n2", Body::new("propagate").with("message", 5));
        let encoded: Value = serde_json::from_str(&message.to_line().unwrap()).unwrap();

        assert_eq!(
            encoded,
            json!({"src": "n1", "dest": "n2", "body": {"type": "propagate", "message": 5}})
        );
    }

    #[test]
    fn test_parse_missing_field() {
        #[derive(Debug, Deserialize)]
        struct Payload {
            #[allow(dead_code)]
            message: i64,
        }

        let body = Body::new("broadcast").with("message", "not a number");
        let err = body.parse::<Payload>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedRequest);

        let err = Body::new("broadcast").parse::<Payload>().unwrap_err();
        assert!(err.to_string().contains("message"));
    }

    #[test]
    fn test_garbage_line() {
        let err = Message::from_line("{not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedRequest);
    }

    #[test]
    fn test_error_code_numbers() {
        for code in [0u64, 1, 10, 11, 12, 13, 14, 20, 21, 22, 30, 99] {
            assert_eq!(u64::from(ErrorCode::from(code)), code);
        }
    }
}
