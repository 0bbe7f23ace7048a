use thiserror::Error;

use crate::network::message::{Body, ErrorCode};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unsupported message type `{0}`")]
    NotSupported(String),

    #[error("key `{0}` does not exist")]
    KeyDoesNotExist(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("rpc to `{dest}` timed out")]
    Timeout { dest: String },

    #[error("remote error {code}: {text}")]
    Remote { code: ErrorCode, text: String },

    #[error("counter `{0}` would overflow")]
    Overflow(String),

    #[error("transport closed")]
    TransportClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Error {
    pub fn malformed(reason: impl std::fmt::Display) -> Self {
        Error::Malformed(reason.to_string())
    }

    /// Wire code a caller sees when a handler fails with this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Malformed(_) => ErrorCode::MalformedRequest,
            Error::NotSupported(_) => ErrorCode::NotSupported,
            Error::KeyDoesNotExist(_) => ErrorCode::KeyDoesNotExist,
            Error::PreconditionFailed(_) => ErrorCode::PreconditionFailed,
            Error::Timeout { .. } => ErrorCode::Timeout,
            Error::Remote { code, .. } => *code,
            Error::TransportClosed => ErrorCode::TemporarilyUnavailable,
            Error::Overflow(_) | Error::Io(_) | Error::Encode(_) => ErrorCode::Crash,
        }
    }

    /// Decodes an `error` reply body into a typed error.
    pub fn from_reply(key: &str, body: &Body) -> Self {
        let code = body
            .fields
            .get("code")
            .and_then(|code| code.as_u64())
            .map(ErrorCode::from)
            .unwrap_or(ErrorCode::Crash);
        let text = body
            .fields
            .get("text")
            .and_then(|text| text.as_str())
            .unwrap_or_default()
            .to_owned();

        match code {
            ErrorCode::KeyDoesNotExist => Error::KeyDoesNotExist(key.to_owned()),
            ErrorCode::PreconditionFailed => Error::PreconditionFailed(text),
            code => Error::Remote { code, text },
        }
    }

    pub fn to_body(&self) -> Body {
        Body::error(self.code(), self.to_string())
    }
}
