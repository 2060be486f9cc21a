use std::{fmt, io};

use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

pub type Result<T> = std::result::Result<T, Error>;

/// Status codes reported to callers; the numeric values travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, Primitive)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    Internal = 13,
    Unavailable = 14,
    Unauthenticated = 16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString)]
pub enum ErrorKind {
    /// The local direction is already half-closed or the end-of-stream marker
    /// was already consumed.
    SessionClosed,
    /// The balancer has no address set, or the current one is empty.
    NoAddressesAvailable,
    DeadlineExceeded,
    Cancelled,
    /// Connectivity failure on the transport channel.
    Transport,
    /// Malformed frame or a call-shape violation.
    Protocol,
    NotFound,
    /// Certificate or handshake failure.
    Security,
    /// Unexpected runtime failure inside handler or interceptor code.
    Handler,
    Other,
}

impl ErrorKind {
    pub fn code(self) -> Code {
        match self {
            ErrorKind::SessionClosed => Code::Internal,
            ErrorKind::NoAddressesAvailable => Code::Unavailable,
            ErrorKind::DeadlineExceeded => Code::DeadlineExceeded,
            ErrorKind::Cancelled => Code::Cancelled,
            ErrorKind::Transport => Code::Unavailable,
            ErrorKind::Protocol => Code::InvalidArgument,
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::Security => Code::Unauthenticated,
            ErrorKind::Handler => Code::Internal,
            ErrorKind::Other => Code::Unknown,
        }
    }
}

/// The error type used across the framework.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    detail: Option<Vec<u8>>,
}

impl Error {
    pub fn new<E: ToString>(kind: ErrorKind, err: E) -> Self {
        Error {
            kind,
            message: err.to_string(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Vec<u8>) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> Code {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&[u8]> {
        self.detail.as_deref()
    }

    /// Serializes this error into the payload of an error-status frame.
    pub fn to_status_payload(&self) -> Vec<u8> {
        let status = Status {
            code: self.code().to_u8().unwrap_or(2),
            message: self.message.clone(),
            detail: self.detail.clone(),
        };
        serde_json::to_vec(&status).unwrap_or_default()
    }

    /// Rebuilds an error from the payload of an error-status frame.
    pub fn from_status_payload(payload: &[u8]) -> Error {
        match serde_json::from_slice::<Status>(payload) {
            Ok(status) => Error::from_status(status),
            Err(err) => Error::new(ErrorKind::Protocol, format!("malformed status payload: {err}")),
        }
    }

    pub fn from_status(status: Status) -> Error {
        let kind = match Code::from_u8(status.code) {
            Some(Code::Cancelled) => ErrorKind::Cancelled,
            Some(Code::DeadlineExceeded) => ErrorKind::DeadlineExceeded,
            Some(Code::InvalidArgument) => ErrorKind::Protocol,
            Some(Code::NotFound) => ErrorKind::NotFound,
            Some(Code::Internal) => ErrorKind::Handler,
            Some(Code::Unavailable) => ErrorKind::Transport,
            Some(Code::Unauthenticated) => ErrorKind::Security,
            _ => ErrorKind::Other,
        };
        Error {
            kind,
            message: status.message,
            detail: status.detail,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::new(ErrorKind::Transport, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Protocol, err)
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::new(ErrorKind::Other, message)
    }
}

/// Wire form of a terminal call error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub code: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_payload_round_trip() {
        let err = Error::new(ErrorKind::DeadlineExceeded, "deadline elapsed");
        let payload = err.to_status_payload();
        let back = Error::from_status_payload(&payload);
        assert_eq!(ErrorKind::DeadlineExceeded, back.kind());
        assert_eq!("deadline elapsed", back.message());
    }

    #[test]
    fn kinds_map_onto_fixed_codes() {
        assert_eq!(Code::Unavailable, ErrorKind::Transport.code());
        assert_eq!(Code::Unavailable, ErrorKind::NoAddressesAvailable.code());
        assert_eq!(Code::Internal, ErrorKind::Handler.code());
        assert_eq!(Code::Unauthenticated, ErrorKind::Security.code());
        assert_eq!(Code::InvalidArgument, ErrorKind::Protocol.code());
    }

    #[test]
    fn unknown_wire_code_degrades_to_other() {
        let status = Status {
            code: 99,
            message: "??".to_owned(),
            detail: None,
        };
        assert_eq!(ErrorKind::Other, Error::from_status(status).kind());
    }
}
