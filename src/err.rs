#![allow(non_snake_case)]

use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Maybe<T> {
    Nothing(Error),
    Fine(Success<T>),
}

pub fn Fine<V>(v: V) -> Maybe<V>
where
    V: Serialize,
{
    Maybe::Fine(Success::of(v))
}

pub fn Nothing<V>(err: Error) -> Maybe<V> {
    Maybe::Nothing(err)
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

impl<T> Maybe<T> {
    pub fn is_fine(&self) -> bool {
        matches!(self, Maybe::Fine(_))
    }
}

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[serde(tag = "error")]
pub enum Error {
    #[error("{message}")]
    NotFound { message: String },
    #[error("{message}")]
    InvalidPayload { message: String },
    #[error("registration `{registration}` is already in use")]
    DuplicateRegistration { registration: String },
    #[error("invalid QR: {message}")]
    MalformedPayload { message: String },
    #[error("{message}")]
    AuthenticationFailure { message: String },
    #[error("session is not valid")]
    InvalidSession,
    #[error("session has expired")]
    SessionExpired,
    #[error("operation requires the `{required}` role")]
    PermissionDenied { required: &'static str },
    #[error("{kind}: {message}")]
    InternalError { kind: &'static str, message: String },
    #[error("{message}")]
    Unknown { message: String },
}

impl Error {
    pub fn unknown<S: Into<String>>(msg: S) -> Error {
        Error::Unknown {
            message: msg.into(),
        }
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Error {
        Error::NotFound {
            message: msg.into(),
        }
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Error {
        Error::InvalidPayload {
            message: msg.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::InternalError {
            kind: "IOError",
            message: io.to_string(),
        }
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Self::InternalError {
            kind: "IOError",
            message: err.error.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InternalError {
            kind: "SerializationError",
            message: err.to_string(),
        }
    }
}

impl From<qrcode::types::QrError> for Error {
    fn from(err: qrcode::types::QrError) -> Self {
        Self::InternalError {
            kind: "QrEncodeError",
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Unknown {
            message: err.to_string(),
        }
    }
}

pub type Payload<T> = std::result::Result<Maybe<T>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok(Fine(value))
}

pub fn breaks<V>(err: Error) -> Payload<V>
where
    V: Serialize,
{
    Ok(Nothing(err))
}
