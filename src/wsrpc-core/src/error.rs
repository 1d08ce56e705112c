use crate::error_code::{self, InvalidErrorCode, StandardErrorCode};
use serde_json::Value;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// A JSON-RPC error object, received from the server or synthesized locally.
///
/// Displays as `<code> - <message>`, falling back to the canonical message
/// for the code when the server did not send one.
#[derive(Debug, Clone)]
pub struct RpcError {
    code: i32,
    message: Option<String>,
    data: Option<Value>,
    cause: Option<Arc<anyhow::Error>>,
}

impl RpcError {
    pub fn new(code: i32) -> Result<Self, InvalidErrorCode> {
        error_code::validate(code)?;
        Ok(Self::from_parts(code, None, None))
    }

    pub fn standard(code: StandardErrorCode) -> Self {
        Self::from_parts(code.code(), None, None)
    }

    pub fn from_parts(code: i32, message: Option<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message,
            data,
            cause: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(Arc::new(cause.into()));
        self
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn standard_code(&self) -> Option<StandardErrorCode> {
        StandardErrorCode::from_code(self.code)
    }

    pub fn rpc_message(&self) -> Option<&str> {
        match self.message.as_deref() {
            Some(message) if !message.is_empty() => Some(message),
            _ => error_code::message_for(self.code).ok().flatten(),
        }
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }
}

impl PartialEq for RpcError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message && self.data == other.data
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rpc_message() {
            Some(message) => write!(f, "{} - {}", self.code, message),
            None => write!(f, "{}", self.code),
        }
    }
}

impl StdError for RpcError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallTemplate {
    pub method: String,
    pub params: Vec<Value>,
}

impl CallTemplate {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

impl fmt::Display for CallTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.method)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{call} failed.")]
pub struct CallError {
    call: Arc<CallTemplate>,
    #[source]
    cause: CallFailure,
}

impl CallError {
    pub fn new(call: Arc<CallTemplate>, cause: CallFailure) -> Self {
        Self { call, cause }
    }

    pub fn method(&self) -> &str {
        &self.call.method
    }

    pub fn params(&self) -> &[Value] {
        &self.call.params
    }

    pub fn cause(&self) -> &CallFailure {
        &self.cause
    }

    pub fn into_cause(self) -> CallFailure {
        self.cause
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallFailure {
    #[error(transparent)]
    Application(RpcError),

    #[error("Promise timed out after {0}ms")]
    TimedOut(u64),

    #[error(transparent)]
    Transport(TransportError),

    #[error("Connection closed.")]
    ConnectionClosed,

    #[error("Pending request registry disposed.")]
    Disposed,

    #[error("Connection is not open.")]
    NotOpen,

    #[error("Failed to encode request: {0}")]
    Encode(anyhow::Error),

    #[error("Unexpected result: {0}")]
    InvalidResult(#[source] serde_json::Error),
}

impl CallFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallFailure::TimedOut(_))
    }
}

#[derive(Debug)]
pub struct TransportError {
    request: Value,
    source: anyhow::Error,
}

impl TransportError {
    pub fn new(request: Value, source: anyhow::Error) -> Self {
        Self { request, source }
    }

    pub fn request(&self) -> &Value {
        &self.request
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = StandardErrorCode::TransportError;
        write!(f, "{} - {}", code.code(), code.message())
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.source)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to open connection to {target}")]
pub struct ConnectionError {
    target: Url,
    #[source]
    cause: OpenFailure,
}

impl ConnectionError {
    pub fn new(target: Url, cause: OpenFailure) -> Self {
        Self { target, cause }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn cause(&self) -> &OpenFailure {
        &self.cause
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OpenFailure {
    #[error(transparent)]
    Rpc(RpcError),

    #[error("Connection timed out after {0}ms")]
    TimedOut(u64),

    #[error("Connection is already open or opening.")]
    AlreadyActive,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    InvalidJson(String),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Notification is missing its method name")]
    MissingMethod,

    #[error("Response {0} carries neither result nor error")]
    MissingOutcome(Value),

    #[error("Malformed error object: {0}")]
    InvalidErrorObject(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("WebSocket client requires a ws:// or wss:// URL, got {0}")]
pub struct InvalidTarget(pub Url);
