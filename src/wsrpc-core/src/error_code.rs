use std::fmt;
use std::ops::RangeInclusive;

pub const RESERVED_RANGE: RangeInclusive<i32> = -32768..=-32000;

pub const SERVER_ERROR_RANGE: RangeInclusive<i32> = -32099..=-32000;

pub const UNEXPECTED_RESPONSE: i32 = -32000;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardErrorCode {
    ParseErrorInvalidCharacterForEncoding = -32702,
    ParseErrorUnsupportedEncoding = -32701,
    ParseErrorNotWellFormed = -32700,
    ServerErrorInternalRpcError = -32603,
    ServerErrorInvalidMethodParameters = -32602,
    ServerErrorRequestedMethodNotFound = -32601,
    ServerErrorInvalidRpcNotConformingToSpec = -32600,
    ApplicationError = -32500,
    SystemError = -32400,
    TransportError = -32300,
}

impl StandardErrorCode {
    pub const ALL: [StandardErrorCode; 10] = [
        Self::ParseErrorInvalidCharacterForEncoding,
        Self::ParseErrorUnsupportedEncoding,
        Self::ParseErrorNotWellFormed,
        Self::ServerErrorInternalRpcError,
        Self::ServerErrorInvalidMethodParameters,
        Self::ServerErrorRequestedMethodNotFound,
        Self::ServerErrorInvalidRpcNotConformingToSpec,
        Self::ApplicationError,
        Self::SystemError,
        Self::TransportError,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::ParseErrorNotWellFormed => "Parse error. Not well formed.",
            Self::ParseErrorUnsupportedEncoding => "Parse error. Unsupported encoding.",
            Self::ParseErrorInvalidCharacterForEncoding => {
                "Parse error. Invalid character for encoding."
            }
            Self::ServerErrorInvalidRpcNotConformingToSpec => {
                "Server error. Invalid RPC not conforming to spec."
            }
            Self::ServerErrorRequestedMethodNotFound => "Server error. Requested method not found.",
            Self::ServerErrorInvalidMethodParameters => "Server error. Invalid method parameters.",
            Self::ServerErrorInternalRpcError => "Server error. Internal RPC error.",
            Self::ApplicationError => "Application error",
            Self::SystemError => "System error.",
            Self::TransportError => "Transport error.",
        }
    }
}

impl From<StandardErrorCode> for i32 {
    fn from(code: StandardErrorCode) -> Self {
        code.code()
    }
}

impl fmt::Display for StandardErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid RPC error code: {0}")]
pub struct InvalidErrorCode(pub i32);

pub fn validate(code: i32) -> Result<(), InvalidErrorCode> {
    if RESERVED_RANGE.contains(&code) {
        Ok(())
    } else {
        Err(InvalidErrorCode(code))
    }
}

pub fn message_for(code: i32) -> Result<Option<&'static str>, InvalidErrorCode> {
    validate(code)?;

    if let Some(standard) = StandardErrorCode::from_code(code) {
        return Ok(Some(standard.message()));
    }

    if SERVER_ERROR_RANGE.contains(&code) {
        return Ok(Some("Server error."));
    }

    Ok(None)
}
