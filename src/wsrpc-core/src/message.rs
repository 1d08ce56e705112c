use crate::error::{ProtocolError, RpcError};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

pub type RequestId = u64;

pub type Extra = Map<String, Value>;

const REQUEST_KEYS: [&str; 4] = ["jsonrpc", "id", "method", "params"];
const RESPONSE_KEYS: [&str; 4] = ["jsonrpc", "id", "result", "error"];
const NOTIFICATION_KEYS: [&str; 3] = ["jsonrpc", "method", "params"];

/// Outgoing call or notification.
///
/// Serializes as `{...extra, jsonrpc, id?, method, params}`. The JSON-RPC keys
/// always take precedence over same-named keys in `extra`.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingMessage<'a> {
    pub id: Option<RequestId>,
    pub method: &'a str,
    pub params: &'a [Value],
    pub extra: Option<&'a Extra>,
}

impl<'a> OutgoingMessage<'a> {
    pub fn call(
        id: RequestId,
        method: &'a str,
        params: &'a [Value],
        extra: Option<&'a Extra>,
    ) -> Self {
        Self {
            id: Some(id),
            method,
            params,
            extra,
        }
    }

    pub fn notification(method: &'a str, params: &'a [Value], extra: Option<&'a Extra>) -> Self {
        Self {
            id: None,
            method,
            params,
            extra,
        }
    }
}

impl Serialize for OutgoingMessage<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(extra) = self.extra {
            for (key, value) in extra {
                if !REQUEST_KEYS.contains(&key.as_str()) {
                    map.serialize_entry(key, value)?;
                }
            }
        }
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        if let Some(id) = self.id {
            map.serialize_entry("id", &id)?;
        }
        map.serialize_entry("method", self.method)?;
        map.serialize_entry("params", self.params)?;
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub result: Value,
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Vec<Value>,
    pub extra: Extra,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            extra: Extra::new(),
        }
    }

    pub fn param(&self) -> Option<&Value> {
        self.params.first()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub id: Value,
    pub outcome: ResponseOutcome,
    pub extra: Extra,
}

impl ResponseFrame {
    pub fn request_id(&self) -> Option<RequestId> {
        self.id.as_u64()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    code: i32,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response(ResponseFrame),
    Notification(Notification),
}

impl InboundFrame {
    /// Classify a decoded frame.
    ///
    /// Anything carrying an `id` member is a response, whatever its value:
    /// `0` and `null` are still responses.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        match object.remove("id") {
            Some(id) => Self::response(id, object),
            None => Self::notification(object),
        }
    }

    fn response(id: Value, mut object: Map<String, Value>) -> Result<Self, ProtocolError> {
        let outcome = if let Some(error) = object.remove("error") {
            let error: ErrorObject = serde_json::from_value(error)
                .map_err(|e| ProtocolError::InvalidErrorObject(e.to_string()))?;
            ResponseOutcome::Error(RpcError::from_parts(error.code, error.message, error.data))
        } else if let Some(result) = object.remove("result") {
            ResponseOutcome::Result(result)
        } else {
            return Err(ProtocolError::MissingOutcome(id));
        };

        Ok(InboundFrame::Response(ResponseFrame {
            id,
            outcome,
            extra: strip(object, &RESPONSE_KEYS),
        }))
    }

    fn notification(mut object: Map<String, Value>) -> Result<Self, ProtocolError> {
        let method = match object.remove("method") {
            Some(Value::String(method)) => method,
            _ => return Err(ProtocolError::MissingMethod),
        };

        let params = match object.remove("params") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(params)) => params,
            Some(other) => vec![other],
        };

        Ok(InboundFrame::Notification(Notification {
            method,
            params,
            extra: strip(object, &NOTIFICATION_KEYS),
        }))
    }
}

fn strip(mut object: Map<String, Value>, keys: &[&str]) -> Extra {
    for key in keys {
        object.remove(*key);
    }
    object
}
