pub mod codec;
mod client;
mod config;
mod connection;
mod dispatcher;
mod emitter;
mod error;
pub mod error_code;
mod message;
mod pending;
pub mod transport;

pub use client::JsonRpcClient;
pub use config::ClientOptions;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use dispatcher::{MessageDispatcher, Routed};
pub use emitter::{NotificationEmitter, NotificationHandler, SubscriptionId};
pub use error::*;
pub use error_code::{InvalidErrorCode, StandardErrorCode};
pub use message::*;
pub use pending::{PendingRequests, PendingResponse};
pub use transport::channel::{ChannelConnector, ChannelTransport, channel_transport_pair};
pub use transport::websocket::{WebSocketConnector, WebSocketTransport};
pub use transport::{Connector, OpenOutcome, Transport, TransportMessage};
