use async_trait::async_trait;
use std::fmt::Debug;
use url::Url;

pub mod channel;
pub mod websocket;

#[derive(Clone, Eq, PartialEq)]
pub enum TransportMessage {
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

impl TransportMessage {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TransportMessage::Text(bytes) | TransportMessage::Binary(bytes) => bytes,
        }
    }
}

impl Debug for TransportMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMessage::Text(bytes) => write!(
                f,
                "TransportMessage::Text({:?})",
                String::from_utf8_lossy(bytes)
            ),
            TransportMessage::Binary(bytes) => {
                write!(f, "TransportMessage::Binary(len={:?})", bytes.len())
            }
        }
    }
}

/// An established, bidirectional message link.
///
/// `receive` is only ever called from one task at a time. An error from
/// `receive` means the link is gone.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, msg: &TransportMessage) -> anyhow::Result<()>;
    async fn receive(&self) -> anyhow::Result<TransportMessage>;
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub enum OpenOutcome<T> {
    Opened(T),
    Failed(anyhow::Error),
    UnexpectedResponse { status: u16, status_text: String },
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    async fn open(&self, target: &Url) -> OpenOutcome<Self::Transport>;
}
