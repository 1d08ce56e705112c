use crate::error::InvalidTarget;
use crate::transport::{Connector, OpenOutcome, Transport, TransportMessage};
use anyhow::anyhow;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};
use url::Url;

/// How long `close` waits for the peer to answer the close frame.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }

    pub fn check_target(target: &Url) -> Result<(), InvalidTarget> {
        match target.scheme() {
            "ws" | "wss" => Ok(()),
            _ => Err(InvalidTarget(target.clone())),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn open(&self, target: &Url) -> OpenOutcome<WebSocketTransport> {
        debug!(%target, "opening websocket");
        match connect_async(target.as_str()).await {
            Ok((ws, response)) => {
                trace!(status = %response.status(), "websocket handshake complete");
                OpenOutcome::Opened(WebSocketTransport::new(ws))
            }
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status();
                OpenOutcome::UnexpectedResponse {
                    status: status.as_u16(),
                    status_text: status.canonical_reason().unwrap_or_default().to_string(),
                }
            }
            Err(err) => OpenOutcome::Failed(err.into()),
        }
    }
}

pub struct WebSocketTransport<S = MaybeTlsStream<TcpStream>> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    close_timeout: Duration,
}

impl<S> std::fmt::Debug for WebSocketTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport").finish_non_exhaustive()
    }
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            close_timeout: CLOSE_TIMEOUT,
        }
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, msg: &TransportMessage) -> anyhow::Result<()> {
        let msg = match msg {
            TransportMessage::Text(bytes) => Message::text(String::from_utf8(bytes.clone())?),
            TransportMessage::Binary(bytes) => Message::binary(bytes.clone()),
        };
        self.sink.lock().await.send(msg).await?;
        Ok(())
    }

    async fn receive(&self) -> anyhow::Result<TransportMessage> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(TransportMessage::Text(text.as_str().as_bytes().to_vec()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(TransportMessage::Binary(bytes.to_vec()));
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(match frame {
                        Some(frame) => anyhow!(
                            "connection closed by peer: {} {}",
                            frame.code,
                            frame.reason.as_str()
                        ),
                        None => anyhow!("connection closed by peer"),
                    });
                }
                // control frames are answered by tungstenite
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(anyhow!("connection closed")),
            }
        }
    }

    /// Sends a normal (1000) close frame and waits up to the close timeout
    /// for the peer to finish the closing handshake.
    async fn close(&self) -> anyhow::Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        match self.sink.lock().await.send(Message::Close(Some(frame))).await {
            Ok(()) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let mut stream = self.stream.lock().await;
        let handshake = async {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Close(_)) => trace!("close acknowledged"),
                    Ok(_) => {}
                    Err(err) => {
                        trace!("connection ended while closing: {err}");
                        break;
                    }
                }
            }
        };
        time::timeout(self.close_timeout, handshake)
            .await
            .map_err(|_| anyhow!("peer did not finish closing within {:?}", self.close_timeout))
    }
}
