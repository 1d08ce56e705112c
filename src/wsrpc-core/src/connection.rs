use crate::config::as_millis;
use crate::dispatcher::MessageDispatcher;
use crate::error::{
    CallError, CallFailure, CallTemplate, ConnectionError, OpenFailure, ProtocolError, RpcError,
};
use crate::error_code::{StandardErrorCode, UNEXPECTED_RESPONSE};
use crate::message::Extra;
use crate::pending::PendingResponse;
use crate::transport::{Connector, OpenOutcome, Transport};
use anyhow::anyhow;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};
use url::Url;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Closing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Opened,
    ProtocolError(ProtocolError),
    Lost(String),
    Closed,
}

struct Link {
    transport: Arc<dyn Transport>,
    reader: JoinHandle<()>,
}

impl Link {
    fn carries(&self, transport: &Arc<dyn Transport>) -> bool {
        Arc::ptr_eq(&self.transport, transport)
    }
}

struct Shared {
    dispatcher: MessageDispatcher,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    link: Mutex<Option<Link>>,
}

impl Shared {
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn publish(&self, event: ConnectionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn connection_lost(&self, transport: &Arc<dyn Transport>, reason: anyhow::Error) {
        let mut link = self.link.lock().await;
        if !link.as_ref().is_some_and(|link| link.carries(transport)) {
            trace!("receive loop of a detached transport ended: {reason}");
            return;
        }
        link.take();
        drop(link);

        if !self.transition(ConnectionState::Open, ConnectionState::Closed) {
            trace!("receive loop ended while closing: {reason}");
            return;
        }
        warn!("connection lost: {reason}");
        self.dispatcher
            .pending()
            .drain(|| CallFailure::ConnectionClosed);
        self.publish(ConnectionEvent::Lost(reason.to_string()));
    }
}

struct OpeningGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared
                .transition(ConnectionState::Opening, ConnectionState::Closed);
        }
    }
}

/// State machine `Closed -> Opening -> Open -> Closing -> Closed` around a
/// single transport and its receive loop.
pub struct ConnectionManager<K: Connector> {
    target: Url,
    timeout: Option<Duration>,
    connector: K,
    shared: Arc<Shared>,
}

impl<K: Connector> ConnectionManager<K> {
    pub fn new(target: Url, timeout: Option<Duration>, connector: K) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            target,
            timeout,
            connector,
            shared: Arc::new(Shared {
                dispatcher: MessageDispatcher::new(timeout),
                state,
                events,
                link: Mutex::new(None),
            }),
        }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.shared.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub async fn transport(&self) -> Option<Arc<dyn Transport>> {
        let link = self.shared.link.lock().await;
        link.as_ref().map(|link| link.transport.clone())
    }

    pub async fn open(&self) -> Result<(), ConnectionError> {
        if !self
            .shared
            .transition(ConnectionState::Closed, ConnectionState::Opening)
        {
            return Err(self.open_error(OpenFailure::AlreadyActive));
        }
        let mut guard = OpeningGuard {
            shared: &self.shared,
            armed: true,
        };

        debug!(target = %self.target, "opening connection");
        let attempt = self.connector.open(&self.target);
        let outcome = match self.timeout {
            Some(timeout) => match time::timeout(timeout, attempt).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(target = %self.target, ?timeout, "connection attempt timed out");
                    return Err(self.open_error(OpenFailure::TimedOut(as_millis(timeout))));
                }
            },
            None => attempt.await,
        };

        let rpc = match outcome {
            OpenOutcome::Opened(transport) => {
                self.attach(Arc::new(transport)).await;
                guard.armed = false;
                info!(target = %self.target, "connection open");
                self.shared.publish(ConnectionEvent::Opened);
                return Ok(());
            }
            OpenOutcome::Failed(err) => {
                warn!(target = %self.target, "connection failed: {err:#}");
                RpcError::standard(StandardErrorCode::ServerErrorInternalRpcError).with_cause(err)
            }
            OpenOutcome::UnexpectedResponse {
                status,
                status_text,
            } => {
                warn!(target = %self.target, status, "connection rejected");
                RpcError::from_parts(
                    UNEXPECTED_RESPONSE,
                    Some(format!("Unexpected response: {status} - {status_text}")),
                    None,
                )
            }
        };

        Err(self.open_error(OpenFailure::Rpc(rpc)))
    }

    async fn attach(&self, transport: Arc<dyn Transport>) {
        let mut link = self.shared.link.lock().await;
        // Open before the loop starts, so a transport that dies at once is
        // still reported as lost.
        self.shared.state.send_replace(ConnectionState::Open);
        let reader = tokio::spawn(read_loop(self.shared.clone(), transport.clone()));
        *link = Some(Link { transport, reader });
    }

    fn open_error(&self, cause: OpenFailure) -> ConnectionError {
        ConnectionError::new(self.target.clone(), cause)
    }

    /// Register a call and write it to the open transport.
    ///
    /// Whoever detaches a link drains the registry afterwards. A call that
    /// registers once its link is already gone may have missed that drain,
    /// so it is rejected here with "Connection closed.".
    pub async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        extra: Option<Extra>,
    ) -> Result<PendingResponse, CallError> {
        let Some(transport) = self.transport().await else {
            return Err(not_open(method, params));
        };
        let response = self
            .shared
            .dispatcher
            .send_call(transport.as_ref(), method, params, extra)
            .await;

        if !self.is_attached(&transport).await {
            trace!(id = response.id(), "connection went away while calling");
            self.shared
                .dispatcher
                .pending()
                .reject(response.id(), CallFailure::ConnectionClosed);
        }
        Ok(response)
    }

    pub async fn notify(
        &self,
        method: &str,
        params: Vec<Value>,
        extra: Option<Extra>,
    ) -> Result<(), CallError> {
        let Some(transport) = self.transport().await else {
            return Err(not_open(method, params));
        };
        self.shared
            .dispatcher
            .send_notification(transport.as_ref(), method, params, extra)
            .await
    }

    async fn is_attached(&self, transport: &Arc<dyn Transport>) -> bool {
        let link = self.shared.link.lock().await;
        link.as_ref().is_some_and(|link| link.carries(transport))
    }

    pub async fn close(&self) {
        if !self
            .shared
            .transition(ConnectionState::Open, ConnectionState::Closing)
        {
            trace!(state = ?self.state(), "nothing to close");
            return;
        }
        debug!(target = %self.target, "closing connection");

        // the reader may already have detached a failed link
        let link = self.shared.link.lock().await.take();
        let transport = match link {
            Some(Link { transport, reader }) => {
                reader.abort();
                let _ = reader.await;
                Some(transport)
            }
            None => None,
        };

        self.shared
            .dispatcher
            .pending()
            .drain(|| CallFailure::ConnectionClosed);

        if let Some(transport) = transport {
            let closing = transport.close();
            let closed = match self.timeout {
                Some(timeout) => time::timeout(timeout, closing)
                    .await
                    .unwrap_or_else(|_| Err(anyhow!("close timed out after {timeout:?}"))),
                None => closing.await,
            };
            if let Err(err) = closed {
                warn!(target = %self.target, "failed to close transport cleanly: {err:#}");
            }
        }

        self.shared.state.send_replace(ConnectionState::Closed);
        info!(target = %self.target, "connection closed");
        self.shared.publish(ConnectionEvent::Closed);
    }
}

impl<K: Connector> Drop for ConnectionManager<K> {
    fn drop(&mut self) {
        if let Ok(mut link) = self.shared.link.try_lock() {
            if let Some(link) = link.take() {
                link.reader.abort();
            }
        }
        self.shared
            .dispatcher
            .pending()
            .drain(|| CallFailure::ConnectionClosed);
    }
}

async fn read_loop(shared: Arc<Shared>, transport: Arc<dyn Transport>) {
    loop {
        match transport.receive().await {
            Ok(message) => {
                if let Err(err) = shared.dispatcher.receive(&message) {
                    warn!("dropping inbound frame: {err}");
                    shared.publish(ConnectionEvent::ProtocolError(err));
                }
            }
            Err(err) => {
                shared.connection_lost(&transport, err).await;
                return;
            }
        }
    }
}

fn not_open(method: &str, params: Vec<Value>) -> CallError {
    CallError::new(
        Arc::new(CallTemplate::new(method, params)),
        CallFailure::NotOpen,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel::{ChannelConnector, ChannelTransport, channel_transport_pair};
    use crate::transport::TransportMessage;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::error::Error as _;

    fn target() -> Url {
        Url::parse("ws://127.0.0.1:9000").unwrap()
    }

    fn connected(timeout: Option<Duration>) -> (ConnectionManager<ChannelConnector>, ChannelTransport) {
        let (client, server) = channel_transport_pair(16);
        let manager = ConnectionManager::new(target(), timeout, ChannelConnector::new(client));
        (manager, server)
    }

    fn text(value: Value) -> TransportMessage {
        TransportMessage::Text(serde_json::to_vec(&value).unwrap())
    }

    struct Rejecting;

    #[async_trait]
    impl Connector for Rejecting {
        type Transport = ChannelTransport;

        async fn open(&self, _target: &Url) -> OpenOutcome<ChannelTransport> {
            OpenOutcome::UnexpectedResponse {
                status: 400,
                status_text: "Bad Request".into(),
            }
        }
    }

    struct Failing;

    #[async_trait]
    impl Connector for Failing {
        type Transport = ChannelTransport;

        async fn open(&self, _target: &Url) -> OpenOutcome<ChannelTransport> {
            OpenOutcome::Failed(anyhow!("connection refused"))
        }
    }

    struct Hanging;

    #[async_trait]
    impl Connector for Hanging {
        type Transport = ChannelTransport;

        async fn open(&self, _target: &Url) -> OpenOutcome<ChannelTransport> {
            futures::future::pending().await
        }
    }

    /// Accepts every frame and never answers.
    struct SilentTransport;

    #[async_trait]
    impl Transport for SilentTransport {
        async fn send(&self, _msg: &TransportMessage) -> anyhow::Result<()> {
            Ok(())
        }

        async fn receive(&self) -> anyhow::Result<TransportMessage> {
            futures::future::pending().await
        }
    }

    struct Silent;

    #[async_trait]
    impl Connector for Silent {
        type Transport = SilentTransport;

        async fn open(&self, _target: &Url) -> OpenOutcome<SilentTransport> {
            OpenOutcome::Opened(SilentTransport)
        }
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let (manager, _server) = connected(None);
        let mut events = manager.events();

        assert_eq!(manager.state(), ConnectionState::Closed);
        manager.open().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Open);
        assert!(manager.transport().await.is_some());
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Opened);

        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.transport().await.is_none());
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed);
    }

    #[tokio::test]
    async fn test_second_open_is_rejected() {
        let (manager, _server) = connected(None);
        manager.open().await.unwrap();

        let err = manager.open().await.unwrap_err();
        assert!(matches!(err.cause(), OpenFailure::AlreadyActive));
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (manager, _server) = connected(None);

        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);

        manager.open().await.unwrap();
        manager.close().await;
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_unexpected_response() {
        let manager = ConnectionManager::new(target(), None, Rejecting);

        let err = manager.open().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to open connection to ws://127.0.0.1:9000/"
        );
        assert_eq!(
            err.source().unwrap().to_string(),
            "-32000 - Unexpected response: 400 - Bad Request"
        );
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let manager = ConnectionManager::new(target(), None, Failing);

        let err = manager.open().await.unwrap_err();
        let OpenFailure::Rpc(rpc) = err.cause() else {
            panic!("unexpected cause {:?}", err.cause());
        };
        assert_eq!(rpc.code(), -32603);
        assert_eq!(rpc.source().unwrap().to_string(), "connection refused");
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout() {
        let manager = ConnectionManager::new(target(), Some(Duration::from_millis(5)), Hanging);

        let err = manager.open().await.unwrap_err();
        assert_eq!(err.cause().to_string(), "Connection timed out after 5ms");
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_abandoned_open_resets_state() {
        let manager = ConnectionManager::new(target(), None, Hanging);

        let attempt = manager.open();
        assert!(
            time::timeout(Duration::from_millis(10), attempt)
                .await
                .is_err()
        );
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_disconnect_drains_calls() {
        let (manager, server) = connected(None);
        let mut events = manager.events();
        manager.open().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Opened);

        let response = manager.call("hello", vec![json!("world")], None).await.unwrap();
        server.receive().await.unwrap();

        drop(server);

        let err = response.await.unwrap_err();
        assert_eq!(err.cause().to_string(), "Connection closed.");
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Lost(_)));
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.transport().await.is_none());
    }

    #[tokio::test]
    async fn test_close_drains_calls() {
        let (manager, _server) = connected(None);
        manager.open().await.unwrap();

        let response = manager.call("slow", vec![], None).await.unwrap();

        manager.close().await;

        let err = response.await.unwrap_err();
        assert_eq!(err.to_string(), "slow() failed.");
        assert_eq!(err.cause().to_string(), "Connection closed.");
    }

    #[tokio::test]
    async fn test_frames_are_routed() {
        let (manager, server) = connected(None);
        manager.open().await.unwrap();

        let response = manager.call("hello", vec![json!("world")], None).await.unwrap();
        let request: Value =
            serde_json::from_slice(server.receive().await.unwrap().as_bytes()).unwrap();

        server
            .send(&text(json!({"jsonrpc": "2.0", "id": request["id"], "result": "Hello world!"})))
            .await
            .unwrap();

        assert_eq!(response.await.unwrap().result, json!("Hello world!"));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_reported() {
        let (manager, server) = connected(None);
        let mut events = manager.events();
        manager.open().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Opened);

        server
            .send(&TransportMessage::Text(b"not json".to_vec()))
            .await
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::ProtocolError(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_call_racing_close_is_settled() {
        let manager = Arc::new(ConnectionManager::new(target(), None, Silent));

        for _ in 0..2000 {
            manager.open().await.unwrap();
            let caller = manager.clone();
            let call = tokio::spawn(async move {
                caller.call("ping", vec![], None).await?.await.map(|_| ())
            });
            manager.close().await;

            let outcome = time::timeout(Duration::from_secs(1), call)
                .await
                .expect("call outlived close")
                .unwrap();
            let err = outcome.unwrap_err();
            assert!(matches!(
                err.cause(),
                CallFailure::ConnectionClosed | CallFailure::NotOpen
            ));
        }
        assert!(manager.dispatcher().pending().is_empty());
    }

    #[tokio::test]
    async fn test_stale_reader_leaves_new_link_alone() {
        let manager = ConnectionManager::new(target(), None, Silent);
        let mut events = manager.events();

        manager.open().await.unwrap();
        let stale = manager.transport().await.unwrap();
        manager.close().await;
        manager.open().await.unwrap();
        let live = manager.transport().await.unwrap();

        let response = manager.call("ping", vec![], None).await.unwrap();
        manager
            .shared
            .connection_lost(&stale, anyhow!("old socket reset"))
            .await;

        assert_eq!(manager.state(), ConnectionState::Open);
        let current = manager.transport().await.unwrap();
        assert!(Arc::ptr_eq(&current, &live));
        assert!(manager.dispatcher().pending().contains(response.id()));

        let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(
            seen,
            vec![
                ConnectionEvent::Opened,
                ConnectionEvent::Closed,
                ConnectionEvent::Opened
            ]
        );
    }
}
