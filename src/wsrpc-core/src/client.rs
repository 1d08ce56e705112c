use crate::config::ClientOptions;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::emitter::SubscriptionId;
use crate::error::{CallError, CallFailure, ConnectionError, InvalidTarget};
use crate::message::{Extra, Notification, Reply};
use crate::pending::PendingResponse;
use crate::transport::Connector;
use crate::transport::websocket::WebSocketConnector;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::{broadcast, watch};
use url::Url;

/// JSON-RPC 2.0 client over a single connection.
///
/// ```no_run
/// # async fn run() -> anyhow::Result<()> {
/// use wsrpc_core::{ClientOptions, JsonRpcClient};
/// use serde_json::json;
///
/// let target = url::Url::parse("ws://127.0.0.1:9000")?;
/// let client = JsonRpcClient::new(target, ClientOptions::new())?;
/// client.open().await?;
/// let greeting = client.call("hello", vec![json!("world")], None).await?;
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub struct JsonRpcClient<K: Connector = WebSocketConnector> {
    connection: ConnectionManager<K>,
}

impl JsonRpcClient<WebSocketConnector> {
    pub fn new(target: Url, options: ClientOptions) -> Result<Self, InvalidTarget> {
        WebSocketConnector::check_target(&target)?;
        Ok(Self::with_connector(
            target,
            options,
            WebSocketConnector::new(),
        ))
    }

    /// Open a client, run `body` against it and close it again, however
    /// `body` ends. A panic in `body` is resumed after the client is closed.
    pub async fn scoped<T, E, F>(target: Url, options: ClientOptions, body: F) -> Result<T, E>
    where
        E: From<InvalidTarget> + From<ConnectionError>,
        F: AsyncFnOnce(&Self) -> Result<T, E>,
    {
        Self::new(target, options)?.scope(body).await
    }
}

impl<K: Connector> JsonRpcClient<K> {
    pub fn with_connector(target: Url, options: ClientOptions, connector: K) -> Self {
        Self {
            connection: ConnectionManager::new(target, options.timeout(), connector),
        }
    }

    pub fn target(&self) -> &Url {
        self.connection.target()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_changes()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.events()
    }

    pub fn pending_calls(&self) -> usize {
        self.connection.dispatcher().pending().len()
    }

    pub async fn open(&self) -> Result<(), ConnectionError> {
        self.connection.open().await
    }

    pub async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        extra: Option<Extra>,
    ) -> Result<Value, CallError> {
        Ok(self.call_reply(method, params, extra).await?.result)
    }

    pub async fn call_reply(
        &self,
        method: &str,
        params: Vec<Value>,
        extra: Option<Extra>,
    ) -> Result<Reply, CallError> {
        self.start_call(method, params, extra).await?.await
    }

    pub async fn call_as<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
        extra: Option<Extra>,
    ) -> Result<R, CallError> {
        let response = self.start_call(method, params, extra).await?;
        let call = response.call().clone();
        let reply = response.await?;
        serde_json::from_value(reply.result)
            .map_err(|err| CallError::new(call, CallFailure::InvalidResult(err)))
    }

    async fn start_call(
        &self,
        method: &str,
        params: Vec<Value>,
        extra: Option<Extra>,
    ) -> Result<PendingResponse, CallError> {
        self.connection.call(method, params, extra).await
    }

    pub async fn notify(
        &self,
        method: &str,
        params: Vec<Value>,
        extra: Option<Extra>,
    ) -> Result<(), CallError> {
        self.connection.notify(method, params, extra).await
    }

    pub fn on<F>(&self, method: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.connection
            .dispatcher()
            .notifications()
            .subscribe(method, handler)
    }

    pub fn once<F>(&self, method: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.connection
            .dispatcher()
            .notifications()
            .subscribe_once(method, handler)
    }

    pub fn off(&self, method: &str, id: SubscriptionId) -> bool {
        self.connection
            .dispatcher()
            .notifications()
            .unsubscribe(method, id)
    }

    pub fn listener_count(&self, method: &str) -> usize {
        self.connection
            .dispatcher()
            .notifications()
            .listener_count(method)
    }

    pub async fn close(&self) {
        self.connection.close().await
    }

    pub async fn dispose(&self) {
        self.close().await
    }

    pub async fn scope<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: From<ConnectionError>,
        F: AsyncFnOnce(&Self) -> Result<T, E>,
    {
        self.open().await?;
        let outcome = AssertUnwindSafe(body(self)).catch_unwind().await;
        self.close().await;
        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl<K: Connector> fmt::Display for JsonRpcClient<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsonRpcClient<{}>", self.target())
    }
}
