use crate::codec::Codec;
use crate::codec::json::JsonCodec;
use crate::emitter::NotificationEmitter;
use crate::error::{CallError, CallFailure, CallTemplate, ProtocolError, TransportError};
use crate::message::{
    Extra, InboundFrame, OutgoingMessage, Reply, RequestId, ResponseFrame, ResponseOutcome,
};
use crate::pending::{PendingRequests, PendingResponse};
use crate::transport::{Transport, TransportMessage};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Response {
        id: Option<RequestId>,
        matched: bool,
    },
    Notification {
        method: String,
        delivered: usize,
    },
}

/// Encodes outgoing calls and routes inbound frames to the pending call
/// they answer or to notification subscribers.
pub struct MessageDispatcher<C: Codec = JsonCodec> {
    codec: C,
    pending: PendingRequests,
    notifications: NotificationEmitter,
    timeout: Option<Duration>,
}

impl MessageDispatcher<JsonCodec> {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self::with_codec(JsonCodec::new(), timeout)
    }
}

impl<C: Codec> MessageDispatcher<C> {
    pub fn with_codec(codec: C, timeout: Option<Duration>) -> Self {
        Self {
            codec,
            pending: PendingRequests::new(),
            notifications: NotificationEmitter::new(),
            timeout,
        }
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn notifications(&self) -> &NotificationEmitter {
        &self.notifications
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Register a call and write it to `transport`.
    ///
    /// The call is registered before the frame is written, so a response that
    /// races the write still finds it. Encode and send failures settle the
    /// returned future instead of being returned here.
    pub async fn send_call(
        &self,
        transport: &dyn Transport,
        method: &str,
        params: Vec<Value>,
        extra: Option<Extra>,
    ) -> PendingResponse {
        let (id, response) = self
            .pending
            .create(CallTemplate::new(method, params), self.timeout);
        let call = response.call().clone();

        let message = OutgoingMessage::call(id, &call.method, &call.params, extra.as_ref());
        let request = match serde_json::to_value(message) {
            Ok(request) => request,
            Err(err) => {
                self.pending.reject(id, CallFailure::Encode(err.into()));
                return response;
            }
        };
        let data = match self.codec.encode(&request) {
            Ok(data) => data,
            Err(err) => {
                self.pending.reject(id, CallFailure::Encode(err));
                return response;
            }
        };

        trace!(id, method, "sending request");
        if let Err(err) = transport.send(&TransportMessage::Text(data)).await {
            debug!(id, method, "failed to send request: {err}");
            self.pending.reject(
                id,
                CallFailure::Transport(TransportError::new(request, err)),
            );
        }

        response
    }

    pub async fn send_notification(
        &self,
        transport: &dyn Transport,
        method: &str,
        params: Vec<Value>,
        extra: Option<Extra>,
    ) -> Result<(), CallError> {
        let message = OutgoingMessage::notification(method, &params, extra.as_ref());
        let encoded = serde_json::to_value(message)
            .map_err(anyhow::Error::from)
            .and_then(|request| Ok((self.codec.encode(&request)?, request)));

        let failure = match encoded {
            Ok((data, request)) => {
                trace!(method, "sending notification");
                match transport.send(&TransportMessage::Text(data)).await {
                    Ok(()) => return Ok(()),
                    Err(err) => CallFailure::Transport(TransportError::new(request, err)),
                }
            }
            Err(err) => CallFailure::Encode(err),
        };

        Err(CallError::new(
            Arc::new(CallTemplate::new(method, params)),
            failure,
        ))
    }

    pub fn receive(&self, message: &TransportMessage) -> Result<Routed, ProtocolError> {
        let value: Value = self
            .codec
            .decode(message.as_bytes())
            .map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;

        match InboundFrame::from_value(value)? {
            InboundFrame::Response(response) => Ok(self.settle(response)),
            InboundFrame::Notification(notification) => {
                trace!(method = %notification.method, "received notification");
                let delivered = self.notifications.emit(&notification);
                Ok(Routed::Notification {
                    method: notification.method,
                    delivered,
                })
            }
        }
    }

    fn settle(&self, response: ResponseFrame) -> Routed {
        let id = response.request_id();
        let matched = match id {
            Some(id) => match response.outcome {
                ResponseOutcome::Result(result) => self.pending.resolve(
                    id,
                    Reply {
                        result,
                        extra: response.extra,
                    },
                ),
                ResponseOutcome::Error(err) => {
                    self.pending.reject(id, CallFailure::Application(err))
                }
            },
            None => false,
        };

        if !matched {
            warn!(id = %response_id_for_log(id), "response does not match any pending request");
        }

        Routed::Response { id, matched }
    }
}

fn response_id_for_log(id: Option<RequestId>) -> String {
    id.map_or_else(|| "null".to_string(), |id| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel::{ChannelTransport, channel_transport_pair};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn read_json(peer: &ChannelTransport) -> Value {
        let message = peer.receive().await.unwrap();
        serde_json::from_slice(message.as_bytes()).unwrap()
    }

    fn text(value: Value) -> TransportMessage {
        TransportMessage::Text(serde_json::to_vec(&value).unwrap())
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let dispatcher = MessageDispatcher::new(None);
        let (client, server) = channel_transport_pair(4);

        let response = dispatcher
            .send_call(&client, "hello", vec![json!("world")], None)
            .await;

        let request = read_json(&server).await;
        assert_eq!(
            request,
            json!({"jsonrpc": "2.0", "id": 1, "method": "hello", "params": ["world"]})
        );

        let routed = dispatcher
            .receive(&text(json!({"jsonrpc": "2.0", "id": 1, "result": "Hello world!"})))
            .unwrap();
        assert_eq!(
            routed,
            Routed::Response {
                id: Some(1),
                matched: true
            }
        );
        assert_eq!(response.await.unwrap().result, json!("Hello world!"));
    }

    #[tokio::test]
    async fn test_error_response_rejects() {
        let dispatcher = MessageDispatcher::new(None);
        let (client, server) = channel_transport_pair(4);

        let response = dispatcher.send_call(&client, "nope", vec![], None).await;
        let request = read_json(&server).await;

        dispatcher
            .receive(&text(json!({"id": request["id"], "error": {"code": -32601}})))
            .unwrap();

        let err = response.await.unwrap_err();
        assert_eq!(err.to_string(), "nope() failed.");
        assert_eq!(
            err.cause().to_string(),
            "-32601 - Server error. Requested method not found."
        );
    }

    #[tokio::test]
    async fn test_unmatched_response_is_dropped() {
        let dispatcher = MessageDispatcher::new(None);

        let routed = dispatcher
            .receive(&text(json!({"id": 0, "result": "stray"})))
            .unwrap();
        assert_eq!(
            routed,
            Routed::Response {
                id: Some(0),
                matched: false
            }
        );

        let routed = dispatcher
            .receive(&text(json!({"id": null, "error": {"code": -32700}})))
            .unwrap();
        assert_eq!(
            routed,
            Routed::Response {
                id: None,
                matched: false
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_response_is_ignored() {
        let dispatcher = MessageDispatcher::new(None);
        let (client, _server) = channel_transport_pair(4);

        let response = dispatcher.send_call(&client, "hello", vec![], None).await;
        let id = response.id();

        let first = text(json!({"id": id, "result": 1}));
        let second = text(json!({"id": id, "result": 2}));
        assert!(matches!(
            dispatcher.receive(&first),
            Ok(Routed::Response { matched: true, .. })
        ));
        assert!(matches!(
            dispatcher.receive(&second),
            Ok(Routed::Response { matched: false, .. })
        ));
        assert_eq!(response.await.unwrap().result, json!(1));
    }

    #[tokio::test]
    async fn test_notification_is_emitted() {
        let dispatcher = MessageDispatcher::new(None);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        dispatcher
            .notifications()
            .subscribe("saidHelloTo", move |n| {
                let _ = tx.send(n.clone());
            });

        let routed = dispatcher
            .receive(&text(
                json!({"jsonrpc": "2.0", "method": "saidHelloTo", "params": ["world"]}),
            ))
            .unwrap();

        assert_eq!(
            routed,
            Routed::Notification {
                method: "saidHelloTo".into(),
                delivered: 1
            }
        );
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.param(), Some(&json!("world")));
    }

    #[tokio::test]
    async fn test_notifications_and_responses_do_not_cross() {
        let dispatcher = MessageDispatcher::new(None);
        let (client, _server) = channel_transport_pair(4);
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        dispatcher.notifications().subscribe("hello", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let response = dispatcher.send_call(&client, "hello", vec![], None).await;
        let id = response.id();

        // same method name, no id: goes to the subscriber, not the call
        let routed = dispatcher
            .receive(&text(json!({"jsonrpc": "2.0", "method": "hello", "params": [id]})))
            .unwrap();
        assert_eq!(
            routed,
            Routed::Notification {
                method: "hello".into(),
                delivered: 1
            }
        );
        assert!(dispatcher.pending().contains(id));

        for frame in [
            json!({"jsonrpc": "2.0", "id": 0, "method": "hello", "result": "stray"}),
            json!({"jsonrpc": "2.0", "id": null, "method": "hello", "error": {"code": -32700}}),
        ] {
            assert!(matches!(
                dispatcher.receive(&text(frame)).unwrap(),
                Routed::Response { matched: false, .. }
            ));
        }
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert!(dispatcher.pending().contains(id));

        let routed = dispatcher
            .receive(&text(json!({"jsonrpc": "2.0", "id": id, "result": "Hello world!"})))
            .unwrap();
        assert_eq!(
            routed,
            Routed::Response {
                id: Some(id),
                matched: true
            }
        );
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(response.await.unwrap().result, json!("Hello world!"));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_protocol_errors() {
        let dispatcher = MessageDispatcher::new(None);

        assert!(matches!(
            dispatcher.receive(&TransportMessage::Text(b"{oops".to_vec())),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(
            dispatcher.receive(&text(json!("just a string"))),
            Err(ProtocolError::NotAnObject)
        );
    }

    #[tokio::test]
    async fn test_send_failure_rejects_call() {
        let dispatcher = MessageDispatcher::new(None);
        let (client, server) = channel_transport_pair(4);
        drop(server);

        let response = dispatcher
            .send_call(&client, "hello", vec![json!("world")], None)
            .await;

        let err = response.await.unwrap_err();
        assert_eq!(err.to_string(), r#"hello("world") failed."#);
        match err.cause() {
            CallFailure::Transport(transport) => {
                assert_eq!(transport.to_string(), "-32300 - Transport error.");
                assert_eq!(transport.request()["method"], "hello");
            }
            other => panic!("unexpected failure {other:?}"),
        }
        assert!(dispatcher.pending().is_empty());
    }

    #[tokio::test]
    async fn test_notification_send_failure() {
        let dispatcher = MessageDispatcher::new(None);
        let (client, _server) = channel_transport_pair(4);
        client.close().await.unwrap();

        let err = dispatcher
            .send_notification(&client, "tick", vec![json!(1)], None)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "tick(1) failed.");
        assert!(matches!(err.cause(), CallFailure::Transport(_)));
    }

    #[tokio::test]
    async fn test_extra_is_sent_and_returned() {
        let dispatcher = MessageDispatcher::new(None);
        let (client, server) = channel_transport_pair(4);
        let mut extra = Extra::new();
        extra.insert("sessionId".into(), json!(10));

        let response = dispatcher
            .send_call(&client, "hello", vec![], Some(extra.clone()))
            .await;
        let request = read_json(&server).await;
        assert_eq!(request["sessionId"], 10);

        dispatcher
            .receive(&text(json!({"id": request["id"], "result": "ok", "sessionId": 10})))
            .unwrap();

        assert_eq!(response.await.unwrap().extra, extra);
    }
}
