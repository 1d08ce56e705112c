use crate::config::as_millis;
use crate::error::{CallError, CallFailure, CallTemplate};
use crate::message::{Reply, RequestId};
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

type Outcome = Result<Reply, CallError>;
type Entries = DashMap<RequestId, PendingRequest>;

struct PendingRequest {
    created_at: Instant,
    call: Arc<CallTemplate>,
    settle: oneshot::Sender<Outcome>,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn settle(self, outcome: Result<Reply, CallFailure>) {
        let PendingRequest {
            created_at,
            call,
            settle,
            timer,
        } = self;

        if let Some(timer) = timer {
            timer.abort();
        }

        trace!(
            method = %call.method,
            elapsed = ?created_at.elapsed(),
            ok = outcome.is_ok(),
            "settling request"
        );

        // the caller may have stopped waiting
        let _ = settle.send(outcome.map_err(|cause| CallError::new(call, cause)));
    }
}

/// Outstanding calls by id. Whoever removes an entry first settles it.
pub struct PendingRequests {
    next_id: AtomicU64,
    entries: Arc<Entries>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn create(
        &self,
        call: CallTemplate,
        timeout: Option<Duration>,
    ) -> (RequestId, PendingResponse) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let call = Arc::new(call);
        let (tx, rx) = oneshot::channel();

        self.entries.insert(
            id,
            PendingRequest {
                created_at: Instant::now(),
                call: call.clone(),
                settle: tx,
                timer: None,
            },
        );

        if let Some(timeout) = timeout {
            let timer = tokio::spawn(expire(Arc::downgrade(&self.entries), id, timeout));
            match self.entries.get_mut(&id) {
                Some(mut entry) => entry.timer = Some(timer),
                // settled before the timer could be attached
                None => timer.abort(),
            }
        }

        let response = PendingResponse {
            id,
            call,
            rx,
            entries: Arc::downgrade(&self.entries),
            done: false,
        };

        (id, response)
    }

    pub fn resolve(&self, id: RequestId, reply: Reply) -> bool {
        match self.entries.remove(&id) {
            Some((_, pending)) => {
                pending.settle(Ok(reply));
                true
            }
            None => false,
        }
    }

    pub fn reject(&self, id: RequestId, failure: CallFailure) -> bool {
        match self.entries.remove(&id) {
            Some((_, pending)) => {
                pending.settle(Err(failure));
                true
            }
            None => false,
        }
    }

    pub fn drain(&self, failure: impl Fn() -> CallFailure) -> usize {
        let ids: Vec<RequestId> = self.entries.iter().map(|e| *e.key()).collect();
        let mut drained = 0;
        for id in ids {
            if self.reject(id, failure()) {
                drained += 1;
            }
        }
        if drained > 0 {
            debug!(drained, "rejected outstanding requests");
        }
        drained
    }

    pub fn dispose(&self) -> usize {
        self.drain(|| CallFailure::Disposed)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for PendingRequests {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn expire(entries: Weak<Entries>, id: RequestId, timeout: Duration) {
    time::sleep(timeout).await;

    let Some(entries) = entries.upgrade() else {
        return;
    };
    if let Some((_, mut pending)) = entries.remove(&id) {
        debug!(id, method = %pending.call.method, ?timeout, "request timed out");
        // this task is the timer; nothing left to cancel
        pending.timer = None;
        pending.settle(Err(CallFailure::TimedOut(as_millis(timeout))));
    }
}

/// Eventual outcome of a call created by [`PendingRequests::create`].
///
/// Dropping it before it completes withdraws the call from the registry, so
/// abandoned calls do not linger until their timeout.
pub struct PendingResponse {
    id: RequestId,
    call: Arc<CallTemplate>,
    rx: oneshot::Receiver<Outcome>,
    entries: Weak<Entries>,
    done: bool,
}

impl PendingResponse {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn call(&self) -> &Arc<CallTemplate> {
        &self.call
    }
}

impl Future for PendingResponse {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            Poll::Ready(Err(_)) => Err(CallError::new(self.call.clone(), CallFailure::Disposed)),
        };
        self.done = true;
        Poll::Ready(outcome)
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(entries) = self.entries.upgrade() {
            if let Some((_, pending)) = entries.remove(&self.id) {
                trace!(id = self.id, "caller gave up on request");
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
            }
        }
    }
}
