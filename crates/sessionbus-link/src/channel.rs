//! Correlated request/response channel.
//!
//! Implements the multiplexing layer on top of a [`Link`]:
//! - Generates a unique correlation id per request
//! - Parks each caller on a pending slot until its own response arrives
//! - Bounds the requests in flight; excess callers queue on a semaphore
//! - Fails every pending slot with a definitive error on close or link loss
//!
//! # Message Flow
//!
//! 1. Caller invokes `request()` (or `start()`) with a typed body
//! 2. A permit is taken, an id generated and a slot registered
//! 3. The frame goes out through the link sender
//! 4. The dispatch loop reads inbound frames and resolves slots by id
//! 5. The caller's future completes with its own response

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use sessionbus_core::{
    ClientSettings, Error, Link, LinkFactory, LinkSender, Result,
    protocol::{RequestBody, RequestFrame, ResponseBody, ResponseFrame},
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::pending::PendingTable;

fn channel_closed(operation: &str) -> Error {
    Error::Communication(format!("{operation} abandoned: request channel closed"))
}

fn timed_out(operation: &str, timeout: Duration) -> Error {
    Error::Timeout(format!("{operation} did not complete within {timeout:?}"))
}

/// Request/response channel bound to one entity link.
///
/// Thread-safe; share it behind an `Arc` and issue requests concurrently.
pub struct RequestResponseChannel {
    entity_path: String,
    next_id: AtomicU64,
    pending: Arc<PendingTable>,
    sender: Box<dyn LinkSender>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    closing: AtomicBool,
}

impl RequestResponseChannel {
    /// Open a link through `factory` and start dispatching its responses.
    ///
    /// # Errors
    /// Returns the factory's error if the link cannot be opened.
    pub async fn open(
        factory: &dyn LinkFactory,
        entity_path: &str,
        settings: &ClientSettings,
    ) -> Result<Self> {
        let link = factory.open_link(entity_path, settings).await?;
        tracing::debug!(entity_path, "request/response link opened");
        Ok(Self::from_link(
            entity_path,
            link,
            settings.max_in_flight_requests,
        ))
    }

    /// Wrap an already-open link. Must be called within a Tokio runtime.
    #[must_use]
    pub fn from_link(entity_path: &str, link: Link, max_in_flight: usize) -> Self {
        let pending = Arc::new(PendingTable::new());
        let shutdown = CancellationToken::new();

        tokio::spawn(dispatch_loop(
            entity_path.to_string(),
            link.inbound,
            Arc::clone(&pending),
            shutdown.clone(),
        ));

        Self {
            entity_path: entity_path.to_string(),
            next_id: AtomicU64::new(0),
            pending,
            sender: link.sender,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            shutdown,
            closing: AtomicBool::new(false),
        }
    }

    /// Entity this channel is bound to.
    #[must_use]
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// Whether the channel was closed locally or lost its link.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and return a future for its response.
    ///
    /// Waits for an in-flight permit first. The returned future has no
    /// deadline of its own; dropping it abandons the request.
    ///
    /// # Errors
    /// Returns an error if the channel is closed or the link rejects the frame.
    pub async fn start(&self, body: RequestBody) -> Result<PendingResponse> {
        let operation = body.operation();
        if self.is_closed() {
            return Err(channel_closed(operation));
        }

        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| channel_closed(operation))?
            }
            () = self.shutdown.cancelled() => return Err(channel_closed(operation)),
        };

        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(correlation_id)?;
        let response = PendingResponse {
            correlation_id,
            operation,
            rx,
            pending: Arc::clone(&self.pending),
            _permit: permit,
        };

        // A close that raced the registration has already drained the table.
        if self.is_closed() {
            return Err(channel_closed(operation));
        }

        tracing::trace!(
            entity_path = %self.entity_path,
            correlation_id,
            operation,
            "sending request"
        );
        self.sender
            .send(RequestFrame {
                correlation_id,
                body,
            })
            .await?;

        Ok(response)
    }

    /// Send a request and wait for its response, bounded by `timeout`.
    ///
    /// # Errors
    /// Returns `Error::Timeout` when the deadline passes (including time spent
    /// queued for a permit), or the broker's error for this request.
    pub async fn request(&self, body: RequestBody, timeout: Duration) -> Result<ResponseBody> {
        let operation = body.operation();
        let deadline = Instant::now() + timeout;

        let pending = tokio::time::timeout_at(deadline, self.start(body))
            .await
            .map_err(|_| timed_out(operation, timeout))??;

        tokio::time::timeout_at(deadline, pending)
            .await
            .map_err(|_| timed_out(operation, timeout))?
    }

    /// Fail every pending request with an error built by `make_error`.
    ///
    /// The channel stays open for new requests.
    pub fn fail_pending(&self, make_error: impl Fn() -> Error) -> usize {
        self.pending.fail_all(make_error)
    }

    /// Close the channel. Idempotent.
    ///
    /// Pending requests and callers queued for a permit resolve with the
    /// error built by `make_error`; the link is closed afterwards.
    pub async fn close(&self, make_error: impl Fn() -> Error) {
        if self.shut_down(make_error) {
            self.sender.close().await;
        }
    }

    fn shut_down(&self, make_error: impl Fn() -> Error) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.cancel();
        self.permits.close();
        let failed = self.pending.fail_all(make_error);
        tracing::debug!(
            entity_path = %self.entity_path,
            failed,
            "request/response channel closed"
        );
        true
    }
}

impl Drop for RequestResponseChannel {
    fn drop(&mut self) {
        self.shut_down(|| Error::Communication("request channel dropped".to_string()));
    }
}

/// Future for the response to one request.
///
/// Dropping it before completion removes its pending slot, so a late
/// response is discarded by the dispatcher.
pub struct PendingResponse {
    correlation_id: u64,
    operation: &'static str,
    rx: oneshot::Receiver<Result<ResponseBody>>,
    pending: Arc<PendingTable>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("correlation_id", &self.correlation_id)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

impl PendingResponse {
    /// Correlation id of the request.
    #[must_use]
    pub const fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Operation name of the request.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        self.operation
    }
}

impl Future for PendingResponse {
    type Output = Result<ResponseBody>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let operation = self.operation;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(channel_closed(operation))))
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.pending.cancel(self.correlation_id);
    }
}

async fn dispatch_loop(
    entity_path: String,
    mut inbound: mpsc::UnboundedReceiver<ResponseFrame>,
    pending: Arc<PendingTable>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = inbound.recv() => frame,
            () = shutdown.cancelled() => return,
        };
        let Some(frame) = frame else { break };

        let correlation_id = frame.correlation_id;
        if !pending.resolve(correlation_id, frame.into_result()) {
            tracing::debug!(
                %entity_path,
                correlation_id,
                "discarding response with no pending request"
            );
        }
    }

    shutdown.cancel();
    let failed = pending.fail_all(|| Error::Communication("link closed by remote".to_string()));
    tracing::warn!(%entity_path, failed, "link closed by remote");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use sessionbus_core::protocol::{ErrorCondition, ErrorPayload};
    use tokio_test::{assert_pending, assert_ready};

    use super::*;
    use crate::fake::FakeLinkBuilder;

    fn renew(session_id: &str) -> RequestBody {
        RequestBody::RenewSessionLock {
            session_id: session_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_request_response() {
        let (link, mut controller) = FakeLinkBuilder::new().build();
        let channel = Arc::new(RequestResponseChannel::from_link("orders", link, 16));

        let task = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.request(renew("s-1"), Duration::from_secs(5)).await }
        });

        let sent = controller.next_request().await.unwrap();
        assert_eq!(sent.body.operation(), "renew_session_lock");
        let locked_until = Utc::now();
        controller.inject_response(sent.correlation_id, ResponseBody::LockRenewed { locked_until });

        match task.await.unwrap().unwrap() {
            ResponseBody::LockRenewed { locked_until: got } => assert_eq!(got, locked_until),
            other => panic!("Expected LockRenewed, got {other:?}"),
        }
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (link, mut controller) = FakeLinkBuilder::new().build();
        let channel = RequestResponseChannel::from_link("orders", link, 16);

        let first = channel.start(renew("a")).await.unwrap();
        let second = channel.start(renew("b")).await.unwrap();
        let third = channel.start(renew("c")).await.unwrap();

        let ids: Vec<u64> = [&first, &second, &third]
            .iter()
            .map(|p| p.correlation_id())
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        let _ = controller.take_sent();

        controller.inject_response(2, ResponseBody::SessionState { state: Some(b"c".to_vec()) });
        controller.inject_response(0, ResponseBody::SessionState { state: Some(b"a".to_vec()) });
        controller.inject_response(1, ResponseBody::SessionState { state: Some(b"b".to_vec()) });

        for (pending, expected) in [(first, b"a"), (second, b"b"), (third, b"c")] {
            match pending.await.unwrap() {
                ResponseBody::SessionState { state } => {
                    assert_eq!(state.as_deref(), Some(&expected[..]));
                }
                other => panic!("Expected SessionState, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_error_frames_map_to_errors() {
        let (link, mut controller) = FakeLinkBuilder::new().build();
        let channel = RequestResponseChannel::from_link("orders", link, 16);

        let pending = channel.start(renew("s-1")).await.unwrap();
        let sent = controller.next_request().await.unwrap();
        controller.inject_error(
            sent.correlation_id,
            ErrorPayload::new(ErrorCondition::SessionLockLost, "lock expired").in_session("s-1"),
        );

        let err = pending.await.unwrap_err();
        assert!(err.is_session_lock_lost());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_late_response() {
        let (link, mut controller) = FakeLinkBuilder::new().build();
        let channel = RequestResponseChannel::from_link("orders", link, 16);

        let err = channel
            .request(renew("s-1"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(channel.pending_count(), 0);

        // The late response finds no slot and is dropped.
        let sent = controller.next_request().await.unwrap();
        controller.inject_response(sent.correlation_id, ResponseBody::Ack);
        tokio::task::yield_now().await;
        assert_eq!(channel.pending_count(), 0);
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_is_idempotent() {
        let (link, controller) = FakeLinkBuilder::new().build();
        let channel = RequestResponseChannel::from_link("orders", link, 16);

        let pending = channel.start(renew("s-1")).await.unwrap();
        channel
            .close(|| Error::InvalidOperation("closed by test".into()))
            .await;
        channel.close(|| unreachable!("second close must not fail anything")).await;

        assert!(matches!(pending.await, Err(Error::InvalidOperation(_))));
        assert!(channel.is_closed());
        assert!(controller.is_closed());
        assert!(channel.start(renew("s-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_remote_close_fails_pending() {
        let (link, controller) = FakeLinkBuilder::new().build();
        let channel = RequestResponseChannel::from_link("orders", link, 16);

        let pending = channel.start(renew("s-1")).await.unwrap();
        controller.close_remote();

        assert!(matches!(pending.await, Err(Error::Communication(_))));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_in_flight_bound_queues_excess_requests() {
        let (link, mut controller) = FakeLinkBuilder::new().build();
        let channel = RequestResponseChannel::from_link("orders", link, 2);

        let first = channel.start(renew("s")).await.unwrap();
        let _second = channel.start(renew("s")).await.unwrap();

        let mut third = tokio_test::task::spawn(channel.start(renew("s")));
        assert_pending!(third.poll());

        let sent = controller.take_sent();
        assert_eq!(sent.len(), 2);
        controller.inject_response(sent[0].correlation_id, ResponseBody::Ack);
        assert!(matches!(first.await, Ok(ResponseBody::Ack)));

        // The first permit is released; the queued request goes out.
        assert!(third.is_woken());
        let third = assert_ready!(third.poll()).unwrap();
        assert_eq!(third.correlation_id(), 2);
    }

    #[tokio::test]
    async fn test_many_concurrent_requests() {
        let (link, mut controller) = FakeLinkBuilder::new().build();
        let channel = Arc::new(RequestResponseChannel::from_link("orders", link, 64));

        let responder = tokio::spawn(async move {
            let mut answered = 0;
            while let Some(frame) = controller.next_request().await {
                let id = i64::try_from(frame.correlation_id).unwrap();
                controller.inject_response(
                    frame.correlation_id,
                    ResponseBody::LockRenewed {
                        locked_until: chrono::DateTime::from_timestamp(id, 0).unwrap(),
                    },
                );
                answered += 1;
                if answered == 500 {
                    break;
                }
            }
            answered
        });

        let requests = (0..500).map(|_| {
            let channel = Arc::clone(&channel);
            async move { channel.request(renew("s"), Duration::from_secs(30)).await }
        });
        let results = futures::future::join_all(requests).await;

        assert_eq!(responder.await.unwrap(), 500);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(channel.pending_count(), 0);
    }
}
