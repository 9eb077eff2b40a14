//! Fake link for unit testing correlation and dispatch.
//!
//! The controller sees every frame the channel sends and injects responses.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use sessionbus_core::{
    Error, Link, LinkSender, Result,
    protocol::{ErrorPayload, RequestFrame, ResponseBody, ResponseFrame},
};
use tokio::sync::mpsc;

/// Builder for fake links.
pub struct FakeLinkBuilder;

impl FakeLinkBuilder {
    pub const fn new() -> Self {
        Self
    }

    /// Build the link and its controller.
    pub fn build(self) -> (Link, FakeLinkController) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let link = Link {
            sender: Box::new(FakeLinkSender {
                sent: sent_tx,
                closed: Arc::clone(&closed),
            }),
            inbound: inbound_rx,
        };

        let controller = FakeLinkController {
            inbound: Mutex::new(Some(inbound_tx)),
            sent: sent_rx,
            closed,
        };

        (link, controller)
    }
}

/// Controller for injecting responses and inspecting sent frames.
pub struct FakeLinkController {
    inbound: Mutex<Option<mpsc::UnboundedSender<ResponseFrame>>>,
    sent: mpsc::UnboundedReceiver<RequestFrame>,
    closed: Arc<AtomicBool>,
}

impl FakeLinkController {
    /// Inject a raw frame.
    pub fn inject(&self, frame: ResponseFrame) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    /// Inject a successful response.
    pub fn inject_response(&self, correlation_id: u64, body: ResponseBody) {
        self.inject(ResponseFrame::from_outcome(correlation_id, Ok(body)));
    }

    /// Inject an error response.
    pub fn inject_error(&self, correlation_id: u64, error: ErrorPayload) {
        self.inject(ResponseFrame::from_outcome(correlation_id, Err(error)));
    }

    /// Wait for the next frame the channel sends.
    pub async fn next_request(&mut self) -> Option<RequestFrame> {
        self.sent.recv().await
    }

    /// Take every frame sent so far.
    pub fn take_sent(&mut self) -> Vec<RequestFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Simulate the remote side closing the link.
    pub fn close_remote(&self) {
        self.inbound.lock().take();
    }

    /// Whether the channel closed its sender.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct FakeLinkSender {
    sent: mpsc::UnboundedSender<RequestFrame>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl LinkSender for FakeLinkSender {
    async fn send(&self, frame: RequestFrame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Communication("fake link closed".to_string()));
        }
        self.sent
            .send(frame)
            .map_err(|_| Error::Communication("fake controller dropped".to_string()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
