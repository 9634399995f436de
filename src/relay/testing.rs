//! In-process stand-ins for the upstream service and the client socket.

use crate::error::{AppError, AppResult};
use crate::relay::upstream::{UpstreamChannel, UpstreamConnector};
use crate::relay::{ClientSink, ConnectionId, RelayFrame};
use async_trait::async_trait;
use futures_util::Sink;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Upstream sink that records frames and whether it was closed.
struct FakeSink {
    frames: Option<mpsc::UnboundedSender<RelayFrame>>,
    closed: Arc<AtomicBool>,
}

impl Sink<RelayFrame> for FakeSink {
    type Error = AppError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<AppResult<()>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, frame: RelayFrame) -> AppResult<()> {
        match self.frames.as_ref() {
            Some(frames) => frames
                .send(frame)
                .map_err(|_| AppError::UpstreamRuntime("fake upstream gone".to_string())),
            None => Err(AppError::UpstreamRuntime("sink closed".to_string())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<AppResult<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<AppResult<()>> {
        self.frames = None;
        self.closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// The test's view of one upstream connection.
pub(crate) struct FakeLink {
    pub connection_id: ConnectionId,
    pub received: mpsc::UnboundedReceiver<RelayFrame>,
    pub reply: mpsc::UnboundedSender<AppResult<RelayFrame>>,
    pub closed: Arc<AtomicBool>,
}

impl FakeLink {
    pub async fn recv(&mut self) -> RelayFrame {
        tokio::time::timeout(Duration::from_secs(2), self.received.recv())
            .await
            .expect("timed out waiting for upstream frame")
            .expect("upstream channel closed")
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    pub(crate) links: Mutex<Vec<FakeLink>>,
    pub refuse: bool,
}

#[async_trait]
impl UpstreamConnector for FakeConnector {
    async fn connect(&self, connection_id: &ConnectionId) -> AppResult<UpstreamChannel> {
        if self.refuse {
            return Err(AppError::UpstreamConnect("connection refused".to_string()));
        }
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        self.links.lock().unwrap().push(FakeLink {
            connection_id: *connection_id,
            received: frames_rx,
            reply: reply_tx,
            closed: closed.clone(),
        });

        Ok(UpstreamChannel {
            sink: Box::pin(FakeSink {
                frames: Some(frames_tx),
                closed,
            }),
            stream: Box::pin(UnboundedReceiverStream::new(reply_rx)),
        })
    }

    fn name(&self) -> &str {
        "fake"
    }
}

impl FakeConnector {
    /// Wait for the link opened for `connection_id`.
    pub async fn take_link(&self, connection_id: ConnectionId) -> FakeLink {
        for _ in 0..200 {
            {
                let mut links = self.links.lock().unwrap();
                if let Some(index) = links.iter().position(|l| l.connection_id == connection_id) {
                    return links.remove(index);
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no upstream link for {}", connection_id);
    }

    /// Wait for the only link opened so far.
    pub async fn take_any_link(&self) -> FakeLink {
        for _ in 0..200 {
            if let Some(link) = self.links.lock().unwrap().pop() {
                return link;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no upstream link opened");
    }
}

/// Never finishes connecting, so sessions stay in `opening`.
pub(crate) struct StalledConnector;

#[async_trait]
impl UpstreamConnector for StalledConnector {
    async fn connect(&self, _connection_id: &ConnectionId) -> AppResult<UpstreamChannel> {
        std::future::pending().await
    }

    fn name(&self) -> &str {
        "stalled"
    }
}

#[derive(Default)]
pub(crate) struct RecordingClient {
    pub frames: Mutex<Vec<RelayFrame>>,
    pub closed: Mutex<Option<Option<String>>>,
}

impl ClientSink for RecordingClient {
    fn deliver(&self, frame: RelayFrame) {
        self.frames.lock().unwrap().push(frame);
    }

    fn close(&self, reason: Option<String>) {
        *self.closed.lock().unwrap() = Some(reason);
    }
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
