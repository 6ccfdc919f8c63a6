//! `direct-tcpip` tunnels as tokio byte streams.
//!
//! A [`TunnelStream`] is one channel seen as an `AsyncRead + AsyncWrite`
//! pair. Reads drain the CHANNEL_DATA the loop hands over; writes become
//! [`Action::ChannelInput`] on the loop's bounded queue, so a full queue
//! makes `poll_write` return `Pending`. Shutting the stream down closes the
//! channel.

use crate::ssh::channel::{ChannelContext, ChannelHandler, ChannelKey};
use crate::ssh::session::Action;
use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::PollSender;

/// Result of the open: `Err((reason, description))` on CHANNEL_OPEN_FAILURE.
pub type OpenOutcome = Result<(), (u32, String)>;

/// Channel handler feeding a [`TunnelStream`].
#[derive(Debug)]
pub struct TunnelHandler {
    opened: Option<oneshot::Sender<OpenOutcome>>,
    incoming: Option<mpsc::UnboundedSender<Bytes>>,
}

impl TunnelHandler {
    /// Creates the handler, the receiver for the open outcome and the
    /// receiver for inbound data.
    pub fn new() -> (
        Self,
        oneshot::Receiver<OpenOutcome>,
        mpsc::UnboundedReceiver<Bytes>,
    ) {
        let (opened_tx, opened_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        (
            Self {
                opened: Some(opened_tx),
                incoming: Some(data_tx),
            },
            opened_rx,
            data_rx,
        )
    }

    fn report(&mut self, outcome: OpenOutcome) {
        if let Some(opened) = self.opened.take() {
            let _ = opened.send(outcome);
        }
    }
}

impl ChannelHandler for TunnelHandler {
    fn on_open_confirmation(&mut self, _ctx: &mut ChannelContext) {
        self.report(Ok(()));
    }

    fn on_open_failure(&mut self, reason: u32, description: &str) {
        self.report(Err((reason, description.to_string())));
        self.incoming = None;
    }

    fn on_data(&mut self, _ctx: &mut ChannelContext, data: &[u8]) {
        if let Some(incoming) = &self.incoming {
            // A dropped stream just discards
            let _ = incoming.send(Bytes::copy_from_slice(data));
        }
    }

    fn on_eof(&mut self, _ctx: &mut ChannelContext) {
        self.incoming = None;
    }

    fn on_close(&mut self) {
        self.incoming = None;
    }
}

/// A byte stream through the server to a remote TCP endpoint.
pub struct TunnelStream {
    key: ChannelKey,
    alive: Arc<AtomicBool>,
    actions: PollSender<Action>,
    incoming: mpsc::UnboundedReceiver<Bytes>,
    buffered: Bytes,
    shut_down: bool,
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("key", &self.key)
            .field("buffered", &self.buffered.len())
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl TunnelStream {
    /// Wraps an opened channel.
    pub fn new(
        key: ChannelKey,
        alive: Arc<AtomicBool>,
        actions: mpsc::Sender<Action>,
        incoming: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            key,
            alive,
            actions: PollSender::new(actions),
            incoming,
            buffered: Bytes::new(),
            shut_down: false,
        }
    }

    /// Key of the underlying channel.
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    fn poll_enqueue(&mut self, cx: &mut Context<'_>, action: Action) -> Poll<io::Result<()>> {
        let reserved = ready!(self.actions.poll_reserve(cx));
        let sent = reserved.and_then(|()| self.actions.send_item(action));
        Poll::Ready(sent.map_err(|_| loop_stopped()))
    }
}

fn loop_stopped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "session loop has stopped")
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // An empty CHANNEL_DATA must not read as EOF
        while self.buffered.is_empty() {
            match ready!(self.incoming.poll_recv(cx)) {
                Some(chunk) => self.buffered = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = self.buffered.len().min(buf.remaining());
        buf.put_slice(&self.buffered[..n]);
        self.buffered.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shut_down || !self.alive.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tunnel channel is closed",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let key = self.key;
        ready!(self.poll_enqueue(
            cx,
            Action::ChannelInput {
                key,
                data: buf.to_vec(),
            }
        ))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.shut_down || !self.alive.load(Ordering::Acquire) {
            return Poll::Ready(Ok(()));
        }
        let key = self.key;
        ready!(self.poll_enqueue(cx, Action::ChannelClose { key }))?;
        self.shut_down = true;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn stream() -> (
        TunnelStream,
        TunnelHandler,
        mpsc::Receiver<Action>,
        Arc<AtomicBool>,
    ) {
        let (handler, _opened, incoming) = TunnelHandler::new();
        let (tx, rx) = mpsc::channel(4);
        let alive = Arc::new(AtomicBool::new(true));
        let key = ChannelKey {
            id: 3,
            generation: 1,
        };
        (TunnelStream::new(key, alive.clone(), tx, incoming), handler, rx, alive)
    }

    #[tokio::test]
    async fn test_reads_until_eof() {
        let (mut stream, mut handler, _rx, _alive) = stream();
        let mut ctx = ChannelContext::default();
        handler.on_data(&mut ctx, b"hello ");
        handler.on_data(&mut ctx, b"world");
        handler.on_eof(&mut ctx);

        let mut received = String::new();
        stream.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "hello world");
    }

    #[tokio::test]
    async fn test_empty_data_is_not_eof() {
        let (mut stream, mut handler, _rx, _alive) = stream();
        let mut ctx = ChannelContext::default();
        handler.on_data(&mut ctx, b"");
        handler.on_data(&mut ctx, b"after");
        handler.on_eof(&mut ctx);

        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"after");
    }

    #[tokio::test]
    async fn test_small_reads_keep_the_rest() {
        let (mut stream, mut handler, _rx, _alive) = stream();
        handler.on_data(&mut ChannelContext::default(), b"abcdef");
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[tokio::test]
    async fn test_writes_and_shutdown_become_actions() {
        let (mut stream, _handler, mut rx, _alive) = stream();
        stream.write_all(b"ping").await.unwrap();
        stream.shutdown().await.unwrap();

        match rx.recv().await.unwrap() {
            Action::ChannelInput { key, data } => {
                assert_eq!(key.id, 3);
                assert_eq!(data, b"ping");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            Action::ChannelClose { .. }
        ));
        assert!(stream.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_writes() {
        let (mut stream, _handler, _rx, alive) = stream();
        alive.store(false, Ordering::Release);
        let err = stream.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_open_outcome_is_reported() {
        let (mut handler, opened, _incoming) = TunnelHandler::new();
        handler.on_open_failure(2, "connect failed");
        assert_eq!(opened.await.unwrap(), Err((2, "connect failed".to_string())));
    }
}
