//! The session loop.
//!
//! After authentication the transport is split in two tasks:
//!
//! - a **reader** that decodes one packet at a time and queues it
//! - the **loop**, the only task that touches the writer and the channels
//!
//! The loop takes inbound packets and [`Action`]s from the application as
//! they come and runs each to completion before the next. Application calls
//! never lock anything; they enqueue an action on the bounded queue behind a
//! [`SessionHandle`], which applies backpressure when the loop falls behind.
//!
//! # Shutdown
//!
//! [`SessionHandle::close`] enqueues [`Action::Shutdown`]. The loop then
//! closes every channel, keeps serving packets and actions until the server
//! has closed them all (or a second shutdown arrives), sends DISCONNECT and
//! shuts the socket down.

pub mod action;

pub use action::{Action, OpenedChannel};

use crate::ssh::channel::Channel;
use crate::ssh::connection::channel_open;
use crate::ssh::dispatcher::Dispatcher;
use crate::ssh::handshake::disconnect_message;
use crate::ssh::message::disconnect;
use crate::ssh::packet::PacketBuilder;
use crate::ssh::transport::{eof_as_closed, PacketWriter, Transport};
use kestrel_platform::{KestrelError, KestrelResult, Logger};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Decoded packets the reader may run ahead of the loop.
const PACKET_QUEUE_CAPACITY: usize = 64;

/// Application side of a running session loop.
#[derive(Debug)]
pub struct SessionHandle {
    actions: mpsc::Sender<Action>,
    task: Option<JoinHandle<KestrelResult<()>>>,
}

impl SessionHandle {
    /// Queue for actions; clones are handed to channel handles.
    pub fn sender(&self) -> mpsc::Sender<Action> {
        self.actions.clone()
    }

    /// Enqueues `action`, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Closed`] once the loop has stopped.
    pub async fn send(&self, action: Action) -> KestrelResult<()> {
        self.actions
            .send(action)
            .await
            .map_err(|_| KestrelError::Closed)
    }

    /// Returns `true` once the loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.actions.is_closed()
    }

    /// Shuts the loop down and waits for it to finish.
    ///
    /// Returns the error that stopped the loop, if any. A second call
    /// returns `Ok(())`.
    pub async fn close(&mut self) -> KestrelResult<()> {
        // The loop may already be gone; its result tells why
        let _ = self.actions.send(Action::Shutdown).await;
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|err| KestrelError::Internal(format!("session loop panicked: {}", err)))?,
            None => Ok(()),
        }
    }
}

/// Splits an authenticated transport and starts the reader and the loop.
pub fn spawn<S>(transport: Transport<S>, action_queue_capacity: usize) -> SessionHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let logger = transport.logger().clone();
    let (mut reader, writer) = transport.into_split();

    let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);
    let reader_logger = logger.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            let packet = reader.read_packet().await;
            let failed = packet.is_err();
            if packet_tx.send(packet).await.is_err() || failed {
                break;
            }
        }
        reader_logger.debug(format_args!("reader stopped"));
    });

    let (action_tx, action_rx) = mpsc::channel(action_queue_capacity.max(1));
    let session = SessionLoop {
        writer,
        dispatcher: Dispatcher::new(logger.clone()),
        packets: packet_rx,
        actions: action_rx,
        logger,
    };
    let task = tokio::spawn(async move {
        let result = session.run().await;
        reader_task.abort();
        result
    });

    SessionHandle {
        actions: action_tx,
        task: Some(task),
    }
}

enum Event {
    Packet(Option<KestrelResult<Vec<u8>>>),
    Action(Option<Action>),
}

struct SessionLoop<W> {
    writer: PacketWriter<W>,
    dispatcher: Dispatcher,
    packets: mpsc::Receiver<KestrelResult<Vec<u8>>>,
    actions: mpsc::Receiver<Action>,
    logger: Arc<dyn Logger>,
}

impl<W: AsyncWrite + Unpin> SessionLoop<W> {
    async fn run(mut self) -> KestrelResult<()> {
        self.logger.info(format_args!("session loop started"));
        let result = loop {
            let step = match self.next_event().await {
                Event::Packet(Some(Ok(payload))) => self.handle_packet(&payload).await,
                Event::Packet(Some(Err(err))) => Err(eof_as_closed(err)),
                Event::Packet(None) => Err(KestrelError::Closed),
                Event::Action(Some(Action::Shutdown)) | Event::Action(None) => break Ok(()),
                Event::Action(Some(action)) => self.handle_action(action).await,
            };
            if let Err(err) = step {
                break Err(err);
            }
        };

        let result = match result {
            Ok(()) => self.shutdown().await,
            Err(err) => Err(err),
        };
        self.abandon_channels();
        match &result {
            Ok(()) => self.logger.info(format_args!("session loop stopped")),
            Err(err) => self
                .logger
                .error(format_args!("session loop stopped: {}", err)),
        }
        result
    }

    async fn next_event(&mut self) -> Event {
        tokio::select! {
            packet = self.packets.recv() => Event::Packet(packet),
            action = self.actions.recv() => Event::Action(action),
        }
    }

    async fn write_all(&mut self, out: Vec<PacketBuilder>) -> KestrelResult<()> {
        for packet in out {
            self.writer.write_packet(packet).await?;
        }
        Ok(())
    }

    async fn handle_packet(&mut self, payload: &[u8]) -> KestrelResult<()> {
        let mut out = Vec::new();
        self.dispatcher.dispatch(payload, &mut out)?;
        self.write_all(out).await
    }

    async fn handle_action(&mut self, action: Action) -> KestrelResult<()> {
        let mut out = Vec::new();
        match action {
            Action::OpenSession {
                kind,
                window,
                handler,
                reply,
            } => {
                let channels = self.dispatcher.channels();
                let key = channels.insert_with(|id| Channel::new(id, window, handler));
                let alive = channels
                    .get_by_key(key)
                    .map(|channel| channel.liveness())
                    .ok_or_else(|| KestrelError::Internal("channel vanished on insert".into()))?;
                self.writer
                    .write_packet(channel_open(
                        &kind,
                        key.id,
                        window.window_size,
                        window.max_packet_size,
                    ))
                    .await?;
                self.logger
                    .info(format_args!("opening {} channel {}", kind.name(), key.id));
                // The caller may have given up waiting
                let _ = reply.send(Ok(OpenedChannel { key, alive }));
            }
            Action::RawPacket(payload) => out.push(PacketBuilder::from_payload(&payload)),
            Action::ChannelInput { key, data } => match self.dispatcher.channels().get_by_key(key) {
                Some(channel) => channel.write(&data, &mut out),
                None => self.logger.debug(format_args!(
                    "dropping {} bytes for stale channel {}",
                    data.len(),
                    key.id
                )),
            },
            Action::ChannelClose { key } => {
                if let Some(channel) = self.dispatcher.channels().get_by_key(key) {
                    channel.close(&mut out);
                }
            }
            Action::Shutdown => {}
        }
        self.write_all(out).await
    }

    async fn shutdown(&mut self) -> KestrelResult<()> {
        let ids = self.dispatcher.channels().ids();
        self.logger.debug(format_args!(
            "shutting down, closing {} channel(s)",
            ids.len()
        ));
        for id in ids {
            let mut out = Vec::new();
            if let Some(channel) = self.dispatcher.channels().get(id) {
                channel.close(&mut out);
            }
            self.write_all(out).await?;
        }

        while !self.dispatcher.channels().is_empty() {
            match self.next_event().await {
                Event::Packet(Some(Ok(payload))) => self.handle_packet(&payload).await?,
                Event::Packet(_) => return Ok(()),
                Event::Action(Some(Action::Shutdown)) | Event::Action(None) => break,
                Event::Action(Some(Action::OpenSession { reply, .. })) => {
                    let _ = reply.send(Err(KestrelError::Closed));
                }
                Event::Action(Some(action)) => self.handle_action(action).await?,
            }
        }

        self.writer
            .write_packet(disconnect_message(
                disconnect::BY_APPLICATION,
                "by application",
            ))
            .await?;
        self.writer.shutdown().await
    }

    fn abandon_channels(&mut self) {
        let channels = self.dispatcher.channels();
        for id in channels.ids() {
            if let Some(mut channel) = channels.remove(id) {
                channel.abandon();
            }
        }
    }
}
