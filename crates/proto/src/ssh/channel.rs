//! SSH channels and their flow control.
//!
//! A [`Channel`] holds both windows for one logical stream and the output
//! that the remote window does not yet allow. Its methods never touch the
//! transport: they append the packets to send to an `out` list that the
//! session loop writes afterwards, so all of this runs synchronously inside
//! the loop and is directly testable.
//!
//! Inbound data is granted back in coalesced WINDOW_ADJUST messages: the
//! grant is sent once the bytes received since the last grant, plus one
//! local maximum packet, would exceed the advertised window.
//!
//! Channels live in a [`ChannelTable`], an arena indexed by local channel id
//! with a free-id stack. Each slot carries a generation so that a
//! [`ChannelKey`] held by the application can never reach a channel that
//! reused its id.

use crate::ssh::connection::{
    channel_close, channel_data, channel_failure, window_adjust, ChannelRequest,
    ChannelRequestType, OpenConfirmation, DATA_OVERHEAD,
};
use crate::ssh::packet::PacketBuilder;
use bytes::{Buf, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN sent, no answer yet
    Opening,
    /// Confirmed by the server
    Open,
    /// We sent CHANNEL_CLOSE
    Closed,
}

/// Requests a handler makes while reacting to an event.
///
/// Collected and applied by the channel once the handler returns.
#[derive(Debug, Default)]
pub struct ChannelContext {
    local_id: u32,
    requests: Vec<(ChannelRequestType, bool)>,
    output: Vec<u8>,
    close: bool,
}

impl ChannelContext {
    fn new(local_id: u32) -> Self {
        Self {
            local_id,
            ..Default::default()
        }
    }

    /// Local id of the channel the event belongs to.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Sends a channel request.
    pub fn request(&mut self, request: ChannelRequestType, want_reply: bool) {
        self.requests.push((request, want_reply));
    }

    /// Queues data for the channel.
    pub fn write(&mut self, data: &[u8]) {
        self.output.extend_from_slice(data);
    }

    /// Closes the channel after the queued data.
    pub fn close(&mut self) {
        self.close = true;
    }

    /// Requests queued so far.
    pub fn requests(&self) -> &[(ChannelRequestType, bool)] {
        &self.requests
    }

    /// Returns `true` if the handler asked to close.
    pub fn close_requested(&self) -> bool {
        self.close
    }
}

/// Reacts to the events of one channel.
///
/// Every method defaults to doing nothing. Handlers run inside the session
/// loop and must not block.
pub trait ChannelHandler: Send {
    /// The server accepted the open.
    fn on_open_confirmation(&mut self, _ctx: &mut ChannelContext) {}

    /// The server refused the open. The channel is already gone.
    fn on_open_failure(&mut self, _reason: u32, _description: &str) {}

    /// CHANNEL_DATA arrived.
    fn on_data(&mut self, _ctx: &mut ChannelContext, _data: &[u8]) {}

    /// CHANNEL_EXTENDED_DATA arrived; type 1 is stderr.
    fn on_extended_data(&mut self, _ctx: &mut ChannelContext, _data_type: u32, _data: &[u8]) {}

    /// The server will send no more data.
    fn on_eof(&mut self, _ctx: &mut ChannelContext) {}

    /// The channel was removed. Called at most once.
    fn on_close(&mut self) {}

    /// The server answered a request with CHANNEL_SUCCESS.
    fn on_success(&mut self, _ctx: &mut ChannelContext) {}

    /// The server answered a request with CHANNEL_FAILURE.
    fn on_failure(&mut self, _ctx: &mut ChannelContext) {}

    /// The remote process exited.
    fn on_exit_status(&mut self, _exit_status: u32) {}
}

/// Local flow control parameters of a new channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// Window advertised in CHANNEL_OPEN
    pub window_size: u32,
    /// Maximum packet advertised in CHANNEL_OPEN
    pub max_packet_size: u32,
}

/// One logical channel.
pub struct Channel {
    local_id: u32,
    remote_id: u32,
    state: ChannelState,
    local: WindowConfig,
    received: u32,
    remote_window: u32,
    remote_max_packet: u32,
    pending: BytesMut,
    close_after_open: bool,
    alive: Arc<AtomicBool>,
    handler: Box<dyn ChannelHandler>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("state", &self.state)
            .field("received", &self.received)
            .field("remote_window", &self.remote_window)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Creates a channel in the [`ChannelState::Opening`] state.
    pub fn new(local_id: u32, local: WindowConfig, handler: Box<dyn ChannelHandler>) -> Self {
        Self {
            local_id,
            remote_id: 0,
            state: ChannelState::Opening,
            local,
            received: 0,
            remote_window: 0,
            remote_max_packet: 0,
            pending: BytesMut::new(),
            close_after_open: false,
            alive: Arc::new(AtomicBool::new(true)),
            handler,
        }
    }

    /// Local channel id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Server's channel id, valid once open.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Bytes we may still send.
    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    /// Bytes received since the last window grant.
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Bytes written but not yet sent.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flag cleared when the channel leaves its table.
    pub fn liveness(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    /// Handles CHANNEL_OPEN_CONFIRMATION.
    ///
    /// Runs the handler, then sends what it requested and any output
    /// buffered while the open was in flight.
    pub fn confirm(
        &mut self,
        confirmation: &OpenConfirmation,
        out: &mut Vec<PacketBuilder>,
    ) -> KestrelResult<()> {
        if self.state != ChannelState::Opening {
            return Err(KestrelError::Protocol(format!(
                "channel {} confirmed twice",
                self.local_id
            )));
        }
        self.state = ChannelState::Open;
        self.remote_id = confirmation.sender_channel;
        self.remote_window = confirmation.window_size;
        self.remote_max_packet = confirmation.max_packet_size;

        let mut ctx = ChannelContext::new(self.local_id);
        self.handler.on_open_confirmation(&mut ctx);
        self.apply(ctx, out);
        self.flush(out);
        if self.close_after_open {
            self.close(out);
        }
        Ok(())
    }

    /// Handles CHANNEL_OPEN_FAILURE. The caller removes the channel.
    pub fn fail_open(&mut self, reason: u32, description: &str) {
        self.state = ChannelState::Closed;
        self.handler.on_open_failure(reason, description);
    }

    /// Handles CHANNEL_WINDOW_ADJUST and flushes what it allows.
    pub fn adjust_remote_window(&mut self, bytes_to_add: u32, out: &mut Vec<PacketBuilder>) {
        self.remote_window = self.remote_window.saturating_add(bytes_to_add);
        self.flush(out);
    }

    /// Handles CHANNEL_DATA and CHANNEL_EXTENDED_DATA.
    ///
    /// Data arriving after we sent CHANNEL_CLOSE is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] if the peer sends more than the
    /// window it was granted.
    pub fn receive(
        &mut self,
        data_type: Option<u32>,
        data: &[u8],
        out: &mut Vec<PacketBuilder>,
    ) -> KestrelResult<()> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let available = self.local.window_size.saturating_sub(self.received);
        if len > available {
            return Err(KestrelError::Protocol(format!(
                "channel {}: peer sent {} bytes with {} left in window",
                self.local_id, len, available
            )));
        }

        let mut ctx = ChannelContext::new(self.local_id);
        match data_type {
            None => self.handler.on_data(&mut ctx, data),
            Some(code) => self.handler.on_extended_data(&mut ctx, code, data),
        }

        self.received += len;
        if u64::from(self.received) + u64::from(self.local.max_packet_size)
                > u64::from(self.local.window_size)
        {
            out.push(window_adjust(self.remote_id, self.received));
            self.received = 0;
        }
        self.apply(ctx, out);
        Ok(())
    }

    /// Handles CHANNEL_EOF.
    pub fn receive_eof(&mut self, out: &mut Vec<PacketBuilder>) {
        let mut ctx = ChannelContext::new(self.local_id);
        self.handler.on_eof(&mut ctx);
        self.apply(ctx, out);
    }

    /// Handles an inbound CHANNEL_REQUEST.
    pub fn receive_request(
        &mut self,
        request: &ChannelRequest,
        logger: &dyn Logger,
        out: &mut Vec<PacketBuilder>,
    ) {
        match request.request_type {
            ChannelRequestType::ExitStatus { exit_status } => {
                self.handler.on_exit_status(exit_status);
            }
            _ => {
                logger.debug(format_args!(
                    "channel {}: ignoring request {}",
                    self.local_id,
                    request.request_type.name()
                ));
                if request.want_reply && self.state == ChannelState::Open {
                    out.push(channel_failure(self.remote_id));
                }
            }
        }
    }

    /// Handles CHANNEL_SUCCESS (`true`) or CHANNEL_FAILURE (`false`).
    pub fn receive_reply(&mut self, success: bool, out: &mut Vec<PacketBuilder>) {
        let mut ctx = ChannelContext::new(self.local_id);
        if success {
            self.handler.on_success(&mut ctx);
        } else {
            self.handler.on_failure(&mut ctx);
        }
        self.apply(ctx, out);
    }

    /// Handles CHANNEL_CLOSE from the server. The caller removes the channel.
    ///
    /// Only an open channel answers with its own CLOSE; one still opening
    /// has no remote id to address. The handler hears about it exactly once
    /// either way, since the channel leaves the table here.
    pub fn receive_close(&mut self, connected: bool, out: &mut Vec<PacketBuilder>) {
        if self.state == ChannelState::Open && connected {
            out.push(channel_close(self.remote_id));
        }
        self.state = ChannelState::Closed;
        self.handler.on_close();
        self.alive.store(false, Ordering::Release);
    }

    /// Queues outbound data and sends what the window allows.
    pub fn write(&mut self, data: &[u8], out: &mut Vec<PacketBuilder>) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.pending.extend_from_slice(data);
        self.flush(out);
    }

    /// Flushes what it can, then sends CHANNEL_CLOSE.
    ///
    /// A channel still opening closes right after its confirmation.
    pub fn close(&mut self, out: &mut Vec<PacketBuilder>) {
        match self.state {
            ChannelState::Opening => self.close_after_open = true,
            ChannelState::Open => {
                self.flush(out);
                self.pending.clear();
                out.push(channel_close(self.remote_id));
                self.state = ChannelState::Closed;
            }
            ChannelState::Closed => {}
        }
    }

    /// Ends the channel without wire traffic or handler calls, when the
    /// session stops. Dropping the handler is its only notice.
    pub fn abandon(&mut self) {
        self.state = ChannelState::Closed;
        self.alive.store(false, Ordering::Release);
    }

    /// Sends as much pending data as the remote window and packet size allow.
    fn flush(&mut self, out: &mut Vec<PacketBuilder>) {
        if self.state != ChannelState::Open {
            return;
        }
        let chunk_limit = self.remote_max_packet.saturating_sub(DATA_OVERHEAD);
        loop {
            let n = (self.pending.len() as u64)
                .min(u64::from(self.remote_window))
                .min(u64::from(chunk_limit)) as usize;
            if n == 0 {
                return;
            }
            out.push(channel_data(self.remote_id, &self.pending[..n]));
            self.pending.advance(n);
            self.remote_window -= n as u32;
        }
    }

    fn apply(&mut self, ctx: ChannelContext, out: &mut Vec<PacketBuilder>) {
        if self.state == ChannelState::Open {
            for (request, want_reply) in ctx.requests {
                out.push(ChannelRequest::new(self.remote_id, request, want_reply).to_packet());
            }
        }
        if !ctx.output.is_empty() {
            self.write(&ctx.output, out);
        }
        if ctx.close {
            self.close(out);
        }
    }
}

/// Application-side reference to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    /// Local channel id
    pub id: u32,
    /// Slot generation when the channel was inserted
    pub generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    channel: Option<Channel>,
}

/// Open channels indexed by local id.
#[derive(Debug, Default)]
pub struct ChannelTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl ChannelTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of channels in the table.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no channel is open.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocates an id and stores the channel `make` builds for it.
    pub fn insert_with<F>(&mut self, make: F) -> ChannelKey
    where
        F: FnOnce(u32) -> Channel,
    {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[id as usize];
        slot.channel = Some(make(id));
        self.len += 1;
        ChannelKey {
            id,
            generation: slot.generation,
        }
    }

    /// Channel with local id `id`.
    pub fn get(&mut self, id: u32) -> Option<&mut Channel> {
        self.slots
            .get_mut(id as usize)
            .and_then(|slot| slot.channel.as_mut())
    }

    /// Channel for `key`, unless its slot has been reused since.
    pub fn get_by_key(&mut self, key: ChannelKey) -> Option<&mut Channel> {
        self.slots
            .get_mut(key.id as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.channel.as_mut())
    }

    /// Removes the channel with local id `id` and frees the id.
    pub fn remove(&mut self, id: u32) -> Option<Channel> {
        let slot = self.slots.get_mut(id as usize)?;
        let channel = slot.channel.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        channel.alive.store(false, Ordering::Release);
        self.free.push(id);
        self.len -= 1;
        Some(channel)
    }

    /// Local ids of all channels, in id order.
    pub fn ids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.channel.is_some())
            .map(|(id, _)| id as u32)
            .collect()
    }
}
