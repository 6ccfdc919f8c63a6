//! Requests sent to the session loop.

use crate::ssh::channel::{ChannelHandler, ChannelKey, WindowConfig};
use crate::ssh::connection::ChannelKind;
use kestrel_platform::KestrelResult;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A channel the loop has allocated.
#[derive(Debug, Clone)]
pub struct OpenedChannel {
    /// Key of the new channel
    pub key: ChannelKey,
    /// Cleared once the channel leaves the table
    pub alive: Arc<AtomicBool>,
}

/// Work for the session loop, from any task.
pub enum Action {
    /// Allocate a channel and send CHANNEL_OPEN.
    ///
    /// `reply` receives the key as soon as the open is sent; the handler
    /// learns about confirmation or failure.
    OpenSession {
        /// Channel type
        kind: ChannelKind,
        /// Local window parameters
        window: WindowConfig,
        /// Event handler
        handler: Box<dyn ChannelHandler>,
        /// Receives the allocated channel
        reply: oneshot::Sender<KestrelResult<OpenedChannel>>,
    },
    /// Send a payload as is.
    RawPacket(Vec<u8>),
    /// Queue data on a channel.
    ChannelInput {
        /// Target channel
        key: ChannelKey,
        /// Data bytes
        data: Vec<u8>,
    },
    /// Close a channel.
    ChannelClose {
        /// Target channel
        key: ChannelKey,
    },
    /// Stop the loop.
    Shutdown,
}

impl Action {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Action::OpenSession { .. } => "open-session",
            Action::RawPacket(_) => "raw-packet",
            Action::ChannelInput { .. } => "channel-input",
            Action::ChannelClose { .. } => "channel-close",
            Action::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::OpenSession { kind, window, .. } => f
                .debug_struct("OpenSession")
                .field("kind", kind)
                .field("window", window)
                .finish_non_exhaustive(),
            Action::RawPacket(payload) => f.debug_tuple("RawPacket").field(&payload.len()).finish(),
            Action::ChannelInput { key, data } => f
                .debug_struct("ChannelInput")
                .field("key", key)
                .field("len", &data.len())
                .finish(),
            Action::ChannelClose { key } => {
                f.debug_struct("ChannelClose").field("key", key).finish()
            }
            Action::Shutdown => f.write_str("Shutdown"),
        }
    }
}
