//! Routes inbound packets of an established session.
//!
//! The [`Dispatcher`] owns the channel table. Channel messages are looked up
//! by their leading recipient id and handed to the [`Channel`]; the few
//! transport and global messages that may arrive mid-session are answered or
//! dropped here. It runs only inside the session loop.

use crate::ssh::channel::{Channel, ChannelTable};
use crate::ssh::connection::{
    open_failure_reason, parse_global_request, parse_window_adjust, recipient_channel,
    request_failure, ChannelData, ChannelRequest, OpenConfirmation, OpenFailure,
};
use crate::ssh::handshake::peer_disconnected;
use crate::ssh::message::{describe, MessageType};
use crate::ssh::packet::PacketBuilder;
use kestrel_platform::{KestrelError, KestrelResult, Logger};
use std::sync::Arc;

/// Dispatches session packets to channels.
pub struct Dispatcher {
    channels: ChannelTable,
    logger: Arc<dyn Logger>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with no channels.
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            channels: ChannelTable::new(),
            logger,
        }
    }

    /// Channel table.
    pub fn channels(&mut self) -> &mut ChannelTable {
        &mut self.channels
    }

    fn channel(&mut self, payload: &[u8]) -> KestrelResult<&mut Channel> {
        let id = recipient_channel(payload)?;
        self.channels
            .get(id)
            .ok_or_else(|| KestrelError::Internal(format!("message for unknown channel {}", id)))
    }

    /// Handles one inbound payload and appends the replies to `out`.
    ///
    /// # Errors
    ///
    /// - [`KestrelError::Internal`] for an unknown message code or channel id
    /// - [`KestrelError::Protocol`] for malformed messages, a peer DISCONNECT,
    ///   a message that has no place in an established session, or a KEXINIT
    pub fn dispatch(&mut self, payload: &[u8], out: &mut Vec<PacketBuilder>) -> KestrelResult<()> {
        let code = payload.first().copied().unwrap_or(0);
        let message = MessageType::from_u8(code)
            .ok_or_else(|| KestrelError::Internal(format!("unknown message code {}", code)))?;

        match message {
            MessageType::Ignore | MessageType::Debug | MessageType::Unimplemented => {
                self.logger.debug(format_args!("dropping {}", message));
            }
            MessageType::Disconnect => return Err(peer_disconnected(payload)),
            MessageType::KexInit => {
                return Err(KestrelError::Protocol(
                    "rekeying is not supported".to_string(),
                ))
            }
            MessageType::GlobalRequest => {
                let (name, want_reply) = parse_global_request(payload)?;
                self.logger
                    .debug(format_args!("refusing global request {}", name));
                if want_reply {
                    out.push(request_failure());
                }
            }
            MessageType::RequestSuccess | MessageType::RequestFailure => {
                self.logger.debug(format_args!("dropping {}", message));
            }
            MessageType::ChannelOpenConfirmation => {
                let confirmation = OpenConfirmation::from_bytes(payload)?;
                let logger = self.logger.clone();
                let channel = self.channel(payload)?;
                channel.confirm(&confirmation, out)?;
                logger.info(format_args!(
                    "channel {} open (remote {}, window {}, max packet {})",
                    confirmation.recipient_channel,
                    confirmation.sender_channel,
                    confirmation.window_size,
                    confirmation.max_packet_size
                ));
            }
            MessageType::ChannelOpenFailure => {
                let failure = OpenFailure::from_bytes(payload)?;
                let mut channel = self
                    .channels
                    .remove(failure.recipient_channel)
                    .ok_or_else(|| {
                        KestrelError::Internal(format!(
                            "open failure for unknown channel {}",
                            failure.recipient_channel
                        ))
                    })?;
                self.logger.warn(format_args!(
                    "channel {} open failed: {} ({})",
                    failure.recipient_channel,
                    failure.description,
                    open_failure_reason(failure.reason)
                ));
                channel.fail_open(failure.reason, &failure.description);
            }
            MessageType::ChannelWindowAdjust => {
                let (_, bytes_to_add) = parse_window_adjust(payload)?;
                self.channel(payload)?.adjust_remote_window(bytes_to_add, out);
            }
            MessageType::ChannelData | MessageType::ChannelExtendedData => {
                let data = ChannelData::from_bytes(payload)?;
                self.channel(payload)?.receive(data.data_type, data.data, out)?;
            }
            MessageType::ChannelEof => {
                self.channel(payload)?.receive_eof(out);
            }
            MessageType::ChannelClose => {
                let id = recipient_channel(payload)?;
                let mut channel = self.channels.remove(id).ok_or_else(|| {
                    KestrelError::Internal(format!("close for unknown channel {}", id))
                })?;
                channel.receive_close(true, out);
                self.logger.info(format_args!("channel {} closed", id));
            }
            MessageType::ChannelRequest => {
                let request = ChannelRequest::from_bytes(payload)?;
                let logger = self.logger.clone();
                self.channel(payload)?
                    .receive_request(&request, logger.as_ref(), out);
            }
            MessageType::ChannelSuccess => self.channel(payload)?.receive_reply(true, out),
            MessageType::ChannelFailure => self.channel(payload)?.receive_reply(false, out),
            _ => {
                return Err(KestrelError::Protocol(format!(
                    "unexpected {} in session",
                    describe(code)
                )))
            }
        }
        Ok(())
    }
}
