//! SSH connection protocol messages (RFC 4254).
//!
//! Encoders return a [`PacketBuilder`] ready for the transport; decoders take
//! a payload whose first byte is the message code and borrow from it.
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::connection::{channel_open, ChannelKind};
//!
//! let open = channel_open(&ChannelKind::Session, 0, 2 * 1024 * 1024, 32 * 1024);
//! assert_eq!(open.payload()[0], 90);
//! ```

use crate::ssh::codec::Decoder;
use crate::ssh::message::MessageType;
use crate::ssh::packet::PacketBuilder;
use kestrel_platform::{KestrelError, KestrelResult};

/// Bytes of CHANNEL_DATA framing around the data itself:
/// code, recipient channel and data length.
pub const DATA_OVERHEAD: u32 = 9;

/// Extended data type for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Channel type requested in CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// Interactive shell or command.
    Session,
    /// Client to server TCP forwarding.
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
}

impl ChannelKind {
    /// A `direct-tcpip` channel to `host:port` from `0.0.0.0:0`.
    pub fn direct_tcpip(host: impl Into<String>, port: u16) -> Self {
        ChannelKind::DirectTcpip {
            host: host.into(),
            port: u32::from(port),
            originator_address: "0.0.0.0".to_string(),
            originator_port: 0,
        }
    }

    /// Channel type name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
        }
    }
}

/// Encodes SSH_MSG_CHANNEL_OPEN.
///
/// ```text
/// byte      SSH_MSG_CHANNEL_OPEN
/// string    channel type
/// uint32    sender channel
/// uint32    initial window size
/// uint32    maximum packet size
/// ....      channel type specific data
/// ```
pub fn channel_open(
    kind: &ChannelKind,
    sender_channel: u32,
    window_size: u32,
    max_packet_size: u32,
) -> PacketBuilder {
    let mut packet = PacketBuilder::new(MessageType::ChannelOpen);
    packet
        .string(kind.name())
        .u32(sender_channel)
        .u32(window_size)
        .u32(max_packet_size);
    if let ChannelKind::DirectTcpip {
        host,
        port,
        originator_address,
        originator_port,
    } = kind
    {
        packet
            .string(host)
            .u32(*port)
            .string(originator_address)
            .u32(*originator_port);
    }
    packet
}

fn decoder_for(payload: &[u8], expected: MessageType) -> KestrelResult<Decoder<'_>> {
    let mut dec = Decoder::new(payload);
    let code = dec.u8()?;
    if code != expected as u8 {
        return Err(KestrelError::Protocol(format!(
            "expected {}, got code {}",
            expected, code
        )));
    }
    Ok(dec)
}

/// Reads the recipient channel that leads every channel message.
pub fn recipient_channel(payload: &[u8]) -> KestrelResult<u32> {
    let mut dec = Decoder::new(payload);
    dec.u8()?;
    dec.u32()
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConfirmation {
    /// Our channel id
    pub recipient_channel: u32,
    /// The server's channel id
    pub sender_channel: u32,
    /// Initial remote window
    pub window_size: u32,
    /// Remote maximum packet size
    pub max_packet_size: u32,
}

impl OpenConfirmation {
    /// Parses the payload.
    pub fn from_bytes(payload: &[u8]) -> KestrelResult<Self> {
        let mut dec = decoder_for(payload, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: dec.u32()?,
            sender_channel: dec.u32()?,
            window_size: dec.u32()?,
            max_packet_size: dec.u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFailure {
    /// Our channel id
    pub recipient_channel: u32,
    /// Reason code
    pub reason: u32,
    /// Human readable description
    pub description: String,
}

impl OpenFailure {
    /// Parses the payload.
    pub fn from_bytes(payload: &[u8]) -> KestrelResult<Self> {
        let mut dec = decoder_for(payload, MessageType::ChannelOpenFailure)?;
        Ok(Self {
            recipient_channel: dec.u32()?,
            reason: dec.u32()?,
            description: dec.string()?.to_string(),
        })
    }
}

/// Text for a CHANNEL_OPEN_FAILURE reason code.
pub fn open_failure_reason(code: u32) -> &'static str {
    match code {
        1 => "administratively prohibited",
        2 => "connect failed",
        3 => "unknown channel type",
        4 => "resource shortage",
        _ => "unknown reason",
    }
}

/// Encodes SSH_MSG_CHANNEL_WINDOW_ADJUST.
pub fn window_adjust(remote_channel: u32, bytes_to_add: u32) -> PacketBuilder {
    let mut packet = PacketBuilder::new(MessageType::ChannelWindowAdjust);
    packet.u32(remote_channel).u32(bytes_to_add);
    packet
}

/// Parses SSH_MSG_CHANNEL_WINDOW_ADJUST into `(recipient, bytes_to_add)`.
pub fn parse_window_adjust(payload: &[u8]) -> KestrelResult<(u32, u32)> {
    let mut dec = decoder_for(payload, MessageType::ChannelWindowAdjust)?;
    Ok((dec.u32()?, dec.u32()?))
}

/// Encodes SSH_MSG_CHANNEL_DATA.
pub fn channel_data(remote_channel: u32, data: &[u8]) -> PacketBuilder {
    let mut packet = PacketBuilder::new(MessageType::ChannelData);
    packet.u32(remote_channel).u32_bytes(data);
    packet
}

/// Inbound SSH_MSG_CHANNEL_DATA or SSH_MSG_CHANNEL_EXTENDED_DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelData<'a> {
    /// Our channel id
    pub recipient_channel: u32,
    /// `None` for plain data, the type code for extended data
    pub data_type: Option<u32>,
    /// Data bytes
    pub data: &'a [u8],
}

impl<'a> ChannelData<'a> {
    /// Parses either data message.
    pub fn from_bytes(payload: &'a [u8]) -> KestrelResult<Self> {
        let mut dec = Decoder::new(payload);
        let code = dec.u8()?;
        let recipient_channel = dec.u32()?;
        let data_type = match MessageType::from_u8(code) {
            Some(MessageType::ChannelData) => None,
            Some(MessageType::ChannelExtendedData) => Some(dec.u32()?),
            _ => {
                return Err(KestrelError::Protocol(format!(
                    "code {} is not a data message",
                    code
                )))
            }
        };
        let data = dec.u32_bytes()?;
        Ok(Self {
            recipient_channel,
            data_type,
            data,
        })
    }
}

/// Encodes SSH_MSG_CHANNEL_EOF.
pub fn channel_eof(remote_channel: u32) -> PacketBuilder {
    let mut packet = PacketBuilder::new(MessageType::ChannelEof);
    packet.u32(remote_channel);
    packet
}

/// Encodes SSH_MSG_CHANNEL_CLOSE.
pub fn channel_close(remote_channel: u32) -> PacketBuilder {
    let mut packet = PacketBuilder::new(MessageType::ChannelClose);
    packet.u32(remote_channel);
    packet
}

/// Encodes SSH_MSG_CHANNEL_FAILURE.
pub fn channel_failure(remote_channel: u32) -> PacketBuilder {
    let mut packet = PacketBuilder::new(MessageType::ChannelFailure);
    packet.u32(remote_channel);
    packet
}

/// Encodes SSH_MSG_REQUEST_FAILURE.
pub fn request_failure() -> PacketBuilder {
    PacketBuilder::new(MessageType::RequestFailure)
}

/// Parses SSH_MSG_GLOBAL_REQUEST into `(name, want_reply)`.
pub fn parse_global_request(payload: &[u8]) -> KestrelResult<(String, bool)> {
    let mut dec = decoder_for(payload, MessageType::GlobalRequest)?;
    Ok((dec.string()?.to_string(), dec.bool()?))
}

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Pseudo-terminal allocation
    PtyReq {
        /// TERM value
        term: String,
        /// Width in characters
        width_chars: u32,
        /// Height in rows
        height_rows: u32,
        /// Width in pixels
        width_pixels: u32,
        /// Height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// Run a command
    Exec {
        /// Command line
        command: String,
    },
    /// Start the login shell
    Shell,
    /// Exit status of the remote process
    ExitStatus {
        /// Status code
        exit_status: u32,
    },
    /// Any other request, carried by name only
    Other(String),
}

impl ChannelRequestType {
    /// A pty-req with zero dimensions and no modes.
    pub fn pty(term: impl Into<String>) -> Self {
        ChannelRequestType::PtyReq {
            term: term.into(),
            width_chars: 0,
            height_rows: 0,
            width_pixels: 0,
            height_pixels: 0,
            modes: Vec::new(),
        }
    }

    /// Request name on the wire.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::Other(name) => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient channel
    pub recipient_channel: u32,
    /// Request type and its data
    pub request_type: ChannelRequestType,
    /// Whether the sender wants CHANNEL_SUCCESS / CHANNEL_FAILURE
    pub want_reply: bool,
}

impl ChannelRequest {
    /// Creates a request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Encodes the request.
    pub fn to_packet(&self) -> PacketBuilder {
        let mut packet = PacketBuilder::new(MessageType::ChannelRequest);
        packet
            .u32(self.recipient_channel)
            .string(self.request_type.name())
            .bool(self.want_reply);
        match &self.request_type {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                packet
                    .string(term)
                    .u32(*width_chars)
                    .u32(*height_rows)
                    .u32(*width_pixels)
                    .u32(*height_pixels)
                    .u32_bytes(modes);
            }
            ChannelRequestType::Exec { command } => {
                packet.string(command);
            }
            ChannelRequestType::ExitStatus { exit_status } => {
                packet.u32(*exit_status);
            }
            ChannelRequestType::Shell | ChannelRequestType::Other(_) => {}
        }
        packet
    }

    /// Parses an inbound request.
    ///
    /// Only `exit-status` data is decoded; other request types keep their
    /// name and drop their data.
    pub fn from_bytes(payload: &[u8]) -> KestrelResult<Self> {
        let mut dec = decoder_for(payload, MessageType::ChannelRequest)?;
        let recipient_channel = dec.u32()?;
        let name = dec.string()?.to_string();
        let want_reply = dec.bool()?;
        let request_type = match name.as_str() {
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: dec.u32()?,
            },
            _ => ChannelRequestType::Other(name),
        };
        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}
