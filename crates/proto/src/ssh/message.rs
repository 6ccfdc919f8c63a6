//! SSH message numbers (RFC 4250 Section 4.1).
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): disconnect, ignore, debug, service
//! - **Algorithm Negotiation** (20-29): KEXINIT, NEWKEYS
//! - **Key Exchange Method** (30-49): KEXDH_INIT, KEXDH_REPLY
//! - **User Authentication** (50-79)
//! - **Connection Protocol** (80-127): global requests and channels
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::message::{Category, MessageType};
//!
//! let msg = MessageType::from_u8(94).unwrap();
//! assert_eq!(msg, MessageType::ChannelData);
//! assert_eq!(msg.category(), Category::Connection);
//! assert_eq!(msg.to_string(), "SSH_MSG_CHANNEL_DATA(94)");
//! ```

macro_rules! message_types {
    ($( $(#[$doc:meta])* $variant:ident = $code:literal => $name:literal, )+) => {
        /// SSH message types handled by the client.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum MessageType {
            $( $(#[$doc])* $variant = $code, )+
        }

        impl MessageType {
            /// Looks up a message type by its number.
            pub fn from_u8(code: u8) -> Option<Self> {
                match code {
                    $( $code => Some(MessageType::$variant), )+
                    _ => None,
                }
            }

            /// Returns the RFC name, e.g. `SSH_MSG_KEXINIT`.
            pub fn name(self) -> &'static str {
                match self {
                    $( MessageType::$variant => $name, )+
                }
            }
        }
    };
}

message_types! {
    /// Terminates the connection.
    Disconnect = 1 => "SSH_MSG_DISCONNECT",
    /// Padding or keep-alive, always dropped.
    Ignore = 2 => "SSH_MSG_IGNORE",
    /// Peer did not understand a message.
    Unimplemented = 3 => "SSH_MSG_UNIMPLEMENTED",
    /// Debugging text.
    Debug = 4 => "SSH_MSG_DEBUG",
    /// Requests a service such as `ssh-userauth`.
    ServiceRequest = 5 => "SSH_MSG_SERVICE_REQUEST",
    /// Service request accepted.
    ServiceAccept = 6 => "SSH_MSG_SERVICE_ACCEPT",
    /// Algorithm negotiation.
    KexInit = 20 => "SSH_MSG_KEXINIT",
    /// Switch to the newly derived keys.
    NewKeys = 21 => "SSH_MSG_NEWKEYS",
    /// Client Diffie-Hellman public value.
    KexdhInit = 30 => "SSH_MSG_KEXDH_INIT",
    /// Server host key, public value and signature.
    KexdhReply = 31 => "SSH_MSG_KEXDH_REPLY",
    /// Authentication request.
    UserauthRequest = 50 => "SSH_MSG_USERAUTH_REQUEST",
    /// Authentication rejected.
    UserauthFailure = 51 => "SSH_MSG_USERAUTH_FAILURE",
    /// Authentication accepted.
    UserauthSuccess = 52 => "SSH_MSG_USERAUTH_SUCCESS",
    /// Text to show before authenticating.
    UserauthBanner = 53 => "SSH_MSG_USERAUTH_BANNER",
    /// Connection-wide request.
    GlobalRequest = 80 => "SSH_MSG_GLOBAL_REQUEST",
    /// Global request succeeded.
    RequestSuccess = 81 => "SSH_MSG_REQUEST_SUCCESS",
    /// Global request failed.
    RequestFailure = 82 => "SSH_MSG_REQUEST_FAILURE",
    /// Opens a channel.
    ChannelOpen = 90 => "SSH_MSG_CHANNEL_OPEN",
    /// Channel open accepted.
    ChannelOpenConfirmation = 91 => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
    /// Channel open refused.
    ChannelOpenFailure = 92 => "SSH_MSG_CHANNEL_OPEN_FAILURE",
    /// Grants more send window.
    ChannelWindowAdjust = 93 => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
    /// Channel payload.
    ChannelData = 94 => "SSH_MSG_CHANNEL_DATA",
    /// Typed channel payload (stderr).
    ChannelExtendedData = 95 => "SSH_MSG_CHANNEL_EXTENDED_DATA",
    /// No more data in this direction.
    ChannelEof = 96 => "SSH_MSG_CHANNEL_EOF",
    /// Channel closed.
    ChannelClose = 97 => "SSH_MSG_CHANNEL_CLOSE",
    /// Channel-specific request.
    ChannelRequest = 98 => "SSH_MSG_CHANNEL_REQUEST",
    /// Channel request succeeded.
    ChannelSuccess = 99 => "SSH_MSG_CHANNEL_SUCCESS",
    /// Channel request failed.
    ChannelFailure = 100 => "SSH_MSG_CHANNEL_FAILURE",
}

/// Protocol layer a message number belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// 1-19
    TransportGeneric,
    /// 20-29
    AlgorithmNegotiation,
    /// 30-49
    KeyExchange,
    /// 50-79
    UserAuth,
    /// 80-127
    Connection,
}

impl MessageType {
    /// Returns the protocol layer of this message.
    pub fn category(self) -> Category {
        match self as u8 {
            1..=19 => Category::TransportGeneric,
            20..=29 => Category::AlgorithmNegotiation,
            30..=49 => Category::KeyExchange,
            50..=79 => Category::UserAuth,
            _ => Category::Connection,
        }
    }

    /// Returns `true` for messages addressed to one channel.
    pub fn is_channel_message(self) -> bool {
        (MessageType::ChannelOpenConfirmation as u8..=MessageType::ChannelFailure as u8)
            .contains(&(self as u8))
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Describes a raw message number for logging, known or not.
pub fn describe(code: u8) -> String {
    match MessageType::from_u8(code) {
        Some(msg) => msg.to_string(),
        None => format!("UNKNOWN({})", code),
    }
}

/// Disconnect reason codes (RFC 4250 Section 4.2.2).
pub mod disconnect {
    /// Protocol error.
    pub const PROTOCOL_ERROR: u32 = 2;
    /// Key exchange failed.
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    /// MAC error.
    pub const MAC_ERROR: u32 = 5;
    /// Host key not verifiable.
    pub const HOST_KEY_NOT_VERIFIABLE: u32 = 9;
    /// Closed by the local application.
    pub const BY_APPLICATION: u32 = 11;
    /// Authentication methods exhausted.
    pub const NO_MORE_AUTH_METHODS_AVAILABLE: u32 = 14;
}
