//! SSH-2 client (RFC 4251-4254).
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Wire** ([`codec`], [`message`]) - primitive encodings and message numbers
//! 2. **Packets** ([`packet`], [`crypto`], [`transport`]) - binary packet protocol,
//!    ciphers and MACs, sequence numbers
//! 3. **Setup** ([`version`], [`kex`], [`kex_dh`], [`hostkey`], [`handshake`],
//!    [`auth`]) - identification, key exchange, host-key trust, password
//!    authentication
//! 4. **Connection** ([`connection`], [`channel`], [`dispatcher`], [`session`]) -
//!    channel messages, flow control and the session loop
//! 5. **API** ([`client`], [`command`], [`tunnel`]) - commands, shells and
//!    `direct-tcpip` tunnels
//!
//! Supported algorithms: `diffie-hellman-group1-sha1` and
//! `diffie-hellman-group14-sha1`, `ssh-rsa` host keys, `aes128-ctr`,
//! `aes256-ctr`, `aes128-cbc` and `aes256-cbc`, `hmac-sha1`, no compression.
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::codec::{Decoder, Encoder};
//!
//! let mut enc = Encoder::new();
//! enc.string("ssh-connection").u32(7);
//! let bytes = enc.into_vec();
//!
//! let mut dec = Decoder::new(&bytes);
//! assert_eq!(dec.string().unwrap(), "ssh-connection");
//! assert_eq!(dec.u32().unwrap(), 7);
//! ```

pub mod auth;
pub mod channel;
pub mod client;
pub mod codec;
pub mod command;
pub mod connection;
pub mod crypto;
pub mod dispatcher;
pub mod handshake;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod packet;
pub mod session;
pub mod transport;
pub mod tunnel;
pub mod version;

// Re-export main types
pub use auth::{PasswordList, PasswordSupplier};
pub use channel::{ChannelContext, ChannelHandler, ChannelKey, ChannelState, WindowConfig};
pub use client::{ChannelHandle, Client, ClientConfig};
pub use command::{CommandOutput, CommandSpec, OutputCollector};
pub use connection::{ChannelKind, ChannelRequestType};
pub use crypto::{CipherAlgorithm, MacAlgorithm};
pub use hostkey::{fingerprint, AcceptAnyHostKey, FingerprintCheck, HostKeyCheck};
pub use kex::{KexInit, KexResult, Preferences};
pub use message::MessageType;
pub use packet::PacketBuilder;
pub use transport::Transport;
pub use tunnel::TunnelStream;
pub use version::Version;
