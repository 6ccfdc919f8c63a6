//! Client-side SSH-2 for tokio.
//!
//! `kestrel-proto` speaks the SSH-2 protocol as a client over any
//! `AsyncRead + AsyncWrite` stream: it exchanges identification lines,
//! runs a Diffie-Hellman key exchange, checks the server's host key,
//! authenticates with passwords and multiplexes channels for remote
//! commands, shells and `direct-tcpip` tunnels.
//!
//! # Features
//!
//! - `ssh` (default) - the SSH client
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_proto::ssh::{Client, ClientConfig, PasswordList};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("admin").with_password_supplier(PasswordList::new(["secret"]));
//! let mut client = Client::connect("192.0.2.10:22", config).await?;
//! let output = client.exec("echo hi").await?;
//! assert_eq!(output.stdout, b"hi\n");
//! client.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
