//! SSH password authentication (RFC 4252).
//!
//! The client asks for the `ssh-userauth` service once, then sends one
//! `password` USERAUTH_REQUEST per candidate from a [`PasswordSupplier`]
//! until the server answers USERAUTH_SUCCESS or the supplier runs out.
//!
//! # Security
//!
//! - Passwords are zeroized as soon as the request is encoded
//! - A supplier error aborts authentication; it is never retried
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::auth::{PasswordList, PasswordSupplier};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut passwords = PasswordList::new(["first", "second"]);
//! assert_eq!(passwords.next_password().await.unwrap().as_deref(), Some("first"));
//! assert_eq!(passwords.next_password().await.unwrap().as_deref(), Some("second"));
//! assert_eq!(passwords.next_password().await.unwrap(), None);
//! # }
//! ```

use crate::ssh::codec::Decoder;
use crate::ssh::handshake::{expect_message, next_message};
use crate::ssh::message::{describe, MessageType};
use crate::ssh::packet::PacketBuilder;
use crate::ssh::transport::Transport;
use async_trait::async_trait;
use kestrel_platform::{KestrelError, KestrelResult};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncWrite};
use zeroize::Zeroize;

/// Service requested before authenticating.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Service started once authenticated.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// Produces password candidates, one per attempt.
#[async_trait]
pub trait PasswordSupplier: Send {
    /// Returns the next password, `None` once there are no more.
    ///
    /// An error aborts authentication.
    async fn next_password(&mut self) -> KestrelResult<Option<String>>;
}

#[async_trait]
impl<F> PasswordSupplier for F
where
    F: FnMut() -> KestrelResult<Option<String>> + Send,
{
    async fn next_password(&mut self) -> KestrelResult<Option<String>> {
        self()
    }
}

/// Fixed list of passwords, tried in order.
#[derive(Default)]
pub struct PasswordList {
    remaining: VecDeque<String>,
}

impl PasswordList {
    /// Creates a list from `passwords`.
    pub fn new<I, S>(passwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            remaining: passwords.into_iter().map(Into::into).collect(),
        }
    }
}

impl std::fmt::Debug for PasswordList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordList")
            .field("remaining", &self.remaining.len())
            .finish()
    }
}

impl Drop for PasswordList {
    fn drop(&mut self) {
        for password in self.remaining.iter_mut() {
            password.zeroize();
        }
    }
}

#[async_trait]
impl PasswordSupplier for PasswordList {
    async fn next_password(&mut self) -> KestrelResult<Option<String>> {
        Ok(self.remaining.pop_front())
    }
}

/// Encodes SSH_MSG_SERVICE_REQUEST.
pub fn service_request(service: &str) -> PacketBuilder {
    let mut packet = PacketBuilder::new(MessageType::ServiceRequest);
    packet.string(service);
    packet
}

/// Encodes a `password` SSH_MSG_USERAUTH_REQUEST.
pub fn password_request(user: &str, password: &str) -> PacketBuilder {
    let mut packet = PacketBuilder::new(MessageType::UserauthRequest);
    packet
        .string(user)
        .string(CONNECTION_SERVICE)
        .string("password")
        .bool(false)
        .string(password);
    packet
}

/// Decoded SSH_MSG_USERAUTH_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Methods that can continue.
    pub methods: Vec<String>,
    /// Partial success flag.
    pub partial_success: bool,
}

impl AuthFailure {
    /// Parses the payload, code byte included.
    pub fn from_bytes(payload: &[u8]) -> KestrelResult<Self> {
        let mut dec = Decoder::new(payload);
        dec.u8()?;
        Ok(Self {
            methods: dec.name_list()?,
            partial_success: dec.bool()?,
        })
    }
}

/// Parses the message text of SSH_MSG_USERAUTH_BANNER.
pub fn parse_banner(payload: &[u8]) -> KestrelResult<String> {
    let mut dec = Decoder::new(payload);
    dec.u8()?;
    Ok(dec.string()?.to_string())
}

/// Authenticates `user` with passwords from `supplier`.
///
/// Without a supplier no authentication is attempted, and the caller relies
/// on the server allowing the session as is.
///
/// # Errors
///
/// - [`KestrelError::Auth`] once the supplier is exhausted
/// - Any error the supplier returns, unchanged
/// - [`KestrelError::Protocol`] for an unexpected reply
pub async fn authenticate<S>(
    transport: &mut Transport<S>,
    user: &str,
    supplier: Option<&mut (dyn PasswordSupplier + '_)>,
) -> KestrelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let logger = transport.logger().clone();
    let supplier = match supplier {
        Some(supplier) => supplier,
        None => {
            logger.debug(format_args!("no password supplier, skipping authentication"));
            return Ok(());
        }
    };

    transport.write_packet(service_request(USERAUTH_SERVICE)).await?;
    expect_message(transport, MessageType::ServiceAccept).await?;

    let mut attempt = 0u32;
    loop {
        let mut password = match supplier.next_password().await? {
            Some(password) => password,
            None => {
                return Err(KestrelError::Auth(format!(
                    "no more passwords for {} after {} attempt(s)",
                    user, attempt
                )))
            }
        };
        attempt += 1;
        let request = password_request(user, &password);
        password.zeroize();
        transport.write_packet(request).await?;
        logger.info(format_args!("password attempt {} for {}", attempt, user));

        loop {
            let reply = next_message(transport).await?;
            let code = reply.first().copied().unwrap_or(0);
            match MessageType::from_u8(code) {
                Some(MessageType::UserauthSuccess) => {
                    logger.info(format_args!("authenticated as {}", user));
                    return Ok(());
                }
                Some(MessageType::UserauthFailure) => {
                    let failure = AuthFailure::from_bytes(&reply)?;
                    logger.warn(format_args!(
                        "password rejected for {} (can continue: {})",
                        user,
                        failure.methods.join(",")
                    ));
                    break;
                }
                Some(MessageType::UserauthBanner) => {
                    logger.info(format_args!("banner: {}", parse_banner(&reply)?.trim_end()));
                }
                _ => {
                    return Err(KestrelError::Protocol(format!(
                        "unexpected {} during authentication",
                        describe(code)
                    )))
                }
            }
        }
    }
}
