//! SSH client.
//!
//! [`Client::new`] runs the whole connection setup on any byte stream:
//! identification exchange, key exchange, host-key check and password
//! authentication. It then hands the transport to the session loop. All
//! later calls only enqueue work for that loop.
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_proto::ssh::auth::PasswordList;
//! use kestrel_proto::ssh::client::{Client, ClientConfig};
//! use kestrel_proto::ssh::hostkey::FingerprintCheck;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("deploy")
//!     .with_host_key_check(FingerprintCheck::new(
//!         "SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8",
//!     ))
//!     .with_password_supplier(PasswordList::new(["hunter2"]));
//!
//! let mut client = Client::connect("10.0.0.5:22", config).await?;
//! let output = client.exec("uname -a").await?;
//! print!("{}", String::from_utf8_lossy(&output.stdout));
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::{authenticate, PasswordSupplier};
use crate::ssh::channel::{ChannelHandler, ChannelKey, WindowConfig};
use crate::ssh::command::{CommandFailure, CommandHandler, CommandOutput, CommandSpec, OutputCollector};
use crate::ssh::connection::{open_failure_reason, ChannelKind};
use crate::ssh::handshake;
use crate::ssh::hostkey::{AcceptAnyHostKey, HostKeyCheck};
use crate::ssh::kex::Preferences;
use crate::ssh::session::{self, Action, OpenedChannel, SessionHandle};
use crate::ssh::transport::Transport;
use crate::ssh::tunnel::{TunnelHandler, TunnelStream};
use kestrel_platform::{default_logger, KestrelError, KestrelResult, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};

/// Default identification product.
pub const DEFAULT_PRODUCT: &str = "kestrel_0.1";

/// Client configuration.
pub struct ClientConfig {
    /// User to authenticate as.
    pub user: String,
    /// Decides whether the server's host key is trusted.
    ///
    /// Defaults to [`AcceptAnyHostKey`]; set a real check for anything but
    /// tests.
    pub host_key_check: Arc<dyn HostKeyCheck>,
    /// Password candidates. `None` skips authentication.
    pub password_supplier: Option<Box<dyn PasswordSupplier>>,
    /// Product part of `SSH-2.0-<product>`.
    pub product: String,
    /// Algorithm preference lists.
    pub preferences: Preferences,
    /// Window advertised for session channels.
    pub window_size: u32,
    /// Maximum packet advertised for every channel.
    pub max_packet_size: u32,
    /// Window advertised for tunnel channels.
    pub tunnel_window_size: u32,
    /// Capacity of the session loop's action queue.
    pub action_queue_capacity: usize,
    /// TERM sent in pty-req.
    pub term: String,
    /// TCP connect timeout of [`Client::connect`].
    pub connect_timeout: Duration,
    /// Log destination.
    pub logger: Arc<dyn Logger>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("user", &self.user)
            .field("host_key_check", &"<callback>")
            .field(
                "password_supplier",
                &self.password_supplier.as_ref().map(|_| "<callback>"),
            )
            .field("product", &self.product)
            .field("preferences", &self.preferences)
            .field("window_size", &self.window_size)
            .field("max_packet_size", &self.max_packet_size)
            .field("tunnel_window_size", &self.tunnel_window_size)
            .field("action_queue_capacity", &self.action_queue_capacity)
            .field("term", &self.term)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            host_key_check: Arc::new(AcceptAnyHostKey),
            password_supplier: None,
            product: DEFAULT_PRODUCT.to_string(),
            preferences: Preferences::default(),
            window_size: 2 * 1024 * 1024,
            max_packet_size: 32 * 1024,
            tunnel_window_size: 128 * 1024,
            action_queue_capacity: 1024,
            term: std::env::var("TERM")
                .ok()
                .filter(|term| !term.is_empty())
                .unwrap_or_else(|| "xterm".to_string()),
            connect_timeout: Duration::from_secs(30),
            logger: default_logger(),
        }
    }
}

impl ClientConfig {
    /// Default configuration for `user`.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    /// Sets the host-key check.
    pub fn with_host_key_check(mut self, check: impl HostKeyCheck + 'static) -> Self {
        self.host_key_check = Arc::new(check);
        self
    }

    /// Sets the password supplier.
    pub fn with_password_supplier(mut self, supplier: impl PasswordSupplier + 'static) -> Self {
        self.password_supplier = Some(Box::new(supplier));
        self
    }

    /// Sets the identification product.
    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = product.into();
        self
    }

    /// Sets the algorithm preferences.
    pub fn with_preferences(mut self, preferences: Preferences) -> Self {
        self.preferences = preferences;
        self
    }

    /// Sets the session and tunnel windows.
    pub fn with_windows(mut self, window_size: u32, tunnel_window_size: u32) -> Self {
        self.window_size = window_size;
        self.tunnel_window_size = tunnel_window_size;
        self
    }

    /// Sets the advertised maximum packet size.
    pub fn with_max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Sets the action queue capacity.
    pub fn with_action_queue_capacity(mut self, capacity: usize) -> Self {
        self.action_queue_capacity = capacity;
        self
    }

    /// Sets TERM for pty requests.
    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }

    /// Sets the TCP connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the logger.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Config`] for an empty user, an unsupported
    /// algorithm in the preferences, or a zero window, packet size or queue
    /// capacity.
    pub fn validate(&self) -> KestrelResult<()> {
        if self.user.is_empty() {
            return Err(KestrelError::Config("user must not be empty".to_string()));
        }
        if self.window_size == 0 || self.tunnel_window_size == 0 {
            return Err(KestrelError::Config(
                "window sizes must be positive".to_string(),
            ));
        }
        if self.max_packet_size == 0 {
            return Err(KestrelError::Config(
                "max_packet_size must be positive".to_string(),
            ));
        }
        if self.action_queue_capacity == 0 {
            return Err(KestrelError::Config(
                "action_queue_capacity must be positive".to_string(),
            ));
        }
        self.preferences.validate()
    }
}

/// Application handle to one channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    key: ChannelKey,
    alive: Arc<AtomicBool>,
    actions: mpsc::Sender<Action>,
}

impl ChannelHandle {
    fn new(opened: OpenedChannel, actions: mpsc::Sender<Action>) -> Self {
        Self {
            key: opened.key,
            alive: opened.alive,
            actions,
        }
    }

    /// Key of the channel.
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    /// Returns `true` until the channel leaves the session.
    pub fn is_open(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Queues `data` on the channel, waiting while the action queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Closed`] if the channel or the session is gone.
    pub async fn write(&self, data: &[u8]) -> KestrelResult<()> {
        if !self.is_open() {
            return Err(KestrelError::Closed);
        }
        self.actions
            .send(Action::ChannelInput {
                key: self.key,
                data: data.to_vec(),
            })
            .await
            .map_err(|_| KestrelError::Closed)
    }

    /// Closes the channel after the data written so far.
    pub async fn close(&self) -> KestrelResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.actions
            .send(Action::ChannelClose { key: self.key })
            .await
            .map_err(|_| KestrelError::Closed)
    }
}

/// An authenticated SSH connection.
pub struct Client {
    session: SessionHandle,
    window: WindowConfig,
    tunnel_window: WindowConfig,
    term: String,
    logger: Arc<dyn Logger>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session)
            .field("window", &self.window)
            .field("tunnel_window", &self.tunnel_window)
            .field("term", &self.term)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Sets up a session over `stream`.
    ///
    /// # Errors
    ///
    /// - [`KestrelError::Config`] if `config` does not validate
    /// - [`KestrelError::Protocol`] / [`KestrelError::Io`] for a broken peer
    /// - [`KestrelError::Negotiation`] without common algorithms
    /// - [`KestrelError::Trust`] if the host key is rejected
    /// - [`KestrelError::Auth`] if every password is refused
    pub async fn new<S>(stream: S, mut config: ClientConfig) -> KestrelResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;
        let logger = config.logger.clone();

        let mut transport = Transport::connect(stream, &config.product, logger.clone()).await?;
        handshake::run(
            &mut transport,
            &config.preferences,
            config.host_key_check.as_ref(),
        )
        .await?;

        let supplier: Option<&mut dyn PasswordSupplier> = match config.password_supplier.as_mut() {
            Some(supplier) => Some(supplier.as_mut()),
            None => None,
        };
        authenticate(&mut transport, &config.user, supplier).await?;

        let session = session::spawn(transport, config.action_queue_capacity);
        Ok(Self {
            session,
            window: WindowConfig {
                window_size: config.window_size,
                max_packet_size: config.max_packet_size,
            },
            tunnel_window: WindowConfig {
                window_size: config.tunnel_window_size,
                max_packet_size: config.max_packet_size,
            },
            term: config.term,
            logger,
        })
    }

    /// Dials `addr` over TCP and sets up a session.
    pub async fn connect<A: ToSocketAddrs>(addr: A, config: ClientConfig) -> KestrelResult<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                KestrelError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connection timeout",
                ))
            })??;
        stream.set_nodelay(true)?;
        if let Ok(peer) = stream.peer_addr() {
            config.logger.info(format_args!("connected to {}", peer));
        }
        Self::new(stream, config).await
    }

    async fn open(
        &self,
        kind: ChannelKind,
        window: WindowConfig,
        handler: Box<dyn ChannelHandler>,
    ) -> KestrelResult<ChannelHandle> {
        let (reply, opened) = oneshot::channel();
        self.session
            .send(Action::OpenSession {
                kind,
                window,
                handler,
                reply,
            })
            .await?;
        let opened = opened.await.map_err(|_| KestrelError::Closed)??;
        Ok(ChannelHandle::new(opened, self.session.sender()))
    }

    /// Opens a session channel and starts `spec` on it.
    ///
    /// Returns once CHANNEL_OPEN is sent; `handler` sees the confirmation,
    /// the output and the close.
    pub async fn issue_command(
        &self,
        spec: CommandSpec,
        handler: Box<dyn ChannelHandler>,
    ) -> KestrelResult<ChannelHandle> {
        let handler = CommandHandler::new(spec, self.term.clone(), handler);
        self.open(ChannelKind::Session, self.window, Box::new(handler))
            .await
    }

    /// Runs `command` without a pty and collects its output.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Channel`] if the server refuses the channel
    /// and [`KestrelError::Closed`] if the session ends first.
    pub async fn exec(&self, command: &str) -> KestrelResult<CommandOutput> {
        let (collector, done) = OutputCollector::new();
        let handle = self
            .issue_command(CommandSpec::exec(command), Box::new(collector))
            .await?;
        match done.await {
            Ok(Ok(output)) => {
                self.logger.debug(format_args!(
                    "`{}` exited with {:?}",
                    command, output.exit_status
                ));
                Ok(output)
            }
            Ok(Err(CommandFailure::OpenFailed(reason, description))) => Err(KestrelError::Channel {
                id: handle.key().id,
                reason: format!("{} ({})", description, open_failure_reason(reason)),
            }),
            Err(_) => Err(KestrelError::Closed),
        }
    }

    /// Opens a `direct-tcpip` tunnel to `host:port` through the server.
    ///
    /// Waits for the server's answer.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Channel`] if the server refuses the tunnel.
    pub async fn open_tcp_tunnel(&self, host: &str, port: u16) -> KestrelResult<TunnelStream> {
        let (handler, opened, incoming) = TunnelHandler::new();
        let handle = self
            .open(
                ChannelKind::direct_tcpip(host, port),
                self.tunnel_window,
                Box::new(handler),
            )
            .await?;
        match opened.await {
            Ok(Ok(())) => Ok(TunnelStream::new(
                handle.key,
                handle.alive,
                handle.actions,
                incoming,
            )),
            Ok(Err((reason, description))) => Err(KestrelError::Channel {
                id: handle.key.id,
                reason: format!(
                    "tunnel to {}:{} refused: {} ({})",
                    host,
                    port,
                    description,
                    open_failure_reason(reason)
                ),
            }),
            Err(_) => Err(KestrelError::Closed),
        }
    }

    /// Returns `true` once the session loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Closes every channel, disconnects and waits for the loop to finish.
    ///
    /// Returns the error that ended the session, if it ended on its own.
    pub async fn close(&mut self) -> KestrelResult<()> {
        self.session.close().await
    }
}
