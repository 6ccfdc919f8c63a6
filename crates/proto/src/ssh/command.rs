//! Remote commands and shells on session channels.

use crate::ssh::channel::{ChannelContext, ChannelHandler};
use crate::ssh::connection::{ChannelRequestType, EXTENDED_DATA_STDERR};
use tokio::sync::oneshot;

/// What to start on a session channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    /// Command line for `exec`; `None` starts the login shell
    pub command: Option<String>,
    /// Request a pseudo-terminal first
    pub pty: bool,
}

impl CommandSpec {
    /// Runs `command` without a pty.
    pub fn exec(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            pty: false,
        }
    }

    /// Starts an interactive shell on a pty.
    pub fn shell() -> Self {
        Self {
            command: None,
            pty: true,
        }
    }

    /// Sets the pty flag.
    pub fn with_pty(mut self, pty: bool) -> Self {
        self.pty = pty;
        self
    }
}

/// Starts a [`CommandSpec`] once the channel opens, then forwards every
/// event to the application's handler.
///
/// If the server refuses the `shell` or `exec` request the channel is
/// closed.
pub struct CommandHandler {
    spec: CommandSpec,
    term: String,
    awaiting_start: bool,
    inner: Box<dyn ChannelHandler>,
}

impl CommandHandler {
    /// Wraps `inner`; `term` is sent in the pty-req.
    pub fn new(spec: CommandSpec, term: impl Into<String>, inner: Box<dyn ChannelHandler>) -> Self {
        Self {
            spec,
            term: term.into(),
            awaiting_start: false,
            inner,
        }
    }
}

impl ChannelHandler for CommandHandler {
    fn on_open_confirmation(&mut self, ctx: &mut ChannelContext) {
        if self.spec.pty {
            ctx.request(ChannelRequestType::pty(self.term.clone()), false);
        }
        let start = match &self.spec.command {
            Some(command) => ChannelRequestType::Exec {
                command: command.clone(),
            },
            None => ChannelRequestType::Shell,
        };
        ctx.request(start, true);
        self.awaiting_start = true;
        self.inner.on_open_confirmation(ctx);
    }

    fn on_open_failure(&mut self, reason: u32, description: &str) {
        self.inner.on_open_failure(reason, description);
    }

    fn on_data(&mut self, ctx: &mut ChannelContext, data: &[u8]) {
        self.inner.on_data(ctx, data);
    }

    fn on_extended_data(&mut self, ctx: &mut ChannelContext, data_type: u32, data: &[u8]) {
        self.inner.on_extended_data(ctx, data_type, data);
    }

    fn on_eof(&mut self, ctx: &mut ChannelContext) {
        self.inner.on_eof(ctx);
    }

    fn on_close(&mut self) {
        self.inner.on_close();
    }

    fn on_success(&mut self, ctx: &mut ChannelContext) {
        self.awaiting_start = false;
        self.inner.on_success(ctx);
    }

    fn on_failure(&mut self, ctx: &mut ChannelContext) {
        if self.awaiting_start {
            self.awaiting_start = false;
            ctx.close();
        }
        self.inner.on_failure(ctx);
    }

    fn on_exit_status(&mut self, exit_status: u32) {
        self.inner.on_exit_status(exit_status);
    }
}

/// Everything a finished command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// CHANNEL_DATA bytes
    pub stdout: Vec<u8>,
    /// Extended data bytes of type stderr
    pub stderr: Vec<u8>,
    /// Exit status, if the server reported one
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    /// `true` if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Why a command produced no output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFailure {
    /// CHANNEL_OPEN_FAILURE reason code and description
    OpenFailed(u32, String),
}

/// Collects the output of one command and hands it over on close.
#[derive(Debug)]
pub struct OutputCollector {
    output: CommandOutput,
    done: Option<oneshot::Sender<Result<CommandOutput, CommandFailure>>>,
}

impl OutputCollector {
    /// Creates a collector and the receiver its result arrives on.
    pub fn new() -> (Self, oneshot::Receiver<Result<CommandOutput, CommandFailure>>) {
        let (done, rx) = oneshot::channel();
        (
            Self {
                output: CommandOutput::default(),
                done: Some(done),
            },
            rx,
        )
    }

    fn finish(&mut self, result: Result<CommandOutput, CommandFailure>) {
        if let Some(done) = self.done.take() {
            // Nobody waiting is fine
            let _ = done.send(result);
        }
    }
}

impl ChannelHandler for OutputCollector {
    fn on_open_failure(&mut self, reason: u32, description: &str) {
        self.finish(Err(CommandFailure::OpenFailed(reason, description.to_string())));
    }

    fn on_data(&mut self, _ctx: &mut ChannelContext, data: &[u8]) {
        self.output.stdout.extend_from_slice(data);
    }

    fn on_extended_data(&mut self, _ctx: &mut ChannelContext, data_type: u32, data: &[u8]) {
        if data_type == EXTENDED_DATA_STDERR {
            self.output.stderr.extend_from_slice(data);
        }
    }

    fn on_close(&mut self) {
        let output = std::mem::take(&mut self.output);
        self.finish(Ok(output));
    }

    fn on_exit_status(&mut self, exit_status: u32) {
        self.output.exit_status = Some(exit_status);
    }
}
