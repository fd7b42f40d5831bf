use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

/// Commands buffered between the control surface and the scheduler.
pub const COMMAND_BUFFER: usize = 5;
/// How long [`CommandSender::send`] waits for buffer space.
pub const SEND_GRACE: Duration = Duration::from_secs(1);

/// Operator command understood by the poll scheduler.
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Start,
    Stop,
    /// Queries the scheduler without changing its state.
    Unknown,
}

impl Command {
    /// Translates operator input; anything unrecognised is [`Command::Unknown`].
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("start") {
            Command::Start
        } else if raw.eq_ignore_ascii_case("stop") {
            Command::Stop
        } else {
            Command::Unknown
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::Unknown => "UNKNOWN",
        })
    }
}

/// Creates the bounded command channel feeding a single scheduler.
#[must_use]
pub fn channel() -> (CommandSender, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

    (CommandSender { tx, grace: SEND_GRACE }, rx)
}

/// Producer half held by the control surface.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Command>,
    grace: Duration,
}

impl CommandSender {
    /// Queues `command`, waiting at most [`SEND_GRACE`] for buffer space.
    ///
    /// # Errors
    ///
    /// Errors if the command is [`Command::Unknown`], the buffer stays full,
    /// or the scheduler is gone.
    pub async fn send(&self, command: Command) -> Result<(), CommandError> {
        if command == Command::Unknown {
            return Err(CommandError::Unknown);
        }

        self.tx
            .send_timeout(command, self.grace)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => CommandError::Full,
                SendTimeoutError::Closed(_) => CommandError::Closed,
            })
    }

    /// Queues `command` without waiting.
    ///
    /// # Errors
    ///
    /// Same as [`CommandSender::send`], except a full buffer fails immediately.
    pub fn try_send(&self, command: Command) -> Result<(), CommandError> {
        if command == Command::Unknown {
            return Err(CommandError::Unknown);
        }

        self.tx.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => CommandError::Full,
            TrySendError::Closed(_) => CommandError::Closed,
        })
    }
}

/// Possible failure while queueing a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Unknown commands are not accepted")]
    Unknown,
    #[error("Command buffer is full")]
    Full,
    #[error("Scheduler is no longer receiving commands")]
    Closed,
}
