mod buffer;
mod command;
mod config;
mod control;
mod forwarder;
mod scheduler;
mod sink;
mod source;

use std::thread::JoinHandle;

pub use async_nats::ServerAddr;
pub use buffer::{
    iterations_in, precision_for_flow, BatchBuffer, BufferConfig, FlushSummary, SaveError,
    FLUSH_HORIZON,
};
pub use command::{channel, Command, CommandError, CommandSender, COMMAND_BUFFER, SEND_GRACE};
pub use config::{Config, ConfigError};
pub use control::{control_router, serve_control};
pub use influx_line::{BatchConfig, BatchPoints, FieldValue, Point, Precision};
pub use scheduler::{poll_interval, Emission, PollScheduler, SchedulerError, Ticker, TickerState};
pub use sink::{InfluxSink, NatsSink, Sink, SinkError};
pub use source::{Fields, Measurement, SampleSource};
use thiserror::Error;
pub use tokio_util::sync::CancellationToken;

/// Starts the forwarder on a dedicated thread.
///
/// The sink is connected (and, for `InfluxDB`, the database created) before
/// this returns. Polling begins once [`Command::Start`] is sent on the
/// returned [`CommandSender`]; cancelling `cxl` flushes what is buffered and
/// ends the thread.
///
/// # Errors
///
/// Errors if the poll rate is unusable, the sink cannot be reached, or the
/// worker thread cannot be spawned.
pub fn install<S>(
    cxl: CancellationToken,
    config: Config,
    source: S,
) -> Result<Installed, InstallError>
where
    S: SampleSource + Send + 'static,
{
    let (commands, rx) = command::channel();
    let handle = forwarder::Forwarder::spawn(cxl, config, source, rx)?;

    Ok(Installed { handle, commands })
}

pub struct Installed {
    pub handle: JoinHandle<()>,
    pub commands: CommandSender,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Spawn thread; err={0}")]
    SpawnThread(#[from] std::io::Error),
    #[error("Build scheduler; err={0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Parse server address; addr={addr}; err={source}")]
    ServerAddr { addr: String, source: std::io::Error },
    #[error("Connect sink; err={0}")]
    Sink(#[from] SinkError),
    #[error("Forwarder thread exited during setup")]
    SetupAborted,
}
