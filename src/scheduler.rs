use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use futures::{future, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::command::Command;
use crate::source::{Measurement, SampleSource};

/// Whether the ticker currently owns an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerState {
    Stopped,
    Running,
}

/// Start/stop state machine around a single [`Interval`].
///
/// The interval is owned here rather than by the scheduler loop so it can be
/// dropped on `Stop` and recreated on `Start` without losing track of it.
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    active: Option<Interval>,
    last: Option<Command>,
}

impl Ticker {
    #[must_use]
    pub const fn new(period: Duration) -> Self {
        Ticker { period, active: None, last: None }
    }

    /// Applies `command` and returns the interval that is active afterwards.
    ///
    /// `Start` always installs a fresh interval whose first tick is one period
    /// away, `Stop` drops the active interval and `Unknown` changes nothing.
    ///
    /// # Panics
    ///
    /// `Start` panics outside of a Tokio runtime with the time driver enabled.
    pub fn apply(&mut self, command: Command) -> Option<&mut Interval> {
        match command {
            Command::Start => {
                let mut interval = tokio::time::interval(self.period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // Skip the immediate first tick.
                interval.reset();
                self.active = Some(interval);
                self.last = Some(command);
            }
            Command::Stop => {
                self.active = None;
                self.last = Some(command);
            }
            Command::Unknown => {}
        }

        self.active.as_mut()
    }

    #[must_use]
    pub const fn state(&self) -> TickerState {
        match self.active.is_some() {
            true => TickerState::Running,
            false => TickerState::Stopped,
        }
    }

    /// Last `Start` or `Stop` applied, if any.
    #[must_use]
    pub const fn last_command(&self) -> Option<Command> {
        self.last
    }

    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }
}

/// Converts a samples-per-second rate into the tick period.
///
/// The sign of `poll_per_second` is ignored.
///
/// # Errors
///
/// Errors if the rate does not yield a positive, representable period.
pub fn poll_interval(poll_per_second: f64) -> Result<Duration, SchedulerError> {
    let rate = poll_per_second.abs();
    match Duration::try_from_secs_f64(rate.recip()) {
        Ok(period) if !period.is_zero() => Ok(period),
        _ => Err(SchedulerError::InvalidPollRate(poll_per_second)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SchedulerError {
    #[error("Poll rate does not give a usable interval; rate={0}")]
    InvalidPollRate(f64),
}

/// Item of [`PollScheduler::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Sample(Measurement),
    /// A `Stop` ended a running collection.
    Stopped,
}

/// Turns a command stream into a stream of measurements.
pub struct PollScheduler<S> {
    commands: mpsc::Receiver<Command>,
    accepting: bool,
    ticker: Ticker,
    source: S,
    name: String,
    tags: BTreeMap<String, String>,
    cxl: CancellationToken,
}

enum Wake {
    Cancelled,
    Tick,
    Command(Option<Command>),
}

impl<S> PollScheduler<S>
where
    S: SampleSource,
{
    /// Creates a stopped scheduler.
    ///
    /// # Errors
    ///
    /// Errors if `poll_per_second` is unusable, see [`poll_interval`].
    pub fn new(
        commands: mpsc::Receiver<Command>,
        poll_per_second: f64,
        source: S,
    ) -> Result<Self, SchedulerError> {
        let period = poll_interval(poll_per_second)?;
        info!(?period, "Setting poll interval");

        Ok(PollScheduler {
            commands,
            accepting: true,
            ticker: Ticker::new(period),
            source,
            name: "measurement".to_string(),
            tags: BTreeMap::new(),
            cxl: CancellationToken::new(),
        })
    }

    /// Sets the name and tags stamped on every emitted measurement.
    #[must_use]
    pub fn with_measurement(
        mut self,
        name: impl Into<String>,
        tags: BTreeMap<String, String>,
    ) -> Self {
        self.name = name.into();
        self.tags = tags;
        self
    }

    /// Ends the measurement stream once `cxl` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, cxl: CancellationToken) -> Self {
        self.cxl = cxl;
        self
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.ticker.period()
    }

    #[must_use]
    pub const fn state(&self) -> TickerState {
        self.ticker.state()
    }

    /// Emits one measurement per tick once started.
    ///
    /// Nothing is emitted before the first `Start`. The stream ends on
    /// cancellation, or when the command channel closes while stopped.
    pub fn run(self) -> impl Stream<Item = Measurement> {
        self.events().filter_map(|emission| {
            future::ready(match emission {
                Emission::Sample(measurement) => Some(measurement),
                Emission::Stopped => None,
            })
        })
    }

    /// Like [`PollScheduler::run`], but also reports each running to stopped
    /// transition as [`Emission::Stopped`].
    pub fn events(self) -> impl Stream<Item = Emission> {
        futures::stream::unfold(self, |mut scheduler| async move {
            let emission = scheduler.next_emission().await?;

            Some((emission, scheduler))
        })
    }

    async fn next_emission(&mut self) -> Option<Emission> {
        loop {
            let event = match self.ticker.apply(Command::Unknown) {
                // Unbiased so neither ticks nor commands can starve the other.
                Some(interval) => tokio::select! {
                    () = self.cxl.cancelled() => Wake::Cancelled,
                    _ = interval.tick() => Wake::Tick,
                    command = self.commands.recv(), if self.accepting => Wake::Command(command),
                },
                None => tokio::select! {
                    () = self.cxl.cancelled() => Wake::Cancelled,
                    command = self.commands.recv(), if self.accepting => Wake::Command(command),
                },
            };

            match event {
                Wake::Cancelled => return None,
                Wake::Tick => return Some(Emission::Sample(self.sample())),
                Wake::Command(Some(command)) => {
                    let was = self.ticker.state();
                    self.apply(command);
                    if was == TickerState::Running && self.ticker.state() == TickerState::Stopped {
                        return Some(Emission::Stopped);
                    }
                }
                Wake::Command(None) => {
                    self.accepting = false;
                    if self.ticker.state() == TickerState::Stopped {
                        info!("Command channel closed while stopped");

                        return None;
                    }
                    debug!("Command channel closed; polling until cancelled");
                }
            }
        }
    }

    fn apply(&mut self, command: Command) {
        self.ticker.apply(command);
        info!(%command, state = ?self.ticker.state(), "Applied command");
    }

    fn sample(&mut self) -> Measurement {
        Measurement {
            name: self.name.clone(),
            tags: self.tags.clone(),
            fields: self.source.sample(),
            timestamp: SystemTime::now(),
        }
    }
}
