use std::sync::Arc;
use std::thread::JoinHandle;

use async_nats::ServerAddr;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::buffer::{BatchBuffer, BufferConfig};
use crate::command::Command;
use crate::scheduler::{Emission, PollScheduler};
use crate::sink::{InfluxSink, NatsSink, Sink};
use crate::source::{Measurement, SampleSource};
use crate::{Config, InstallError};

/// Moves measurements from the scheduler into the buffer until cancelled.
pub(crate) struct Forwarder<S> {
    scheduler: PollScheduler<S>,
    buffer: BatchBuffer,
}

impl<S> Forwarder<S>
where
    S: SampleSource + Send + 'static,
{
    pub(crate) fn spawn(
        cxl: CancellationToken,
        config: Config,
        source: S,
        commands: mpsc::Receiver<Command>,
    ) -> Result<JoinHandle<()>, InstallError> {
        let scheduler = PollScheduler::new(commands, config.poll_rate, source)?
            .with_measurement(config.metric_name.clone(), config.tags.clone())
            .with_cancellation(cxl);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        // Sink setup runs on the worker's runtime; its outcome is reported back
        // before returning.
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let handle = std::thread::Builder::new()
            .name("MetricsForwarder".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let sink = match connect_sink(&config).await {
                        Ok(sink) => sink,
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));

                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));

                    let buffer = BatchBuffer::new(
                        sink,
                        BufferConfig {
                            database: config.database,
                            retention_policy: config.retention_policy,
                            expected_flow: config.poll_rate,
                        },
                    );
                    Forwarder { scheduler, buffer }.run().await;
                });
            })?;

        ready_rx.recv().map_err(|_| InstallError::SetupAborted)??;

        Ok(handle)
    }

    async fn run(self) {
        let Forwarder { scheduler, buffer } = self;
        info!(
            interval = ?scheduler.interval(),
            capacity = buffer.capacity(),
            precision = %buffer.precision(),
            "Forwarder waiting for start command"
        );

        let mut events = std::pin::pin!(scheduler.events());
        while let Some(emission) = events.next().await {
            match emission {
                Emission::Sample(Measurement { name, tags, fields, timestamp }) => {
                    if let Err(err) = buffer.save_point(&name, tags, fields, timestamp).await {
                        warn!(%err, "Failed to save point");
                    }
                }
                Emission::Stopped => {
                    let summary = buffer.flush().await;
                    info!(?summary, "Collection stopped, flushed buffer");
                }
            }
        }

        let summary = buffer.shutdown().await;
        info!(?summary, "Forwarder stopped");
    }
}

async fn connect_sink(config: &Config) -> Result<Arc<dyn Sink>, InstallError> {
    if config.nats_servers.is_empty() {
        let sink = InfluxSink::new(
            &config.influx_endpoint,
            config.username.clone(),
            config.password.clone(),
        );
        sink.create_database(&config.database).await?;

        return Ok(Arc::new(sink));
    }

    let servers = config
        .nats_servers
        .iter()
        .map(|addr| {
            addr.parse::<ServerAddr>()
                .map_err(|source| InstallError::ServerAddr { addr: addr.clone(), source })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let sink = NatsSink::connect(servers, config.nats_subject.clone()).await?;

    Ok(Arc::new(sink))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use influx_line::FieldValue;

    use super::*;
    use crate::command;
    use crate::sink::memory::MemorySink;
    use crate::source::Fields;

    fn host_tags() -> BTreeMap<String, String> {
        BTreeMap::from_iter([("host".to_string(), "a".to_string())])
    }

    fn forwarder<F>(
        sink: &Arc<MemorySink>,
        cxl: &CancellationToken,
        source: F,
    ) -> (command::CommandSender, Forwarder<F>)
    where
        F: FnMut() -> Fields,
    {
        let (tx, rx) = command::channel();
        let scheduler = PollScheduler::new(rx, 10.0, source)
            .unwrap()
            .with_measurement("flux", host_tags())
            .with_cancellation(cxl.clone());
        let buffer = BatchBuffer::new(
            Arc::clone(sink) as Arc<dyn Sink>,
            BufferConfig {
                database: "db".to_string(),
                retention_policy: None,
                expected_flow: 10.0,
            },
        );

        (tx, Forwarder { scheduler, buffer })
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_until_cancelled_then_flushes() {
        let sink = Arc::new(MemorySink::default());
        let cxl = CancellationToken::new();
        let (tx, forwarder) = forwarder(&sink, &cxl, || {
            Fields::from_iter([("v".to_string(), FieldValue::Integer(1))])
        });
        let task = tokio::spawn(forwarder.run());

        tx.send(Command::Start).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1050)).await;
        cxl.cancel();
        task.await.unwrap();

        let points: usize = sink.written().iter().map(|batch| batch.len()).sum();
        assert!((9..=11).contains(&points), "points={points}");
        assert!(sink.written().iter().all(|batch| batch.database() == "db"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_partial_batch() {
        let sink = Arc::new(MemorySink::default());
        let cxl = CancellationToken::new();
        let (tx, forwarder) = forwarder(&sink, &cxl, || {
            Fields::from_iter([("v".to_string(), FieldValue::Integer(1))])
        });
        let task = tokio::spawn(forwarder.run());

        tx.send(Command::Start).await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        tx.send(Command::Stop).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let points: usize = sink.written().iter().map(|batch| batch.len()).sum();
        assert!((2..=4).contains(&points), "points={points}");
        assert!(!task.is_finished());

        cxl.cancel();
        task.await.unwrap();
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_samples_are_skipped() {
        let sink = Arc::new(MemorySink::default());
        let cxl = CancellationToken::new();
        let (tx, forwarder) = forwarder(&sink, &cxl, Fields::new);
        let task = tokio::spawn(forwarder.run());

        tx.send(Command::Start).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        cxl.cancel();
        task.await.unwrap();

        assert!(sink.written().is_empty());
        assert_eq!(sink.calls(), 0);
    }

    #[test]
    fn invalid_poll_rate_fails_install() {
        let (_tx, rx) = command::channel();
        let config = Config { poll_rate: 0.0, ..Config::default() };

        let err = Forwarder::spawn(CancellationToken::new(), config, Fields::new, rx).unwrap_err();

        assert!(matches!(err, InstallError::Scheduler(_)), "{err}");
    }

    #[test]
    fn invalid_nats_server_fails_install() {
        let (_tx, rx) = command::channel();
        let config = Config {
            nats_servers: vec!["ftp://localhost:4222".to_string()],
            ..Config::default()
        };

        let err = Forwarder::spawn(CancellationToken::new(), config, Fields::new, rx).unwrap_err();

        assert!(matches!(err, InstallError::ServerAddr { .. }), "{err}");
    }
}
