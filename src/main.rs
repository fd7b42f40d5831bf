use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use metrics_batch_forwarder::{CancellationToken, Config, FieldValue, Fields};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Polls a flux capacitor and forwards readings in batches.
///
/// Collection is started and stopped through the HTTP control API; Ctrl-C
/// flushes buffered points and exits.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Samples per second; overrides the configuration file
    #[arg(long)]
    poll_rate: Option<f64>,

    /// `InfluxDB` endpoint; overrides the configuration file
    #[arg(long)]
    influx: Option<String>,

    /// Control API address; overrides the configuration file
    #[arg(long)]
    listen: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    if let Some(poll_rate) = args.poll_rate {
        config.poll_rate = poll_rate;
    }
    if let Some(influx) = args.influx {
        config.influx_endpoint = influx;
    }
    if let Some(listen) = args.listen {
        config.listen_address = listen;
    }
    stamp_process_tags(&mut config.tags);
    info!(?config, "Loaded configuration");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let listener = runtime
        .block_on(TcpListener::bind(&config.listen_address))
        .with_context(|| format!("Bind control API; addr={}", config.listen_address))?;

    let cxl = CancellationToken::new();
    let poll_rate = config.poll_rate;
    let installed = metrics_batch_forwarder::install(cxl.clone(), config, flux_capacitor())
        .context("Install forwarder")?;
    let router = metrics_batch_forwarder::control_router(installed.commands, poll_rate);

    let served = runtime.block_on(async {
        let interrupt = cxl.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted, shutting down");
                    interrupt.cancel();
                }
                Err(err) => warn!(%err, "Failed to listen for interrupts"),
            }
        });

        metrics_batch_forwarder::serve_control(listener, router, cxl.clone()).await
    });

    cxl.cancel();
    installed
        .handle
        .join()
        .map_err(|_| anyhow::anyhow!("Forwarder thread panicked"))?;

    served.context("Serve control API")
}

/// Adds `host` and `pid` tags unless the configuration already sets them.
fn stamp_process_tags(tags: &mut BTreeMap<String, String>) {
    tags.entry("host".to_string())
        .or_insert_with(|| gethostname::gethostname().to_string_lossy().into_owned());
    tags.entry("pid".to_string())
        .or_insert_with(|| std::process::id().to_string());
}

fn flux_capacitor() -> impl FnMut() -> Fields + Send + 'static {
    let mut rng = StdRng::from_entropy();

    move || {
        // Inverse transform of a uniform sample gives an Exp(1) reading.
        let flux = -(1.0 - rng.gen::<f64>()).ln();

        BTreeMap::from_iter([
            ("charge".to_string(), FieldValue::from(rng.gen_range(0..i32::MAX))),
            ("timeVariance".to_string(), FieldValue::from(rng.gen::<f32>())),
            ("flux".to_string(), FieldValue::from(flux)),
        ])
    }
}
