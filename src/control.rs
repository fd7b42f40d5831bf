//! HTTP control surface.
//!
//! - `GET /control`: usage text.
//! - `POST /control` with form field `command=start|stop`: queues the command,
//!   `202` on success, `400` for anything else.
//! - `GET /rate`: the configured poll rate.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Form, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{Command, CommandError, CommandSender};

const USAGE: &str = "POST command=start to start metric collection and command=stop to stop.";

#[derive(Debug, Clone)]
struct Controller {
    commands: CommandSender,
    poll_rate: f64,
}

#[derive(Debug, Deserialize)]
struct ControlForm {
    #[serde(default)]
    command: String,
}

/// Routes feeding `commands`; `poll_rate` is reported verbatim by `/rate`.
pub fn control_router(commands: CommandSender, poll_rate: f64) -> Router {
    Router::new()
        .route("/control", get(usage).post(control))
        .route("/rate", get(rate))
        .with_state(Controller { commands, poll_rate })
}

/// Serves `router` on `listener` until `cxl` is cancelled.
///
/// # Errors
///
/// Errors if the server fails while accepting connections.
pub async fn serve_control(
    listener: TcpListener,
    router: Router,
    cxl: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr(), "Serving control API");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cxl.cancelled().await })
        .await
}

async fn usage() -> &'static str {
    info!("Showing usage");

    USAGE
}

async fn control(
    State(controller): State<Controller>,
    Form(form): Form<ControlForm>,
) -> (StatusCode, String) {
    let command = Command::parse(&form.command);
    match controller.commands.send(command).await {
        Ok(()) => {
            info!(%command, "Command received");

            (StatusCode::ACCEPTED, format!("Command {command} received."))
        }
        Err(CommandError::Unknown) => {
            warn!(raw = %form.command, "Unknown command received");

            (StatusCode::BAD_REQUEST, format!("Unknown command {:?}. {USAGE}", form.command))
        }
        Err(err) => {
            warn!(%command, %err, "Failed to queue command");

            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
    }
}

async fn rate(State(controller): State<Controller>) -> String {
    format!("{:.6}/second", controller.poll_rate)
}
