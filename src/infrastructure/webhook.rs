//! # Inbound Webhook
//!
//! Small axum server the OneBot frame server posts events to. Each message
//! event is parsed and handed to the router on its own task, so a slow
//! command never blocks event intake.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::application::dispatcher::CommandRouter;
use crate::infrastructure::onebot;

pub fn app(router: Arc<CommandRouter>) -> axum::Router {
    axum::Router::new().route("/", post(handle_event)).with_state(router)
}

async fn handle_event(
    State(router): State<Arc<CommandRouter>>,
    Json(event): Json<Value>,
) -> StatusCode {
    let Some(msg) = onebot::parse_event(&event) else {
        return StatusCode::NO_CONTENT;
    };
    tokio::spawn(async move {
        if let Err(err) = router.route(msg).await {
            error!(error = %err, "command invocation failed");
        }
    });
    StatusCode::NO_CONTENT
}

pub async fn serve(listener: TcpListener, router: Arc<CommandRouter>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "webhook listening");
    axum::serve(listener, app(router)).await?;
    Ok(())
}
