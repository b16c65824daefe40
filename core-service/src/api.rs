//! REST control surface.
//!
//! Thin HTTP triggers into the running engine:
//!
//! | Method | Path                                | Effect                         |
//! |--------|-------------------------------------|--------------------------------|
//! | POST   | `/sync_server/reset_timer`          | Run every project now          |
//! | POST   | `/sync_server/add_before_loop_cmd`  | Queue `{"command": [argv..]}`  |
//! | GET    | `/sync_server/status`               | Server state and pause flag    |

use crate::error::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use core_sync::{SiteSync, SyncError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Acknowledged {
    pub status: String,
}

impl Acknowledged {
    fn ok() -> Json<Self> {
        Json(Self {
            status: "ok".to_string(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BeforeLoopCommand {
    pub command: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerStatus {
    pub state: String,
    pub paused: bool,
    pub active_transfers: usize,
}

/// Rejected request.
struct ApiError(SyncError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            SyncError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "status": "error",
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Build the router over a shared [`SiteSync`].
pub fn router(sync: Arc<SiteSync>) -> Router {
    Router::new()
        .route("/sync_server/reset_timer", post(reset_timer))
        .route("/sync_server/add_before_loop_cmd", post(add_before_loop_cmd))
        .route("/sync_server/status", get(status))
        .with_state(sync)
}

async fn reset_timer(State(sync): State<Arc<SiteSync>>) -> Json<Acknowledged> {
    sync.reset_timer();
    Acknowledged::ok()
}

async fn add_before_loop_cmd(
    State(sync): State<Arc<SiteSync>>,
    Json(body): Json<BeforeLoopCommand>,
) -> std::result::Result<Json<Acknowledged>, ApiError> {
    sync.add_before_loop_cmd(body.command).map_err(|e| {
        warn!(error = %e, "Rejected before-loop command");
        ApiError(e)
    })?;
    Ok(Acknowledged::ok())
}

async fn status(State(sync): State<Arc<SiteSync>>) -> Json<ServerStatus> {
    let server = sync.server();
    Json(ServerStatus {
        state: server.state().as_str().to_string(),
        paused: server.is_paused(),
        active_transfers: server.active_transfers(),
    })
}

/// Serve `router` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = ?listener.local_addr().ok(), "Control API listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
