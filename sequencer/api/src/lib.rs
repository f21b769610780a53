//! HTTP surface for indexers: block submission and an event stream.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bitgate_inject::{Ack, BlockSink, CacheError};
use bitgate_runtime::AttestedBlock;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("server already started")]
    AlreadyStarted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct ApiState<S: BlockSink> {
    sink: Arc<S>,
    stop: watch::Receiver<bool>,
}

impl<S: BlockSink> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            stop: self.stop.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

struct Rejection(CacheError);

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = match self.0 {
            CacheError::Rejected(_) | CacheError::InvalidInjectedTx { .. } => StatusCode::BAD_REQUEST,
            CacheError::Marshal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

async fn send_block<S: BlockSink + 'static>(
    State(state): State<ApiState<S>>,
    Json(block): Json<AttestedBlock>,
) -> Result<Json<Ack>, Rejection> {
    state.sink.send_block(block).await.map(Json).map_err(|e| {
        warn!(error = %e, "block submission refused");
        Rejection(e)
    })
}

#[derive(Debug, Deserialize)]
struct EventQuery {
    event_type: Option<String>,
}

async fn events<S: BlockSink + 'static>(
    State(state): State<ApiState<S>>,
    Query(q): Query<EventQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.sink.subscribe(q.event_type);
    // streams end with the server so graceful shutdown can finish
    let stream = futures::stream::unfold((rx, state.stop), |(mut rx, mut stop)| async move {
        let event = tokio::select! {
            event = rx.recv() => event?,
            _ = stopped(&mut stop) => return None,
        };
        let sse = Event::default()
            .event(event.event_type.clone())
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().comment("unencodable event"));
        Some((Ok(sse), (rx, stop)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn healthz() -> &'static str {
    "ok"
}

pub fn router<S: BlockSink + 'static>(sink: Arc<S>, stop: watch::Receiver<bool>) -> Router {
    Router::new()
        .route("/v1/blocks", post(send_block::<S>))
        .route("/v1/events", get(events::<S>))
        .route("/healthz", get(healthz))
        .with_state(ApiState { sink, stop })
}

/// Serves the router once. `shutdown` may be called any number of times
/// and from any task.
pub struct ApiServer<S: BlockSink + 'static> {
    sink: Arc<S>,
    started: AtomicBool,
    stop: watch::Sender<bool>,
}

impl<S: BlockSink + 'static> ApiServer<S> {
    pub fn new(sink: Arc<S>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            sink,
            started: AtomicBool::new(false),
            stop,
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !*self.stop.borrow()
    }

    /// Runs until `shutdown`. A second call fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ApiError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ApiError::AlreadyStarted);
        }
        info!("bitgate api listening on {}", listener.local_addr()?);
        let mut stop = self.stop.subscribe();
        let app = router(Arc::clone(&self.sink), self.stop.subscribe());
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                stopped(&mut stop).await;
                info!("bitgate api shutting down");
            })
            .await?;
        Ok(())
    }

    /// Returns true the first time it stops a started server.
    pub fn shutdown(&self) -> bool {
        if !self.started.load(Ordering::SeqCst) {
            return false;
        }
        !self.stop.send_replace(true)
    }
}
