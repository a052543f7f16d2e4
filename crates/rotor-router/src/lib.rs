//! HTTP surface: one axum router speaking all three client protocols.

use std::sync::Arc;

use axum::Router;
use axum::response::sse::Event;
use axum::routing::{get, post};
use rotor_common::Settings;
use rotor_core::Dispatcher;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

mod claude;
mod gemini;
mod openai;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub settings: Settings,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/models", get(openai::list_models))
        .route("/v1/messages", post(claude::messages))
        .route("/v1beta/models", get(gemini::list_models))
        .route("/v1beta/models/{model_action}", post(gemini::model_action))
        .with_state(state)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

/// Bridge a producer task to an axum SSE body. The producer gets the
/// sender; dropping the receiver (client disconnect) ends it.
pub(crate) fn sse_channel<F, Fut>(
    producer: F,
) -> ReceiverStream<Result<Event, std::convert::Infallible>>
where
    F: FnOnce(mpsc::Sender<Result<Event, std::convert::Infallible>>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(producer(tx));
    ReceiverStream::new(rx)
}
