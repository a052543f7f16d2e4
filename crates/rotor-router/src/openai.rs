//! Chat-completions endpoints.

use axum::Json;
use axum::extract::State;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use rotor_common::GatewayError;
use rotor_core::estimate_tokens;
use rotor_protocol::openai as wire;
use rotor_transform::directive::StreamMode;
use rotor_transform::openai::{OpenAiStreamState, from_canonical, to_canonical};
use rotor_transform::{ThinkingDisposition, catalog, parse_model};

use crate::{AppState, sse_channel};

fn error_response(err: &GatewayError) -> Response {
    let status = err.status();
    let kind = if status.is_client_error() {
        "invalid_request_error"
    } else {
        "api_error"
    };
    let body = wire::ErrorBody::new(kind, err.to_string(), Some(err.code().to_string()));
    (status, Json(body)).into_response()
}

fn data_event<T: serde::Serialize>(payload: &T) -> Event {
    Event::default().data(serde_json::to_string(payload).unwrap_or_default())
}

pub(crate) async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<wire::ChatCompletionRequest>,
) -> Response {
    let directive = parse_model(&request.model);
    let canonical = match to_canonical(&request, &directive, state.settings.compatibility_mode) {
        Ok(canonical) => canonical,
        Err(err) => return error_response(&err),
    };
    // This surface always exposes thinking via reasoning_content.
    let disposition = ThinkingDisposition::Verbatim;

    if !request.stream.unwrap_or(false) {
        return match state.dispatcher.generate(&directive, &canonical).await {
            Ok(response) => Json(from_canonical(
                &response,
                &request.model,
                disposition,
                estimate_tokens,
            ))
            .into_response(),
            Err(err) => error_response(&err),
        };
    }

    if directive.stream_mode == StreamMode::Buffered {
        return match state.dispatcher.generate(&directive, &canonical).await {
            Ok(response) => {
                let mut replay =
                    OpenAiStreamState::new(&request.model, disposition, estimate_tokens);
                let mut chunks = replay.push(&response);
                chunks.extend(replay.finish());
                let stream = sse_channel(move |tx| async move {
                    for chunk in &chunks {
                        if tx.send(Ok(data_event(chunk))).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
                });
                Sse::new(stream).into_response()
            }
            Err(err) => error_response(&err),
        };
    }

    let mut rx = state.dispatcher.stream(directive, canonical);
    match rx.recv().await {
        None => error_response(&GatewayError::UpstreamTransient {
            status: None,
            message: "upstream produced no data".to_string(),
        }),
        Some(Err(err)) => error_response(&err),
        Some(Ok(first)) => {
            let model = request.model.clone();
            let stream = sse_channel(move |tx| async move {
                let mut emitter = OpenAiStreamState::new(&model, disposition, estimate_tokens);
                let mut failed = false;
                for chunk in emitter.push(&first) {
                    if tx.send(Ok(data_event(&chunk))).await.is_err() {
                        return;
                    }
                }
                while let Some(item) = rx.recv().await {
                    match item {
                        Ok(canonical_chunk) => {
                            for chunk in emitter.push(&canonical_chunk) {
                                if tx.send(Ok(data_event(&chunk))).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            failed = true;
                            let body = wire::ErrorBody::new(
                                "api_error",
                                err.to_string(),
                                Some(err.code().to_string()),
                            );
                            if tx.send(Ok(data_event(&body))).await.is_err() {
                                return;
                            }
                            break;
                        }
                    }
                }
                if !failed {
                    for chunk in emitter.finish() {
                        if tx.send(Ok(data_event(&chunk))).await.is_err() {
                            return;
                        }
                    }
                }
                let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
            });
            Sse::new(stream).into_response()
        }
    }
}

pub(crate) async fn list_models() -> Json<wire::ModelList> {
    let created = time::OffsetDateTime::now_utc().unix_timestamp();
    Json(wire::ModelList {
        object: "list".to_string(),
        data: catalog::model_ids()
            .into_iter()
            .map(|id| wire::ModelEntry {
                id,
                object: "model".to_string(),
                created,
                owned_by: "google".to_string(),
            })
            .collect(),
    })
}
