//! Messages endpoint.

use axum::Json;
use axum::extract::State;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use http::StatusCode;
use rotor_common::GatewayError;
use rotor_core::estimate_tokens;
use rotor_protocol::claude as wire;
use rotor_transform::claude::{ClaudeStreamState, from_canonical, to_canonical};
use rotor_transform::directive::StreamMode;
use rotor_transform::{ThinkingDisposition, parse_model};

use crate::{AppState, sse_channel};

fn error_kind(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        429 => "rate_limit_error",
        503 => "overloaded_error",
        _ => "api_error",
    }
}

fn error_response(err: &GatewayError) -> Response {
    let status = err.status();
    let body = wire::ErrorBody::new(error_kind(status), err.to_string());
    (status, Json(body)).into_response()
}

fn named_event(event: &wire::StreamEvent) -> Event {
    Event::default()
        .event(event.event_name())
        .data(serde_json::to_string(event).unwrap_or_default())
}

pub(crate) async fn messages(
    State(state): State<AppState>,
    Json(request): Json<wire::MessagesRequest>,
) -> Response {
    let directive = parse_model(&request.model);
    let canonical = match to_canonical(&request, &directive, state.settings.compatibility_mode) {
        Ok(canonical) => canonical,
        Err(err) => return error_response(&err),
    };
    // Clients that asked for thinking can render thinking blocks; all
    // others fall back per configuration.
    let disposition = match request.thinking {
        Some(wire::ThinkingConfigParam::Enabled { .. }) => ThinkingDisposition::Verbatim,
        _ => ThinkingDisposition::for_client(false, state.settings.thinking_to_text_fallback),
    };

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
                    ClaudeStreamState::new(&request.model, disposition, estimate_tokens);
                let mut events = replay.push(&response);
                events.extend(replay.finish());
                let stream = sse_channel(move |tx| async move {
                    for event in &events {
                        if tx.send(Ok(named_event(event))).await.is_err() {
                            return;
                        }
                    }
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
                let mut emitter = ClaudeStreamState::new(&model, disposition, estimate_tokens);
                for event in emitter.push(&first) {
                    if tx.send(Ok(named_event(&event))).await.is_err() {
                        return;
                    }
                }
                while let Some(item) = rx.recv().await {
                    match item {
                        Ok(chunk) => {
                            for event in emitter.push(&chunk) {
                                if tx.send(Ok(named_event(&event))).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            let event = wire::StreamEvent::Error {
                                error: wire::ErrorDetail {
                                    r#type: error_kind(err.status()).to_string(),
                                    message: err.to_string(),
                                },
                            };
                            let _ = tx.send(Ok(named_event(&event))).await;
                            return;
                        }
                    }
                }
                for event in emitter.finish() {
                    if tx.send(Ok(named_event(&event))).await.is_err() {
                        return;
                    }
                }
            });
            Sse::new(stream).into_response()
        }
    }
}
