//! Native generate-content endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use http::StatusCode;
use rotor_common::{GatewayError, Settings};
use rotor_protocol::gemini::GenerateContentRequest;
use rotor_transform::directive::StreamMode;
use rotor_transform::gemini::{apply_directive, filter_thoughts, fold_system_into_first_user};
use rotor_transform::{ThinkingDisposition, catalog, parse_model};

use crate::{AppState, sse_channel};

fn status_name(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        503 => "UNAVAILABLE",
        _ => "INTERNAL",
    }
}

fn error_body(status: StatusCode, message: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "code": status.as_u16(),
            "message": message,
            "status": status_name(status),
        }
    })
}

fn error_response(err: &GatewayError) -> Response {
    let status = err.status();
    (status, Json(error_body(status, &err.to_string()))).into_response()
}

fn data_event<T: serde::Serialize>(payload: &T) -> Event {
    Event::default().data(serde_json::to_string(payload).unwrap_or_default())
}

/// Callers that send their own `thinkingConfig` can render thought
/// parts; everyone else gets the configured fallback.
fn disposition_for(request: &GenerateContentRequest, settings: &Settings) -> ThinkingDisposition {
    let declares_thinking = request
        .generation_config
        .as_ref()
        .and_then(|config| config.thinking_config.as_ref())
        .is_some();
    ThinkingDisposition::for_client(declares_thinking, settings.thinking_to_text_fallback)
}

pub(crate) async fn list_models() -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = catalog::model_ids()
        .into_iter()
        .map(|id| {
            serde_json::json!({
                "name": format!("models/{id}"),
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();
    Json(serde_json::json!({ "models": models }))
}

/// The path carries both model and verb as `{model}:{action}`.
pub(crate) async fn model_action(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    Json(mut request): Json<GenerateContentRequest>,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        let status = StatusCode::NOT_FOUND;
        return (
            status,
            Json(error_body(status, &format!("unknown path {model_action}"))),
        )
            .into_response();
    };

    let directive = parse_model(model);
    let disposition = disposition_for(&request, &state.settings);
    apply_directive(&mut request, &directive);
    if state.settings.compatibility_mode {
        fold_system_into_first_user(&mut request);
    }

    match action {
        "generateContent" => match state.dispatcher.generate(&directive, &request).await {
            Ok(mut response) => {
                filter_thoughts(&mut response, disposition);
                Json(response).into_response()
            }
            Err(err) => error_response(&err),
        },
        "streamGenerateContent" => {
            if directive.stream_mode == StreamMode::Buffered {
                return match state.dispatcher.generate(&directive, &request).await {
                    Ok(mut response) => {
                        filter_thoughts(&mut response, disposition);
                        let stream = sse_channel(move |tx| async move {
                            let _ = tx.send(Ok(data_event(&response))).await;
                        });
                        Sse::new(stream).into_response()
                    }
                    Err(err) => error_response(&err),
                };
            }

            let mut rx = state.dispatcher.stream(directive, request);
            match rx.recv().await {
                None => error_response(&GatewayError::UpstreamTransient {
                    status: None,
                    message: "upstream produced no data".to_string(),
                }),
                Some(Err(err)) => error_response(&err),
                Some(Ok(mut first)) => {
                    let stream = sse_channel(move |tx| async move {
                        filter_thoughts(&mut first, disposition);
                        if tx.send(Ok(data_event(&first))).await.is_err() {
                            return;
                        }
                        while let Some(item) = rx.recv().await {
                            match item {
                                Ok(mut chunk) => {
                                    filter_thoughts(&mut chunk, disposition);
                                    if tx.send(Ok(data_event(&chunk))).await.is_err() {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    let body = error_body(err.status(), &err.to_string());
                                    let _ = tx.send(Ok(data_event(&body))).await;
                                    return;
                                }
                            }
                        }
                    });
                    Sse::new(stream).into_response()
                }
            }
        }
        other => {
            let status = StatusCode::NOT_FOUND;
            (
                status,
                Json(error_body(status, &format!("unknown action {other}"))),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rotor_protocol::gemini::{GenerationConfig, ThinkingConfig};

    #[test]
    fn native_disposition_follows_declared_thinking_capability() {
        let mut request = GenerateContentRequest::default();
        let with_fallback = Settings::default();
        assert_eq!(
            disposition_for(&request, &with_fallback),
            ThinkingDisposition::TextFallback
        );

        let without_fallback = Settings {
            thinking_to_text_fallback: false,
            ..Settings::default()
        };
        assert_eq!(
            disposition_for(&request, &without_fallback),
            ThinkingDisposition::Drop
        );

        request.generation_config = Some(GenerationConfig {
            thinking_config: Some(ThinkingConfig {
                include_thoughts: true,
                thinking_budget: -1,
            }),
            ..GenerationConfig::default()
        });
        assert_eq!(
            disposition_for(&request, &without_fallback),
            ThinkingDisposition::Verbatim
        );
    }

    #[test]
    fn error_body_carries_canonical_status_names() {
        let body = error_body(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(body["error"]["code"], 429);
        assert_eq!(body["error"]["status"], "RESOURCE_EXHAUSTED");
        assert_eq!(error_body(StatusCode::BAD_REQUEST, "")["error"]["status"], "INVALID_ARGUMENT");
        assert_eq!(error_body(StatusCode::BAD_GATEWAY, "")["error"]["status"], "INTERNAL");
    }
}
