//! Cloud Code Assist upstream HTTP.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use rand::RngCore;
use rotor_common::{GatewayError, GatewayResult, Settings};
use rotor_pool::Lease;
use rotor_protocol::gemini::{GenerateContentRequest, GenerateContentResponse, WrappedResponse};

const DEFAULT_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
const GENERATE_PATH: &str = "/v1internal:generateContent";
const STREAM_GENERATE_PATH: &str = "/v1internal:streamGenerateContent?alt=sse";

/// Seam between the dispatcher and the wire; tests script this.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn generate(
        &self,
        lease: &Lease,
        model: &str,
        request: &GenerateContentRequest,
    ) -> GatewayResult<GenerateContentResponse>;

    async fn stream_generate(
        &self,
        lease: &Lease,
        model: &str,
        request: &GenerateContentRequest,
    ) -> GatewayResult<BoxStream<'static, GatewayResult<Bytes>>>;
}

pub struct UpstreamClient {
    client: wreq::Client,
    base_url: String,
    request_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(settings: &Settings) -> GatewayResult<Self> {
        Self::with_base_url(settings, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(settings: &Settings, base_url: impl Into<String>) -> GatewayResult<Self> {
        let client = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()
            .map_err(|err| GatewayError::Config(format!("building upstream client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
        })
    }

    fn request_for(
        &self,
        lease: &Lease,
        model: &str,
        request: &GenerateContentRequest,
        path: &str,
    ) -> wreq::RequestBuilder {
        let body = serde_json::json!({
            "model": model,
            "project": lease.project_id.as_deref().unwrap_or_default(),
            "user_prompt_id": generate_user_prompt_id(),
            "request": request,
        });
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&lease.access_token)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("User-Agent", lease.family.user_agent())
            .header("Accept-Encoding", "gzip")
            .json(&body)
    }
}

#[async_trait]
impl Upstream for UpstreamClient {
    async fn generate(
        &self,
        lease: &Lease,
        model: &str,
        request: &GenerateContentRequest,
    ) -> GatewayResult<GenerateContentResponse> {
        let response = self
            .request_for(lease, model, request, GENERATE_PATH)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(error_for_status(status, &response_text(response).await));
        }
        let raw = response_text(response).await;
        parse_response(&raw)
    }

    async fn stream_generate(
        &self,
        lease: &Lease,
        model: &str,
        request: &GenerateContentRequest,
    ) -> GatewayResult<BoxStream<'static, GatewayResult<Bytes>>> {
        let response = self
            .request_for(lease, model, request, STREAM_GENERATE_PATH)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(error_for_status(status, &response_text(response).await));
        }
        Ok(response
            .bytes_stream()
            .map(|item| {
                item.map_err(|err| GatewayError::UpstreamTransient {
                    status: None,
                    message: format!("upstream stream failed: {err}"),
                })
            })
            .boxed())
    }
}

async fn response_text(response: wreq::Response) -> String {
    response.text().await.unwrap_or_default()
}

/// Accepts both the wrapped internal shape and a bare response.
pub fn parse_response(raw: &str) -> GatewayResult<GenerateContentResponse> {
    if let Ok(wrapped) = serde_json::from_str::<WrappedResponse>(raw) {
        return Ok(wrapped.response);
    }
    serde_json::from_str(raw).map_err(|err| GatewayError::UpstreamTransient {
        status: None,
        message: format!("unparsable upstream response: {err}"),
    })
}

fn transport_error(err: wreq::Error) -> GatewayError {
    GatewayError::UpstreamTransient {
        status: None,
        message: format!("upstream request failed: {err}"),
    }
}

fn error_for_status(status: u16, body: &str) -> GatewayError {
    match status {
        429 => GatewayError::UpstreamRateLimited {
            retry_after_ms: None,
        },
        400 | 401 | 403 => GatewayError::UpstreamAuth {
            status,
            message: truncate_body(body),
        },
        _ => GatewayError::UpstreamTransient {
            status: Some(status),
            message: truncate_body(body),
        },
    }
}

fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 2048;
    if body.len() <= LIMIT {
        body.to_string()
    } else {
        let mut end = LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_string()
    }
}

fn generate_user_prompt_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
