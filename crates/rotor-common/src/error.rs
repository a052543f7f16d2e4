use http::StatusCode;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Classified failure surface for the whole gateway.
///
/// Upstream-facing variants carry enough detail for the dispatcher to
/// decide between retry, rotation, and surfacing to the client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unsupported content: {0}")]
    UnsupportedContent(String),
    #[error("credential pool exhausted")]
    PoolExhausted,
    #[error("upstream rate limited")]
    UpstreamRateLimited { retry_after_ms: Option<u64> },
    #[error("upstream auth failure ({status}): {message}")]
    UpstreamAuth { status: u16, message: String },
    #[error("upstream transient failure: {message}")]
    UpstreamTransient {
        status: Option<u16>,
        message: String,
    },
    #[error("stream cancelled by client")]
    StreamCancelled,
    #[error("storage: {0}")]
    Storage(String),
    #[error("config: {0}")]
    Config(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::UnsupportedContent(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamAuth { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTransient { status, .. } => status
                .and_then(|code| StatusCode::from_u16(code).ok())
                .filter(|code| code.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            GatewayError::StreamCancelled => StatusCode::BAD_GATEWAY,
            GatewayError::Storage(_) | GatewayError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code; this is what clients may key on.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::UnsupportedContent(_) => "unsupported_content",
            GatewayError::PoolExhausted => "pool_exhausted",
            GatewayError::UpstreamRateLimited { .. } => "rate_limited",
            GatewayError::UpstreamAuth { .. } => "upstream_auth",
            GatewayError::UpstreamTransient { .. } => "upstream_error",
            GatewayError::StreamCancelled => "stream_cancelled",
            GatewayError::Storage(_) => "storage_error",
            GatewayError::Config(_) => "config_error",
        }
    }
}

/// Final per-request classification reported back to the credential pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    /// HTTP status that triggered the failure; feeds the auto-ban counter
    /// when it matches a configured ban code.
    AuthError(u16),
    OtherError(Option<u16>),
    /// Client went away mid-stream. Never counted toward ban thresholds.
    Cancelled,
}

impl Outcome {
    pub fn from_error(err: &GatewayError) -> Self {
        match err {
            GatewayError::UpstreamRateLimited { .. } => Outcome::RateLimited,
            GatewayError::UpstreamAuth { status, .. } => Outcome::AuthError(*status),
            GatewayError::UpstreamTransient { status, .. } => Outcome::OtherError(*status),
            GatewayError::StreamCancelled => Outcome::Cancelled,
            _ => Outcome::OtherError(None),
        }
    }
}
