//! Per-request dispatch.
//!
//! One dispatcher instance serves the whole process. Every request walks
//! the same path: acquire a credential, issue the upstream call, report
//! the outcome exactly once per attempt, and retry with rotation where
//! the failure class allows it. Streaming requests additionally run
//! under the truncation guard.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rotor_common::{GatewayError, GatewayResult, Outcome, Settings};
use rotor_pool::CredentialPool;
use rotor_protocol::gemini::{
    Candidate, Content, ContentRole, FinishReason, GenerateContentRequest, GenerateContentResponse,
};
use rotor_protocol::sse::SseParser;
use rotor_transform::directive::{ModelDirective, StreamMode};
use tokio::sync::mpsc;

use crate::truncation::{Decision, TruncationGuard, default_predicate};
use crate::upstream::{Upstream, parse_response};

/// Canonical chunks on their way to a protocol re-emitter. An `Err` item
/// is terminal.
pub type CanonicalStream = mpsc::Receiver<GatewayResult<GenerateContentResponse>>;

struct RetryBudget {
    rate_limit_left: u32,
    auth_left: u32,
    transient_left: u32,
}

pub struct Dispatcher {
    pool: Arc<CredentialPool>,
    upstream: Arc<dyn Upstream>,
    settings: Settings,
}

impl Dispatcher {
    pub fn new(pool: Arc<CredentialPool>, upstream: Arc<dyn Upstream>, settings: Settings) -> Self {
        Self {
            pool,
            upstream,
            settings,
        }
    }

    fn fresh_budget(&self) -> RetryBudget {
        RetryBudget {
            rate_limit_left: self.settings.retry_429_max_retries,
            auth_left: 1,
            transient_left: 1,
        }
    }

    /// Whether `err` is worth another attempt on a rotated credential,
    /// sleeping first for rate limits.
    async fn consume_retry(&self, err: &GatewayError, budget: &mut RetryBudget) -> bool {
        match err {
            GatewayError::UpstreamRateLimited { retry_after_ms } if budget.rate_limit_left > 0 => {
                budget.rate_limit_left -= 1;
                let wait = retry_after_ms.unwrap_or(self.settings.retry_429_interval_ms);
                tokio::time::sleep(Duration::from_millis(wait)).await;
                true
            }
            GatewayError::UpstreamAuth { .. } if budget.auth_left > 0 => {
                budget.auth_left -= 1;
                true
            }
            GatewayError::UpstreamTransient { .. } if budget.transient_left > 0 => {
                budget.transient_left -= 1;
                true
            }
            _ => false,
        }
    }

    /// Non-streaming call with retry and rotation.
    pub async fn generate(
        &self,
        directive: &ModelDirective,
        request: &GenerateContentRequest,
    ) -> GatewayResult<GenerateContentResponse> {
        let mut budget = self.fresh_budget();
        loop {
            let lease = self.pool.acquire().await?;
            match self
                .upstream
                .generate(&lease, &directive.base_model, request)
                .await
            {
                Ok(response) => {
                    self.pool.report(&lease.name, &Outcome::Success).await;
                    return Ok(response);
                }
                Err(err) => {
                    self.pool
                        .report(&lease.name, &Outcome::from_error(&err))
                        .await;
                    tracing::warn!(credential = %lease.name, %err, "upstream call failed");
                    if !self.consume_retry(&err, &mut budget).await {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Streaming call. Chunks arrive on the returned channel; dropping
    /// the receiver cancels the request.
    pub fn stream(
        self: &Arc<Self>,
        directive: ModelDirective,
        request: GenerateContentRequest,
    ) -> CanonicalStream {
        let (tx, rx) = mpsc::channel(32);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_stream(directive, request, tx).await;
        });
        rx
    }

    async fn run_stream(
        &self,
        directive: ModelDirective,
        request: GenerateContentRequest,
        tx: mpsc::Sender<GatewayResult<GenerateContentResponse>>,
    ) {
        let mut guard = if directive.stream_mode == StreamMode::AntiTruncation {
            TruncationGuard::new(self.settings.anti_truncation_max_attempts, default_predicate)
        } else {
            TruncationGuard::inactive()
        };

        let mut current = request.clone();
        loop {
            match self
                .stream_attempt(&directive.base_model, &current, &tx, &mut guard)
                .await
            {
                Ok(AttemptEnd::Cancelled) => return,
                Ok(AttemptEnd::Complete) => match guard.attempt_complete() {
                    Decision::Done => return,
                    Decision::Resume => {
                        tracing::info!(
                            attempts = guard.attempts().len(),
                            "stream truncated, resuming"
                        );
                        current = guard.continuation_request(&request);
                    }
                    Decision::Exhausted => {
                        // Out of attempts; close the stream as length-limited.
                        let _ = tx.send(Ok(length_limited_chunk())).await;
                        return;
                    }
                },
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
    }

    async fn stream_attempt(
        &self,
        model: &str,
        request: &GenerateContentRequest,
        tx: &mpsc::Sender<GatewayResult<GenerateContentResponse>>,
        guard: &mut TruncationGuard,
    ) -> GatewayResult<AttemptEnd> {
        let inactivity = Duration::from_secs(self.settings.stream_inactivity_timeout_secs);
        let total = Duration::from_secs(self.settings.streaming_timeout_secs);
        let mut budget = self.fresh_budget();

        'acquire: loop {
            let lease = self.pool.acquire().await?;
            let mut byte_stream = match self.upstream.stream_generate(&lease, model, request).await
            {
                Ok(stream) => stream,
                Err(err) => {
                    self.pool
                        .report(&lease.name, &Outcome::from_error(&err))
                        .await;
                    tracing::warn!(credential = %lease.name, %err, "stream open failed");
                    if self.consume_retry(&err, &mut budget).await {
                        continue 'acquire;
                    }
                    return Err(err);
                }
            };

            let mut parser = SseParser::new();
            let mut emitted = false;
            // The total budget runs from the first byte.
            let mut deadline: Option<tokio::time::Instant> = None;

            loop {
                if let Some(deadline) = deadline {
                    if tokio::time::Instant::now() >= deadline {
                        let err = GatewayError::UpstreamTransient {
                            status: None,
                            message: "streaming time budget exceeded".to_string(),
                        };
                        self.pool
                            .report(&lease.name, &Outcome::from_error(&err))
                            .await;
                        return Err(err);
                    }
                }
                let item = match tokio::time::timeout(inactivity, byte_stream.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        let err = GatewayError::UpstreamTransient {
                            status: None,
                            message: "upstream stream stalled".to_string(),
                        };
                        self.pool
                            .report(&lease.name, &Outcome::from_error(&err))
                            .await;
                        if !emitted && self.consume_retry(&err, &mut budget).await {
                            continue 'acquire;
                        }
                        return Err(err);
                    }
                };
                match item {
                    None => break,
                    Some(Err(err)) => {
                        self.pool
                            .report(&lease.name, &Outcome::from_error(&err))
                            .await;
                        if !emitted && self.consume_retry(&err, &mut budget).await {
                            continue 'acquire;
                        }
                        return Err(err);
                    }
                    Some(Ok(bytes)) => {
                        if deadline.is_none() {
                            deadline = Some(tokio::time::Instant::now() + total);
                        }
                        for event in parser.push_bytes(&bytes) {
                            match self.forward_event(&event.data, tx, guard).await? {
                                Forward::Sent => emitted = true,
                                Forward::Skipped => {}
                                Forward::Cancelled => {
                                    self.pool.report(&lease.name, &Outcome::Cancelled).await;
                                    return Ok(AttemptEnd::Cancelled);
                                }
                            }
                        }
                    }
                }
            }
            for event in parser.finish() {
                match self.forward_event(&event.data, tx, guard).await? {
                    Forward::Sent | Forward::Skipped => {}
                    Forward::Cancelled => {
                        self.pool.report(&lease.name, &Outcome::Cancelled).await;
                        return Ok(AttemptEnd::Cancelled);
                    }
                }
            }
            self.pool.report(&lease.name, &Outcome::Success).await;
            return Ok(AttemptEnd::Complete);
        }
    }

    async fn forward_event(
        &self,
        data: &str,
        tx: &mpsc::Sender<GatewayResult<GenerateContentResponse>>,
        guard: &mut TruncationGuard,
    ) -> GatewayResult<Forward> {
        if data.is_empty() || data == "[DONE]" {
            return Ok(Forward::Skipped);
        }
        let mut chunk = match parse_response(data) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(%err, "skipping unparsable stream event");
                return Ok(Forward::Skipped);
            }
        };
        guard.observe_chunk(&chunk);
        // Length stops are withheld while a continuation may still follow;
        // the exhausted path emits the definitive one.
        if guard.active() {
            if let Some(candidate) = chunk.candidates.first_mut() {
                if candidate.finish_reason == Some(FinishReason::MaxTokens) {
                    candidate.finish_reason = None;
                }
            }
        }
        if tx.send(Ok(chunk)).await.is_err() {
            return Ok(Forward::Cancelled);
        }
        Ok(Forward::Sent)
    }
}

enum AttemptEnd {
    Complete,
    Cancelled,
}

enum Forward {
    Sent,
    Skipped,
    Cancelled,
}

fn length_limited_chunk() -> GenerateContentResponse {
    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Content {
                parts: Vec::new(),
                role: Some(ContentRole::Model),
            },
            finish_reason: Some(FinishReason::MaxTokens),
            index: None,
        }],
        ..GenerateContentResponse::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream::BoxStream;
    use rotor_pool::{
        CredentialPool, CredentialRecord, Family, Lease, MemoryStore, PoolConfig, TokenGrant,
        TokenSource,
    };
    use rotor_protocol::gemini::Part;
    use rotor_transform::directive::parse_model;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct StubTokens;

    #[async_trait]
    impl TokenSource for StubTokens {
        async fn refresh(
            &self,
            _family: Family,
            _refresh_token: &str,
        ) -> GatewayResult<TokenGrant> {
            Ok(TokenGrant {
                access_token: "at".to_string(),
                expires_in: 3600,
            })
        }
    }

    async fn test_pool(names: &[&str]) -> Arc<CredentialPool> {
        let store = MemoryStore::new();
        for name in names {
            store
                .seed(name, CredentialRecord::new("rt", Family::GeminiCli))
                .await;
        }
        Arc::new(
            CredentialPool::load(
                Arc::new(store),
                Arc::new(StubTokens),
                PoolConfig::default(),
            )
            .await
            .unwrap(),
        )
    }

    fn test_settings() -> Settings {
        Settings {
            retry_429_interval_ms: 1,
            ..Settings::default()
        }
    }

    enum Scripted {
        Generate(GatewayResult<GenerateContentResponse>),
        Stream(GatewayResult<Vec<&'static str>>),
    }

    struct ScriptedUpstream {
        script: Mutex<VecDeque<Scripted>>,
        leases_seen: Mutex<Vec<String>>,
    }

    impl ScriptedUpstream {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                leases_seen: Mutex::new(Vec::new()),
            }
        }

        fn next(&self, lease: &Lease) -> Scripted {
            self.leases_seen.lock().unwrap().push(lease.name.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted")
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn generate(
            &self,
            lease: &Lease,
            _model: &str,
            _request: &GenerateContentRequest,
        ) -> GatewayResult<GenerateContentResponse> {
            match self.next(lease) {
                Scripted::Generate(result) => result,
                Scripted::Stream(_) => panic!("expected generate call"),
            }
        }

        async fn stream_generate(
            &self,
            lease: &Lease,
            _model: &str,
            _request: &GenerateContentRequest,
        ) -> GatewayResult<BoxStream<'static, GatewayResult<Bytes>>> {
            match self.next(lease) {
                Scripted::Stream(Ok(frames)) => {
                    let items: Vec<GatewayResult<Bytes>> = frames
                        .into_iter()
                        .map(|frame| Ok(Bytes::from_static(frame.as_bytes())))
                        .collect();
                    Ok(futures_util::stream::iter(items).boxed())
                }
                Scripted::Stream(Err(err)) => Err(err),
                Scripted::Generate(_) => panic!("expected stream call"),
            }
        }
    }

    fn text_response(text: &str) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    parts: vec![Part::text(text)],
                    role: Some(ContentRole::Model),
                },
                finish_reason: Some(FinishReason::Stop),
                index: None,
            }],
            ..GenerateContentResponse::default()
        }
    }

    fn sse(text: &str, finish: Option<&str>) -> String {
        let mut body = format!("{{\"candidates\":[{{\"content\":{{\"parts\":[{{\"text\":\"{text}\"}}],\"role\":\"model\"}}");
        if let Some(finish) = finish {
            body.push_str(&format!(",\"finishReason\":\"{finish}\""));
        }
        body.push_str("}]}");
        format!("data: {body}\n\n")
    }

    fn leak(s: String) -> &'static str {
        Box::leak(s.into_boxed_str())
    }

    #[tokio::test]
    async fn generate_retries_rate_limit_then_succeeds() {
        let pool = test_pool(&["a", "b"]).await;
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Scripted::Generate(Err(GatewayError::UpstreamRateLimited {
                retry_after_ms: Some(1),
            })),
            Scripted::Generate(Ok(text_response("ok"))),
        ]));
        let dispatcher = Dispatcher::new(pool, upstream.clone(), test_settings());
        let directive = parse_model("gemini-2.5-pro");
        let response = dispatcher
            .generate(&directive, &GenerateContentRequest::default())
            .await
            .unwrap();
        assert_eq!(
            response.candidates[0].content.parts[0].text.as_deref(),
            Some("ok")
        );
        // The 429 forced rotation to the second credential.
        assert_eq!(*upstream.leases_seen.lock().unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn generate_gives_up_after_rate_limit_budget() {
        let pool = test_pool(&["a"]).await;
        let rate_limited = || {
            Scripted::Generate(Err(GatewayError::UpstreamRateLimited {
                retry_after_ms: Some(1),
            }))
        };
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            rate_limited(),
            rate_limited(),
            rate_limited(),
            rate_limited(),
        ]));
        let dispatcher = Dispatcher::new(pool, upstream, test_settings());
        let directive = parse_model("gemini-2.5-pro");
        let err = dispatcher
            .generate(&directive, &GenerateContentRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamRateLimited { .. }));
    }

    #[tokio::test]
    async fn auth_error_retries_once_on_rotated_credential() {
        let pool = test_pool(&["a", "b"]).await;
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Scripted::Generate(Err(GatewayError::UpstreamAuth {
                status: 401,
                message: "expired".to_string(),
            })),
            Scripted::Generate(Err(GatewayError::UpstreamAuth {
                status: 401,
                message: "expired".to_string(),
            })),
        ]));
        let dispatcher = Dispatcher::new(pool, upstream.clone(), test_settings());
        let directive = parse_model("gemini-2.5-pro");
        let err = dispatcher
            .generate(&directive, &GenerateContentRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamAuth { .. }));
        assert_eq!(upstream.leases_seen.lock().unwrap().len(), 2);
    }

    async fn collect(mut rx: CanonicalStream) -> Vec<GatewayResult<GenerateContentResponse>> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn plain_stream_forwards_chunks() {
        let pool = test_pool(&["a"]).await;
        let upstream = Arc::new(ScriptedUpstream::new(vec![Scripted::Stream(Ok(vec![
            leak(sse("hello ", None)),
            leak(sse("world", Some("STOP"))),
        ]))]));
        let dispatcher = Arc::new(Dispatcher::new(pool, upstream, test_settings()));
        let rx = dispatcher.stream(
            parse_model("gemini-2.5-pro"),
            GenerateContentRequest::default(),
        );
        let items = collect(rx).await;
        assert_eq!(items.len(), 2);
        let text: String = items
            .iter()
            .filter_map(|item| {
                item.as_ref().ok().and_then(|chunk| {
                    chunk.first_candidate()?.content.parts[0].text.clone()
                })
            })
            .collect();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn anti_truncation_resumes_twice_then_completes() {
        let pool = test_pool(&["a"]).await;
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Scripted::Stream(Ok(vec![leak(sse("first", Some("MAX_TOKENS")))])),
            Scripted::Stream(Ok(vec![leak(sse(" second", Some("MAX_TOKENS")))])),
            Scripted::Stream(Ok(vec![leak(sse(" done.", Some("STOP")))])),
        ]));
        let dispatcher = Arc::new(Dispatcher::new(pool, upstream.clone(), test_settings()));
        let rx = dispatcher.stream(
            parse_model("antitrunc/gemini-2.5-pro"),
            GenerateContentRequest::default(),
        );
        let items = collect(rx).await;
        assert!(items.iter().all(|item| item.is_ok()));
        let text: String = items
            .iter()
            .filter_map(|item| {
                item.as_ref().ok().and_then(|chunk| {
                    chunk.first_candidate()?.content.parts[0].text.clone()
                })
            })
            .collect();
        assert_eq!(text, "first second done.");
        assert_eq!(upstream.leases_seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn resumed_attempts_hide_intermediate_length_stops() {
        let pool = test_pool(&["a"]).await;
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Scripted::Stream(Ok(vec![leak(sse("first", Some("MAX_TOKENS")))])),
            Scripted::Stream(Ok(vec![leak(sse(" rest.", Some("STOP")))])),
        ]));
        let dispatcher = Arc::new(Dispatcher::new(pool, upstream, test_settings()));
        let rx = dispatcher.stream(
            parse_model("antitrunc/gemini-2.5-pro"),
            GenerateContentRequest::default(),
        );
        let items = collect(rx).await;
        let finishes: Vec<Option<FinishReason>> = items
            .iter()
            .map(|item| {
                item.as_ref()
                    .unwrap()
                    .first_candidate()
                    .unwrap()
                    .finish_reason
            })
            .collect();
        // The client never sees the length stop that triggered the resume.
        assert_eq!(finishes, [None, Some(FinishReason::Stop)]);
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_partial_with_length_stop() {
        let pool = test_pool(&["a"]).await;
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Scripted::Stream(Ok(vec![leak(sse("part", Some("MAX_TOKENS")))])),
            Scripted::Stream(Ok(vec![leak(sse(" more", Some("MAX_TOKENS")))])),
        ]));
        let settings = Settings {
            anti_truncation_max_attempts: 2,
            ..test_settings()
        };
        let dispatcher = Arc::new(Dispatcher::new(pool, upstream, settings));
        let rx = dispatcher.stream(
            parse_model("antitrunc/gemini-2.5-pro"),
            GenerateContentRequest::default(),
        );
        let items = collect(rx).await;
        assert!(items.iter().all(|item| item.is_ok()));
        let last = items.last().unwrap().as_ref().unwrap();
        assert_eq!(
            last.first_candidate().unwrap().finish_reason,
            Some(FinishReason::MaxTokens)
        );
    }

    #[tokio::test]
    async fn stream_open_failure_before_first_byte_retries() {
        let pool = test_pool(&["a", "b"]).await;
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Scripted::Stream(Err(GatewayError::UpstreamTransient {
                status: Some(503),
                message: "overloaded".to_string(),
            })),
            Scripted::Stream(Ok(vec![leak(sse("ok.", Some("STOP")))])),
        ]));
        let dispatcher = Arc::new(Dispatcher::new(pool, upstream.clone(), test_settings()));
        let rx = dispatcher.stream(
            parse_model("gemini-2.5-pro"),
            GenerateContentRequest::default(),
        );
        let items = collect(rx).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
        assert_eq!(*upstream.leases_seen.lock().unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn broken_stream_frame_is_skipped() {
        let pool = test_pool(&["a"]).await;
        let upstream = Arc::new(ScriptedUpstream::new(vec![Scripted::Stream(Ok(vec![
            leak(sse("partial", None)),
            "data: {broken json\n\n",
        ]))]));
        // A broken frame is skipped, not fatal; stream still completes.
        let dispatcher = Arc::new(Dispatcher::new(pool, upstream, test_settings()));
        let rx = dispatcher.stream(
            parse_model("gemini-2.5-pro"),
            GenerateContentRequest::default(),
        );
        let items = collect(rx).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }
}
