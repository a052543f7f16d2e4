//! Truncation detection and bounded continuation.
//!
//! Streams can end mid-answer when the upstream hits its output ceiling
//! or simply drops the finish reason. The guard watches one attempt at a
//! time, decides whether the attempt completed, and builds the
//! continuation request for the next attempt. Attempts are bounded; when
//! they run out the partial result stands, reported as a length-limited
//! stop.

use rotor_protocol::gemini::{
    Content, ContentRole, FinishReason, GenerateContentRequest, GenerateContentResponse, Part,
};

const CONTINUATION_PROMPT: &str =
    "Continue exactly where you left off. Do not repeat anything you already wrote.";

/// What the predicate sees after one attempt.
#[derive(Debug, Clone, Default)]
pub struct AttemptView {
    pub finish_reason: Option<FinishReason>,
    pub visible_text: String,
    pub saw_tool_call: bool,
}

pub type TruncationPredicate = fn(&AttemptView) -> bool;

/// Default truncation test: length-limited or missing finish reason, or
/// visible text that stops mid-sentence or inside an open code fence.
pub fn default_predicate(view: &AttemptView) -> bool {
    if view.saw_tool_call {
        return false;
    }
    match view.finish_reason {
        Some(FinishReason::MaxTokens) | None => return true,
        Some(FinishReason::Stop) => {}
        Some(_) => return false,
    }
    let text = view.visible_text.trim_end();
    if text.is_empty() {
        return false;
    }
    if text.matches("```").count() % 2 == 1 {
        return true;
    }
    let terminal = text
        .chars()
        .next_back()
        .map(|c| {
            matches!(
                c,
                '.' | '!' | '?' | '。' | '！' | '？' | ':' | '"' | '\'' | ')' | ']' | '`' | '」'
            )
        })
        .unwrap_or(true);
    !terminal
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    pub index: u32,
    pub reason: String,
    /// Whether a continuation request was actually issued.
    pub resumed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The attempt finished cleanly.
    Done,
    /// Truncated with attempts remaining; issue the continuation.
    Resume,
    /// Truncated with no attempts left; the partial output stands.
    Exhausted,
}

#[derive(Debug)]
pub struct TruncationGuard {
    max_attempts: u32,
    predicate: TruncationPredicate,
    armed: bool,
    current: AttemptView,
    accumulated_text: String,
    attempts: Vec<RetryAttempt>,
}

impl TruncationGuard {
    pub fn new(max_attempts: u32, predicate: TruncationPredicate) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            predicate,
            armed: true,
            current: AttemptView::default(),
            accumulated_text: String::new(),
            attempts: Vec::new(),
        }
    }

    /// Guard that never resumes; used when anti-truncation is off.
    pub fn inactive() -> Self {
        Self {
            armed: false,
            ..Self::new(1, |_| false)
        }
    }

    /// Whether this guard may rewrite the stream. The pass-through guard
    /// returned by [`inactive`](Self::inactive) never does.
    pub fn active(&self) -> bool {
        self.armed
    }

    pub fn observe_chunk(&mut self, chunk: &GenerateContentResponse) {
        let Some(candidate) = chunk.first_candidate() else {
            return;
        };
        if candidate.finish_reason.is_some() {
            self.current.finish_reason = candidate.finish_reason;
        }
        for part in &candidate.content.parts {
            if part.function_call.is_some() {
                self.current.saw_tool_call = true;
            } else if !part.is_thought() {
                if let Some(text) = &part.text {
                    self.current.visible_text.push_str(text);
                }
            }
        }
    }

    /// Close the current attempt and decide what happens next.
    pub fn attempt_complete(&mut self) -> Decision {
        let truncated = (self.predicate)(&self.current);
        self.accumulated_text.push_str(&self.current.visible_text);
        let index = self.attempts.len() as u32;

        if !truncated {
            self.current = AttemptView::default();
            return Decision::Done;
        }

        let reason = match self.current.finish_reason {
            Some(reason) => format!("{reason:?}"),
            None => "missing finish reason".to_string(),
        };
        let resumed = index + 1 < self.max_attempts;
        self.attempts.push(RetryAttempt {
            index,
            reason,
            resumed,
        });
        self.current = AttemptView::default();
        if resumed {
            Decision::Resume
        } else {
            Decision::Exhausted
        }
    }

    /// Continuation request: the original conversation plus everything
    /// produced so far as a model turn, then the continue directive.
    pub fn continuation_request(&self, base: &GenerateContentRequest) -> GenerateContentRequest {
        let mut request = base.clone();
        if !self.accumulated_text.is_empty() {
            request.contents.push(Content {
                parts: vec![Part::text(self.accumulated_text.clone())],
                role: Some(ContentRole::Model),
            });
        }
        request.contents.push(Content {
            parts: vec![Part::text(CONTINUATION_PROMPT)],
            role: Some(ContentRole::User),
        });
        request
    }

    pub fn attempts(&self) -> &[RetryAttempt] {
        &self.attempts
    }

    /// True when the final attempt still looked truncated.
    pub fn ended_truncated(&self) -> bool {
        self.attempts
            .last()
            .map(|attempt| !attempt.resumed)
            .unwrap_or(false)
    }
}
