//! Canonical-stream to messages-stream re-emission.
//!
//! One state machine per request. Each upstream chunk is pushed through
//! `push`, which returns the client events it produces; `finish` closes
//! whatever is open and emits the terminal pair. Block indexes are
//! monotonic and every started block is stopped exactly once.

use rotor_protocol::claude::{
    ContentBlock, ContentBlockDelta, MessageDelta, StopReason, StreamEvent, StreamMessage, Role,
    Usage,
};
use rotor_protocol::gemini::{FinishReason, GenerateContentResponse, UsageMetadata};
use uuid::Uuid;

use crate::claude::response::map_finish_reason;
use crate::thinking::{
    SKIP_SIGNATURE_SENTINEL, THINKING_CLOSE_TAG, THINKING_OPEN_TAG, ThinkingDisposition,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text {
        /// Inside an open fallback thinking tag.
        in_thinking_tag: bool,
    },
    Thinking,
}

#[derive(Debug)]
pub struct ClaudeStreamState {
    model: String,
    disposition: ThinkingDisposition,
    estimator: fn(&str) -> u32,
    message_id: String,
    started: bool,
    next_index: u32,
    open: Option<(u32, OpenBlock)>,
    pending_signature: Option<String>,
    saw_tool_use: bool,
    finish_reason: Option<FinishReason>,
    usage: Option<UsageMetadata>,
    visible: String,
}

impl ClaudeStreamState {
    pub fn new(model: &str, disposition: ThinkingDisposition, estimator: fn(&str) -> u32) -> Self {
        Self {
            model: model.to_string(),
            disposition,
            estimator,
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            started: false,
            next_index: 0,
            open: None,
            pending_signature: None,
            saw_tool_use: false,
            finish_reason: None,
            usage: None,
            visible: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &GenerateContentResponse) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_message_start(&mut events);

        if let Some(usage) = &chunk.usage_metadata {
            self.usage = Some(usage.clone());
        }

        let Some(candidate) = chunk.first_candidate() else {
            return events;
        };
        if candidate.finish_reason.is_some() {
            self.finish_reason = candidate.finish_reason;
        }

        for part in &candidate.content.parts {
            if let Some(call) = &part.function_call {
                self.emit_tool_use(&mut events, call);
            } else if part.is_thought() {
                if let Some(text) = &part.text {
                    self.emit_thought(&mut events, text, part.thought_signature.clone());
                }
            } else if let Some(text) = &part.text {
                self.emit_text(&mut events, text);
            }
        }
        events
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_message_start(&mut events);
        self.close_open(&mut events);

        let stop_reason = if self.saw_tool_use {
            StopReason::ToolUse
        } else {
            map_finish_reason(self.finish_reason)
        };
        let output_tokens = self
            .usage
            .as_ref()
            .and_then(|u| {
                let candidates = u.candidates_token_count?;
                Some(candidates + u.thoughts_token_count.unwrap_or(0))
            })
            .unwrap_or_else(|| (self.estimator)(&self.visible));

        events.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: Usage {
                input_tokens: self.usage.as_ref().and_then(|u| u.prompt_token_count),
                output_tokens: Some(output_tokens),
            },
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    fn ensure_message_start(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(StreamEvent::MessageStart {
            message: StreamMessage {
                id: self.message_id.clone(),
                r#type: "message".to_string(),
                role: Role::Assistant,
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        });
    }

    fn emit_tool_use(
        &mut self,
        events: &mut Vec<StreamEvent>,
        call: &rotor_protocol::gemini::FunctionCall,
    ) {
        self.close_open(events);
        self.saw_tool_use = true;
        let index = self.next_index;
        self.next_index += 1;
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlock::ToolUse {
                id: call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("toolu_{}", Uuid::new_v4().simple())),
                name: call.name.clone(),
                input: serde_json::json!({}),
            },
        });
        if let Some(args) = &call.args {
            let partial_json =
                serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string());
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: ContentBlockDelta::InputJsonDelta { partial_json },
            });
        }
        events.push(StreamEvent::ContentBlockStop { index });
    }

    fn emit_thought(
        &mut self,
        events: &mut Vec<StreamEvent>,
        text: &str,
        signature: Option<String>,
    ) {
        match self.disposition {
            ThinkingDisposition::Drop => {}
            ThinkingDisposition::Verbatim => {
                if signature.is_some() {
                    self.pending_signature = signature;
                }
                let index = match self.open {
                    Some((index, OpenBlock::Thinking)) => index,
                    _ => {
                        self.close_open(events);
                        self.open_block(
                            events,
                            OpenBlock::Thinking,
                            ContentBlock::Thinking {
                                thinking: String::new(),
                                signature: String::new(),
                            },
                        )
                    }
                };
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentBlockDelta::ThinkingDelta {
                        thinking: text.to_string(),
                    },
                });
            }
            ThinkingDisposition::TextFallback => {
                let index = match self.open {
                    Some((index, OpenBlock::Text { in_thinking_tag: true })) => index,
                    Some((index, OpenBlock::Text { in_thinking_tag: false })) => {
                        self.open = Some((index, OpenBlock::Text { in_thinking_tag: true }));
                        self.push_text_delta(events, index, THINKING_OPEN_TAG);
                        index
                    }
                    _ => {
                        self.close_open(events);
                        let index = self.open_block(
                            events,
                            OpenBlock::Text { in_thinking_tag: true },
                            ContentBlock::Text { text: String::new() },
                        );
                        self.push_text_delta(events, index, THINKING_OPEN_TAG);
                        index
                    }
                };
                self.push_text_delta(events, index, text);
            }
        }
    }

    fn emit_text(&mut self, events: &mut Vec<StreamEvent>, text: &str) {
        let index = match self.open {
            Some((index, OpenBlock::Text { in_thinking_tag: false })) => index,
            Some((index, OpenBlock::Text { in_thinking_tag: true })) => {
                self.push_text_delta(events, index, THINKING_CLOSE_TAG);
                self.open = Some((index, OpenBlock::Text { in_thinking_tag: false }));
                index
            }
            _ => {
                self.close_open(events);
                self.open_block(
                    events,
                    OpenBlock::Text { in_thinking_tag: false },
                    ContentBlock::Text { text: String::new() },
                )
            }
        };
        self.push_text_delta(events, index, text);
    }

    fn push_text_delta(&mut self, events: &mut Vec<StreamEvent>, index: u32, text: &str) {
        self.visible.push_str(text);
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: ContentBlockDelta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn open_block(
        &mut self,
        events: &mut Vec<StreamEvent>,
        kind: OpenBlock,
        content_block: ContentBlock,
    ) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some((index, kind));
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
        index
    }

    fn close_open(&mut self, events: &mut Vec<StreamEvent>) {
        let Some((index, kind)) = self.open.take() else {
            return;
        };
        match kind {
            OpenBlock::Thinking => {
                let signature = self
                    .pending_signature
                    .take()
                    .unwrap_or_else(|| SKIP_SIGNATURE_SENTINEL.to_string());
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentBlockDelta::SignatureDelta { signature },
                });
            }
            OpenBlock::Text { in_thinking_tag: true } => {
                self.push_text_delta(events, index, THINKING_CLOSE_TAG);
            }
            OpenBlock::Text { in_thinking_tag: false } => {}
        }
        events.push(StreamEvent::ContentBlockStop { index });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rotor_protocol::gemini::{Candidate, Content, ContentRole, FunctionCall, Part};

    fn chunk(parts: Vec<Part>, finish: Option<FinishReason>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    parts,
                    role: Some(ContentRole::Model),
                },
                finish_reason: finish,
                index: None,
            }],
            ..GenerateContentResponse::default()
        }
    }

    fn count_words(text: &str) -> u32 {
        text.split_whitespace().count() as u32
    }

    fn assert_blocks_balanced(events: &[StreamEvent]) {
        let mut open = std::collections::HashSet::new();
        for event in events {
            match event {
                StreamEvent::ContentBlockStart { index, .. } => {
                    assert!(open.insert(*index), "block {index} started twice");
                }
                StreamEvent::ContentBlockStop { index } => {
                    assert!(open.remove(index), "block {index} stopped without start");
                }
                _ => {}
            }
        }
        assert!(open.is_empty(), "unclosed blocks: {open:?}");
    }

    #[test]
    fn thinking_then_tool_call_ordering() {
        let mut state =
            ClaudeStreamState::new("gemini-2.5-pro", ThinkingDisposition::Verbatim, count_words);
        let mut events = state.push(&chunk(
            vec![Part::thought("let me check", Some("sig-1".to_string()))],
            None,
        ));
        events.extend(state.push(&chunk(
            vec![Part {
                function_call: Some(FunctionCall {
                    id: Some("toolu_1".to_string()),
                    name: "lookup".to_string(),
                    args: Some(serde_json::json!({"q": "x"})),
                }),
                ..Part::default()
            }],
            Some(FinishReason::Stop),
        )));
        events.extend(state.finish());

        assert_blocks_balanced(&events);
        // Thinking block must close (with its signature) before the tool
        // block starts, and the stream ends in tool_use.
        let signature_pos = events
            .iter()
            .position(|e| {
                matches!(
                    e,
                    StreamEvent::ContentBlockDelta {
                        delta: ContentBlockDelta::SignatureDelta { signature },
                        ..
                    } if signature == "sig-1"
                )
            })
            .unwrap();
        let tool_start_pos = events
            .iter()
            .position(|e| {
                matches!(
                    e,
                    StreamEvent::ContentBlockStart {
                        content_block: ContentBlock::ToolUse { .. },
                        ..
                    }
                )
            })
            .unwrap();
        assert!(signature_pos < tool_start_pos);
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::MessageDelta {
                delta: MessageDelta {
                    stop_reason: Some(StopReason::ToolUse),
                    ..
                },
                ..
            }
        )));
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
    }

    #[test]
    fn plain_text_stream_shape() {
        let mut state =
            ClaudeStreamState::new("gemini-2.5-pro", ThinkingDisposition::Verbatim, count_words);
        let mut events = state.push(&chunk(vec![Part::text("hello ")], None));
        events.extend(state.push(&chunk(vec![Part::text("world")], Some(FinishReason::Stop))));
        events.extend(state.finish());

        assert!(matches!(events.first(), Some(StreamEvent::MessageStart { .. })));
        assert_blocks_balanced(&events);
        let text_deltas = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    StreamEvent::ContentBlockDelta {
                        delta: ContentBlockDelta::TextDelta { .. },
                        ..
                    }
                )
            })
            .count();
        assert_eq!(text_deltas, 2);
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::MessageDelta {
                delta: MessageDelta {
                    stop_reason: Some(StopReason::EndTurn),
                    ..
                },
                ..
            }
        )));
    }

    #[test]
    fn fallback_wraps_thinking_in_tags_within_one_text_block() {
        let mut state = ClaudeStreamState::new(
            "gemini-2.5-pro",
            ThinkingDisposition::TextFallback,
            count_words,
        );
        let mut events = state.push(&chunk(vec![Part::thought("plan", None)], None));
        events.extend(state.push(&chunk(vec![Part::text("answer")], Some(FinishReason::Stop))));
        events.extend(state.finish());

        assert_blocks_balanced(&events);
        let starts = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ContentBlockStart { .. }))
            .count();
        assert_eq!(starts, 1);
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    delta: ContentBlockDelta::TextDelta { text },
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            text,
            format!("{THINKING_OPEN_TAG}plan{THINKING_CLOSE_TAG}answer")
        );
    }

    #[test]
    fn drop_disposition_hides_thinking_entirely() {
        let mut state =
            ClaudeStreamState::new("gemini-2.5-pro", ThinkingDisposition::Drop, count_words);
        let mut events = state.push(&chunk(vec![Part::thought("secret", None)], None));
        events.extend(state.push(&chunk(vec![Part::text("visible")], Some(FinishReason::Stop))));
        events.extend(state.finish());

        assert!(!events.iter().any(|e| matches!(
            e,
            StreamEvent::ContentBlockDelta {
                delta: ContentBlockDelta::ThinkingDelta { .. },
                ..
            }
        )));
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    delta: ContentBlockDelta::TextDelta { text },
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "visible");
    }

    #[test]
    fn max_tokens_finish_maps_to_max_tokens_stop() {
        let mut state =
            ClaudeStreamState::new("gemini-2.5-pro", ThinkingDisposition::Verbatim, count_words);
        let mut events =
            state.push(&chunk(vec![Part::text("partial")], Some(FinishReason::MaxTokens)));
        events.extend(state.finish());
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::MessageDelta {
                delta: MessageDelta {
                    stop_reason: Some(StopReason::MaxTokens),
                    ..
                },
                ..
            }
        )));
    }

    #[test]
    fn empty_stream_still_produces_valid_envelope() {
        let mut state =
            ClaudeStreamState::new("gemini-2.5-pro", ThinkingDisposition::Verbatim, count_words);
        let events = state.finish();
        assert!(matches!(events.first(), Some(StreamEvent::MessageStart { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
        assert_blocks_balanced(&events);
    }
}
