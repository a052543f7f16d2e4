//! Canonical-stream to chat-completion-chunk re-emission.
//!
//! Every chunk shares the completion id, creation time, and model. The
//! first emitted chunk carries the assistant role; `finish` produces the
//! terminal chunk with the finish reason and usage. The `data: [DONE]`
//! trailer is the router's job.

use rotor_protocol::gemini::{FinishReason, GenerateContentResponse, UsageMetadata};
use rotor_protocol::openai::{
    ChatCompletionChunk, ChatRole, ChunkChoice, ChunkDelta, FinishReason as OpenAiFinishReason,
    ToolCallChunk, ToolCallChunkFunction, Usage,
};
use uuid::Uuid;

use crate::openai::response::map_finish_reason;
use crate::thinking::{THINKING_CLOSE_TAG, THINKING_OPEN_TAG, ThinkingDisposition};

#[derive(Debug)]
pub struct OpenAiStreamState {
    id: String,
    created: i64,
    model: String,
    disposition: ThinkingDisposition,
    estimator: fn(&str) -> u32,
    role_sent: bool,
    tool_index: u32,
    saw_tool_call: bool,
    in_thinking_tag: bool,
    finish_reason: Option<FinishReason>,
    usage: Option<UsageMetadata>,
    visible: String,
}

impl OpenAiStreamState {
    pub fn new(model: &str, disposition: ThinkingDisposition, estimator: fn(&str) -> u32) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: time::OffsetDateTime::now_utc().unix_timestamp(),
            model: model.to_string(),
            disposition,
            estimator,
            role_sent: false,
            tool_index: 0,
            saw_tool_call: false,
            in_thinking_tag: false,
            finish_reason: None,
            usage: None,
            visible: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &GenerateContentResponse) -> Vec<ChatCompletionChunk> {
        let mut out = Vec::new();

        if let Some(usage) = &chunk.usage_metadata {
            self.usage = Some(usage.clone());
        }
        let Some(candidate) = chunk.first_candidate() else {
            return out;
        };
        if candidate.finish_reason.is_some() {
            self.finish_reason = candidate.finish_reason;
        }

        for part in &candidate.content.parts {
            if let Some(call) = &part.function_call {
                self.saw_tool_call = true;
                let index = self.tool_index;
                self.tool_index += 1;
                let delta = ChunkDelta {
                    tool_calls: Some(vec![ToolCallChunk {
                        index,
                        id: Some(call.id.clone().unwrap_or_else(|| {
                            format!("call_{}", Uuid::new_v4().simple())
                        })),
                        r#type: Some("function".to_string()),
                        function: ToolCallChunkFunction {
                            name: Some(call.name.clone()),
                            arguments: Some(
                                call.args
                                    .as_ref()
                                    .and_then(|args| serde_json::to_string(args).ok())
                                    .unwrap_or_else(|| "{}".to_string()),
                            ),
                        },
                    }]),
                    ..ChunkDelta::default()
                };
                out.push(self.make_chunk(delta, None));
            } else if part.is_thought() {
                let Some(text) = &part.text else { continue };
                match self.disposition {
                    ThinkingDisposition::Drop => {}
                    ThinkingDisposition::Verbatim => {
                        let delta = ChunkDelta {
                            reasoning_content: Some(text.clone()),
                            ..ChunkDelta::default()
                        };
                        out.push(self.make_chunk(delta, None));
                    }
                    ThinkingDisposition::TextFallback => {
                        let mut merged = String::new();
                        if !self.in_thinking_tag {
                            self.in_thinking_tag = true;
                            merged.push_str(THINKING_OPEN_TAG);
                        }
                        merged.push_str(text);
                        out.push(self.content_chunk(merged));
                    }
                }
            } else if let Some(text) = &part.text {
                let mut merged = String::new();
                if self.in_thinking_tag {
                    self.in_thinking_tag = false;
                    merged.push_str(THINKING_CLOSE_TAG);
                }
                merged.push_str(text);
                out.push(self.content_chunk(merged));
            }
        }
        out
    }

    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        let mut out = Vec::new();
        if self.in_thinking_tag {
            self.in_thinking_tag = false;
            let closing = THINKING_CLOSE_TAG.to_string();
            out.push(self.content_chunk(closing));
        }

        let finish = if self.saw_tool_call {
            OpenAiFinishReason::ToolCalls
        } else {
            map_finish_reason(self.finish_reason)
        };
        let completion_tokens = self
            .usage
            .as_ref()
            .and_then(|u| {
                let candidates = u.candidates_token_count?;
                Some(candidates + u.thoughts_token_count.unwrap_or(0))
            })
            .unwrap_or_else(|| (self.estimator)(&self.visible));
        let prompt_tokens = self
            .usage
            .as_ref()
            .and_then(|u| u.prompt_token_count)
            .unwrap_or(0);

        let mut chunk = self.make_chunk(ChunkDelta::default(), Some(finish));
        chunk.usage = Some(Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        });
        out.push(chunk);
        out
    }

    fn content_chunk(&mut self, text: String) -> ChatCompletionChunk {
        self.visible.push_str(&text);
        let delta = ChunkDelta {
            content: Some(text),
            ..ChunkDelta::default()
        };
        self.make_chunk(delta, None)
    }

    fn make_chunk(
        &mut self,
        mut delta: ChunkDelta,
        finish_reason: Option<OpenAiFinishReason>,
    ) -> ChatCompletionChunk {
        if !self.role_sent {
            self.role_sent = true;
            delta.role = Some(ChatRole::Assistant);
        }
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }
}
