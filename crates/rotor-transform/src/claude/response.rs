//! Non-streaming messages-response conversion.

use rotor_protocol::claude::{ContentBlock, Message, Role, StopReason, Usage};
use rotor_protocol::gemini::{FinishReason, GenerateContentResponse};
use uuid::Uuid;

use crate::thinking::{
    SKIP_SIGNATURE_SENTINEL, THINKING_CLOSE_TAG, THINKING_OPEN_TAG, ThinkingDisposition,
};

pub fn from_canonical(
    response: &GenerateContentResponse,
    model: &str,
    disposition: ThinkingDisposition,
    estimator: fn(&str) -> u32,
) -> Message {
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut saw_tool_use = false;
    let mut finish_reason = None;
    let mut visible = String::new();

    if let Some(candidate) = response.first_candidate() {
        finish_reason = candidate.finish_reason;
        for part in &candidate.content.parts {
            if let Some(call) = &part.function_call {
                saw_tool_use = true;
                blocks.push(ContentBlock::ToolUse {
                    id: call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("toolu_{}", Uuid::new_v4().simple())),
                    name: call.name.clone(),
                    input: call.args.clone().unwrap_or_else(|| serde_json::json!({})),
                });
            } else if part.is_thought() {
                let Some(text) = &part.text else { continue };
                match disposition {
                    ThinkingDisposition::Verbatim => blocks.push(ContentBlock::Thinking {
                        thinking: text.clone(),
                        signature: part
                            .thought_signature
                            .clone()
                            .unwrap_or_else(|| SKIP_SIGNATURE_SENTINEL.to_string()),
                    }),
                    ThinkingDisposition::TextFallback => {
                        let wrapped = format!("{THINKING_OPEN_TAG}{text}{THINKING_CLOSE_TAG}");
                        visible.push_str(&wrapped);
                        push_text(&mut blocks, &wrapped);
                    }
                    ThinkingDisposition::Drop => {}
                }
            } else if let Some(text) = &part.text {
                visible.push_str(text);
                push_text(&mut blocks, text);
            }
        }
    }

    let stop_reason = if saw_tool_use {
        StopReason::ToolUse
    } else {
        map_finish_reason(finish_reason)
    };

    let usage = response.usage_metadata.as_ref();
    let output_tokens = usage
        .and_then(|u| {
            let candidates = u.candidates_token_count?;
            Some(candidates + u.thoughts_token_count.unwrap_or(0))
        })
        .unwrap_or_else(|| estimator(&visible));

    Message {
        id: format!("msg_{}", Uuid::new_v4().simple()),
        r#type: "message".to_string(),
        role: Role::Assistant,
        model: model.to_string(),
        content: blocks,
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: Usage {
            input_tokens: usage.and_then(|u| u.prompt_token_count),
            output_tokens: Some(output_tokens),
        },
    }
}

fn push_text(blocks: &mut Vec<ContentBlock>, text: &str) {
    if let Some(ContentBlock::Text { text: existing }) = blocks.last_mut() {
        existing.push_str(text);
    } else {
        blocks.push(ContentBlock::Text {
            text: text.to_string(),
        });
    }
}

pub(crate) fn map_finish_reason(reason: Option<FinishReason>) -> StopReason {
    match reason {
        Some(FinishReason::MaxTokens) => StopReason::MaxTokens,
        Some(
            FinishReason::Safety
            | FinishReason::Recitation
            | FinishReason::Blocklist
            | FinishReason::ProhibitedContent
            | FinishReason::Spii,
        ) => StopReason::Refusal,
        _ => StopReason::EndTurn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rotor_protocol::gemini::{Candidate, Content, ContentRole, Part, UsageMetadata};

    fn sample(parts: Vec<Part>, finish: Option<FinishReason>) -> GenerateContentResponse {
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

    #[test]
    fn thinking_then_text_splits_blocks() {
        let response = sample(
            vec![
                Part::thought("plan", Some("sig".to_string())),
                Part::text("answer"),
            ],
            Some(FinishReason::Stop),
        );
        let message =
            from_canonical(&response, "m", ThinkingDisposition::Verbatim, count_words);
        assert_eq!(message.content.len(), 2);
        assert!(matches!(
            &message.content[0],
            ContentBlock::Thinking { signature, .. } if signature == "sig"
        ));
        assert_eq!(message.stop_reason, Some(StopReason::EndTurn));
    }

    #[test]
    fn tool_call_wins_stop_reason() {
        let response = sample(
            vec![Part {
                function_call: Some(rotor_protocol::gemini::FunctionCall {
                    id: Some("toolu_9".to_string()),
                    name: "lookup".to_string(),
                    args: Some(serde_json::json!({"q": 1})),
                }),
                ..Part::default()
            }],
            Some(FinishReason::Stop),
        );
        let message =
            from_canonical(&response, "m", ThinkingDisposition::Verbatim, count_words);
        assert_eq!(message.stop_reason, Some(StopReason::ToolUse));
        assert!(matches!(
            &message.content[0],
            ContentBlock::ToolUse { id, .. } if id == "toolu_9"
        ));
    }

    #[test]
    fn fallback_merges_thinking_into_single_text_block() {
        let response = sample(
            vec![Part::thought("plan", None), Part::text("answer")],
            Some(FinishReason::Stop),
        );
        let message = from_canonical(
            &response,
            "m",
            ThinkingDisposition::TextFallback,
            count_words,
        );
        assert_eq!(message.content.len(), 1);
        let ContentBlock::Text { text } = &message.content[0] else {
            panic!("expected a text block");
        };
        assert!(text.contains("<assistant_thinking>"));
        assert!(text.ends_with("answer"));
    }

    #[test]
    fn assistant_reply_survives_renormalization() {
        use rotor_protocol::claude::{
            ContentBlockParam, MessageContent, MessageParam, MessagesRequest,
        };

        use crate::claude::to_canonical;
        use crate::directive::parse_model;

        let response = sample(
            vec![
                Part::thought("plan", Some("sig-a".to_string())),
                Part::text("The answer."),
                Part {
                    function_call: Some(rotor_protocol::gemini::FunctionCall {
                        id: Some("toolu_1".to_string()),
                        name: "lookup".to_string(),
                        args: Some(serde_json::json!({"q": "x"})),
                    }),
                    ..Part::default()
                },
            ],
            Some(FinishReason::Stop),
        );
        let message = from_canonical(
            &response,
            "gemini-2.5-pro",
            ThinkingDisposition::Verbatim,
            count_words,
        );

        // Feed the reply back as assistant history, the way a client
        // continues the conversation.
        let blocks = message
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => ContentBlockParam::Text { text: text.clone() },
                ContentBlock::Thinking {
                    thinking,
                    signature,
                } => ContentBlockParam::Thinking {
                    thinking: thinking.clone(),
                    signature: Some(signature.clone()),
                },
                ContentBlock::ToolUse { id, name, input } => ContentBlockParam::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                },
            })
            .collect();
        let request = MessagesRequest {
            model: "gemini-2.5-pro".to_string(),
            max_tokens: 512,
            messages: vec![MessageParam {
                role: message.role,
                content: MessageContent::Blocks(blocks),
            }],
            system: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
            thinking: None,
            tools: None,
            tool_choice: None,
        };
        let canonical = to_canonical(&request, &parse_model("gemini-2.5-pro"), false).unwrap();

        let parts = &canonical.contents[0].parts;
        assert_eq!(parts.len(), 3);
        assert!(parts[0].is_thought());
        assert_eq!(parts[0].text.as_deref(), Some("plan"));
        assert_eq!(parts[0].thought_signature.as_deref(), Some("sig-a"));
        assert_eq!(parts[1].text.as_deref(), Some("The answer."));
        let call = parts[2].function_call.as_ref().unwrap();
        assert_eq!(call.id.as_deref(), Some("toolu_1"));
        assert_eq!(call.name, "lookup");
        assert_eq!(call.args, Some(serde_json::json!({"q": "x"})));
        // The thinking block donates its signature to the tool call.
        assert_eq!(parts[2].thought_signature.as_deref(), Some("sig-a"));
    }

    #[test]
    fn missing_usage_falls_back_to_estimation() {
        let response = sample(vec![Part::text("one two three")], Some(FinishReason::Stop));
        let message =
            from_canonical(&response, "m", ThinkingDisposition::Verbatim, count_words);
        assert_eq!(message.usage.output_tokens, Some(3));
    }

    #[test]
    fn upstream_usage_is_preferred() {
        let mut response = sample(vec![Part::text("hi")], Some(FinishReason::MaxTokens));
        response.usage_metadata = Some(UsageMetadata {
            prompt_token_count: Some(10),
            candidates_token_count: Some(20),
            thoughts_token_count: Some(5),
            total_token_count: Some(35),
        });
        let message =
            from_canonical(&response, "m", ThinkingDisposition::Verbatim, count_words);
        assert_eq!(message.usage.input_tokens, Some(10));
        assert_eq!(message.usage.output_tokens, Some(25));
        assert_eq!(message.stop_reason, Some(StopReason::MaxTokens));
    }
}
