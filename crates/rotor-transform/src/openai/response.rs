//! Non-streaming chat-completion conversion.

use rotor_protocol::gemini::{FinishReason, GenerateContentResponse};
use rotor_protocol::openai::{
    ChatCompletion, ChatMessage, ChatRole, Choice, FinishReason as OpenAiFinishReason,
    FunctionCall, MessageContent, ToolCall, Usage,
};
use uuid::Uuid;

use crate::thinking::{THINKING_CLOSE_TAG, THINKING_OPEN_TAG, ThinkingDisposition};

pub fn from_canonical(
    response: &GenerateContentResponse,
    model: &str,
    disposition: ThinkingDisposition,
    estimator: fn(&str) -> u32,
) -> ChatCompletion {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut finish_reason = None;

    if let Some(candidate) = response.first_candidate() {
        finish_reason = candidate.finish_reason;
        for part in &candidate.content.parts {
            if let Some(call) = &part.function_call {
                tool_calls.push(ToolCall {
                    id: call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
                    r#type: "function".to_string(),
                    function: FunctionCall {
                        name: call.name.clone(),
                        arguments: call
                            .args
                            .as_ref()
                            .and_then(|args| serde_json::to_string(args).ok())
                            .unwrap_or_else(|| "{}".to_string()),
                    },
                });
            } else if part.is_thought() {
                let Some(text) = &part.text else { continue };
                match disposition {
                    ThinkingDisposition::Verbatim => reasoning.push_str(text),
                    ThinkingDisposition::TextFallback => {
                        content.push_str(THINKING_OPEN_TAG);
                        content.push_str(text);
                        content.push_str(THINKING_CLOSE_TAG);
                    }
                    ThinkingDisposition::Drop => {}
                }
            } else if let Some(text) = &part.text {
                content.push_str(text);
            }
        }
    }

    let mapped_finish = if tool_calls.is_empty() {
        map_finish_reason(finish_reason)
    } else {
        OpenAiFinishReason::ToolCalls
    };

    let usage_metadata = response.usage_metadata.as_ref();
    let completion_tokens = usage_metadata
        .and_then(|u| {
            let candidates = u.candidates_token_count?;
            Some(candidates + u.thoughts_token_count.unwrap_or(0))
        })
        .unwrap_or_else(|| estimator(&content));
    let prompt_tokens = usage_metadata
        .and_then(|u| u.prompt_token_count)
        .unwrap_or(0);

    ChatCompletion {
        id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: time::OffsetDateTime::now_utc().unix_timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: ChatRole::Assistant,
                content: (!content.is_empty()).then(|| MessageContent::Text(content)),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
                name: None,
            },
            finish_reason: Some(mapped_finish),
        }],
        usage: Some(Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }),
    }
}

pub(crate) fn map_finish_reason(reason: Option<FinishReason>) -> OpenAiFinishReason {
    match reason {
        Some(FinishReason::MaxTokens) => OpenAiFinishReason::Length,
        Some(
            FinishReason::Safety
            | FinishReason::Recitation
            | FinishReason::Blocklist
            | FinishReason::ProhibitedContent
            | FinishReason::Spii,
        ) => OpenAiFinishReason::ContentFilter,
        _ => OpenAiFinishReason::Stop,
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
    fn thinking_surfaces_as_reasoning_content() {
        let response = sample(
            vec![Part::thought("plan", None), Part::text("answer")],
            Some(FinishReason::Stop),
        );
        let completion =
            from_canonical(&response, "m", ThinkingDisposition::Verbatim, count_words);
        let message = &completion.choices[0].message;
        assert_eq!(message.reasoning_content.as_deref(), Some("plan"));
        assert_eq!(
            message.content,
            Some(MessageContent::Text("answer".to_string()))
        );
    }

    #[test]
    fn function_calls_become_tool_calls() {
        let response = sample(
            vec![Part {
                function_call: Some(rotor_protocol::gemini::FunctionCall {
                    id: Some("call_7".to_string()),
                    name: "lookup".to_string(),
                    args: Some(serde_json::json!({"q": "x"})),
                }),
                ..Part::default()
            }],
            Some(FinishReason::Stop),
        );
        let completion =
            from_canonical(&response, "m", ThinkingDisposition::Verbatim, count_words);
        let choice = &completion.choices[0];
        assert_eq!(choice.finish_reason, Some(OpenAiFinishReason::ToolCalls));
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_7");
        assert_eq!(calls[0].function.arguments, "{\"q\":\"x\"}");
    }

    #[test]
    fn assistant_reply_survives_renormalization() {
        use rotor_protocol::openai::ChatCompletionRequest;

        use crate::directive::parse_model;
        use crate::openai::to_canonical;

        let response = sample(
            vec![
                Part::text("Done."),
                Part {
                    function_call: Some(rotor_protocol::gemini::FunctionCall {
                        id: Some("call_1".to_string()),
                        name: "lookup".to_string(),
                        args: Some(serde_json::json!({"q": "x"})),
                    }),
                    ..Part::default()
                },
            ],
            Some(FinishReason::Stop),
        );
        let completion =
            from_canonical(&response, "gemini-2.5-pro", ThinkingDisposition::Verbatim, count_words);

        // The reply message doubles as the next request's assistant turn.
        let request = ChatCompletionRequest {
            model: "gemini-2.5-pro".to_string(),
            messages: vec![completion.choices[0].message.clone()],
            max_tokens: None,
            max_completion_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            stream: None,
            stream_options: None,
            tools: None,
            tool_choice: None,
        };
        let canonical = to_canonical(&request, &parse_model("gemini-2.5-pro"), false).unwrap();

        let parts = &canonical.contents[0].parts;
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].text.as_deref(), Some("Done."));
        let call = parts[1].function_call.as_ref().unwrap();
        assert_eq!(call.id.as_deref(), Some("call_1"));
        assert_eq!(call.name, "lookup");
        assert_eq!(call.args, Some(serde_json::json!({"q": "x"})));
    }

    #[test]
    fn usage_prefers_upstream_counts() {
        let mut response = sample(vec![Part::text("hi")], Some(FinishReason::MaxTokens));
        response.usage_metadata = Some(UsageMetadata {
            prompt_token_count: Some(7),
            candidates_token_count: Some(11),
            thoughts_token_count: None,
            total_token_count: Some(18),
        });
        let completion =
            from_canonical(&response, "m", ThinkingDisposition::Verbatim, count_words);
        let usage = completion.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 11);
        assert_eq!(usage.total_tokens, 18);
        assert_eq!(
            completion.choices[0].finish_reason,
            Some(OpenAiFinishReason::Length)
        );
    }

    #[test]
    fn drop_disposition_hides_thinking() {
        let response = sample(
            vec![Part::thought("secret", None), Part::text("visible")],
            Some(FinishReason::Stop),
        );
        let completion =
            from_canonical(&response, "m", ThinkingDisposition::Drop, count_words);
        let message = &completion.choices[0].message;
        assert!(message.reasoning_content.is_none());
        assert_eq!(
            message.content,
            Some(MessageContent::Text("visible".to_string()))
        );
    }
}
