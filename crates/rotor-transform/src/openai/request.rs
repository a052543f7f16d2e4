//! Chat-completions request normalization.

use std::collections::HashMap;

use rotor_common::GatewayError;
use rotor_protocol::gemini::{
    Blob, Content, ContentRole, FunctionCall, FunctionCallingConfig, FunctionCallingMode,
    FunctionDeclaration, FunctionResponse, GenerateContentRequest, GenerationConfig, Part, Tool,
    ToolConfig,
};
use rotor_protocol::openai::{
    ChatCompletionRequest, ChatRole, ContentPart, MessageContent, StopSequences, ToolChoice,
};
use serde_json::json;

use crate::directive::ModelDirective;
use crate::gemini::{apply_directive, fold_system_into_first_user};
use crate::json::remove_nulls;
use crate::thinking::SKIP_SIGNATURE_SENTINEL;

pub fn to_canonical(
    request: &ChatCompletionRequest,
    directive: &ModelDirective,
    compatibility_mode: bool,
) -> Result<GenerateContentRequest, GatewayError> {
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }

    let mut canonical = GenerateContentRequest::default();
    let mut system_texts: Vec<String> = Vec::new();
    let mut tool_names: HashMap<String, String> = HashMap::new();

    for message in &request.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                if let Some(text) = plain_text(message.content.as_ref()) {
                    system_texts.push(text);
                }
            }
            ChatRole::User => {
                let parts = user_parts(message.content.as_ref())?;
                if !parts.is_empty() {
                    canonical.contents.push(Content {
                        parts,
                        role: Some(ContentRole::User),
                    });
                }
            }
            ChatRole::Assistant => {
                let mut parts = Vec::new();
                if let Some(text) = plain_text(message.content.as_ref()) {
                    if !text.is_empty() {
                        parts.push(Part::text(text));
                    }
                }
                for call in message.tool_calls.iter().flatten() {
                    tool_names.insert(call.id.clone(), call.function.name.clone());
                    let args = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| json!({}));
                    parts.push(Part {
                        function_call: Some(FunctionCall {
                            id: Some(call.id.clone()),
                            name: call.function.name.clone(),
                            args: Some(remove_nulls(args)),
                        }),
                        thought_signature: Some(SKIP_SIGNATURE_SENTINEL.to_string()),
                        ..Part::default()
                    });
                }
                if !parts.is_empty() {
                    canonical.contents.push(Content {
                        parts,
                        role: Some(ContentRole::Model),
                    });
                }
            }
            ChatRole::Tool => {
                let call_id = message.tool_call_id.clone().unwrap_or_default();
                let name = tool_names
                    .get(&call_id)
                    .cloned()
                    .or_else(|| message.name.clone())
                    .unwrap_or_else(|| "unknown_tool".to_string());
                let text = plain_text(message.content.as_ref()).unwrap_or_default();
                canonical.contents.push(Content {
                    parts: vec![Part {
                        function_response: Some(FunctionResponse {
                            id: (!call_id.is_empty()).then_some(call_id),
                            name,
                            response: json!({ "result": text }),
                        }),
                        ..Part::default()
                    }],
                    role: Some(ContentRole::User),
                });
            }
        }
    }

    if !system_texts.is_empty() {
        canonical.system_instruction = Some(Content {
            parts: vec![Part::text(system_texts.join("\n\n"))],
            role: None,
        });
    }

    if let Some(tools) = &request.tools {
        let declarations: Vec<FunctionDeclaration> = tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.function.name.clone(),
                description: tool.function.description.clone().unwrap_or_default(),
                parameters_json_schema: tool
                    .function
                    .parameters
                    .clone()
                    .map(remove_nulls),
            })
            .collect();
        if !declarations.is_empty() {
            canonical.tools = Some(vec![Tool {
                function_declarations: Some(declarations),
                ..Tool::default()
            }]);
        }
    }

    canonical.tool_config = request.tool_choice.as_ref().and_then(tool_config);

    canonical.generation_config = Some(GenerationConfig {
        max_output_tokens: request.max_completion_tokens.or(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: request.stop.as_ref().map(|stop| match stop {
            StopSequences::One(s) => vec![s.clone()],
            StopSequences::Many(list) => list.clone(),
        }),
        ..GenerationConfig::default()
    });

    apply_directive(&mut canonical, directive);
    if compatibility_mode {
        fold_system_into_first_user(&mut canonical);
    }
    Ok(canonical)
}

fn plain_text(content: Option<&MessageContent>) -> Option<String> {
    match content? {
        MessageContent::Text(text) => Some(text.clone()),
        MessageContent::Parts(parts) => Some(
            parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
    }
}

fn user_parts(content: Option<&MessageContent>) -> Result<Vec<Part>, GatewayError> {
    let Some(content) = content else {
        return Ok(Vec::new());
    };
    match content {
        MessageContent::Text(text) => Ok(vec![Part::text(text.clone())]),
        MessageContent::Parts(parts) => {
            let mut converted = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => converted.push(Part::text(text.clone())),
                    ContentPart::ImageUrl { image_url } => {
                        let (mime_type, data) = parse_data_uri(&image_url.url)?;
                        converted.push(Part {
                            inline_data: Some(Blob { mime_type, data }),
                            ..Part::default()
                        });
                    }
                }
            }
            Ok(converted)
        }
    }
}

/// Accepts `data:<mime>;base64,<payload>` URIs only; remote URLs are not
/// fetched on the client's behalf.
fn parse_data_uri(url: &str) -> Result<(String, String), GatewayError> {
    let unsupported = || {
        GatewayError::UnsupportedContent(
            "image URLs must be base64 data URIs".to_string(),
        )
    };
    let rest = url.strip_prefix("data:").ok_or_else(unsupported)?;
    let (header, payload) = rest.split_once(',').ok_or_else(unsupported)?;
    let mime = header.strip_suffix(";base64").ok_or_else(unsupported)?;
    Ok((mime.to_string(), payload.to_string()))
}

fn tool_config(choice: &ToolChoice) -> Option<ToolConfig> {
    let config = match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "auto" => FunctionCallingConfig {
                mode: Some(FunctionCallingMode::Auto),
                allowed_function_names: None,
            },
            "none" => FunctionCallingConfig {
                mode: Some(FunctionCallingMode::None),
                allowed_function_names: None,
            },
            "required" => FunctionCallingConfig {
                mode: Some(FunctionCallingMode::Any),
                allowed_function_names: None,
            },
            _ => return None,
        },
        ToolChoice::Named(named) => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Any),
            allowed_function_names: Some(vec![named.function.name.clone()]),
        },
    };
    Some(ToolConfig {
        function_calling_config: Some(config),
    })
}
