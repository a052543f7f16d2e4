//! Messages-request normalization.

use std::collections::HashMap;

use rotor_common::GatewayError;
use rotor_protocol::claude::{
    ContentBlockParam, ImageSource, MessageContent, MessagesRequest, Role, SystemParam,
    ThinkingConfigParam, ToolChoice, ToolResultContent,
};
use rotor_protocol::gemini::{
    Blob, Content, ContentRole, FunctionCall, FunctionCallingConfig, FunctionCallingMode,
    FunctionDeclaration, FunctionResponse, GenerateContentRequest, GenerationConfig, Part,
    ThinkingConfig, Tool, ToolConfig,
};
use serde_json::json;

use crate::directive::ModelDirective;
use crate::gemini::{apply_directive, fold_system_into_first_user};
use crate::json::remove_nulls;
use crate::thinking::SKIP_SIGNATURE_SENTINEL;

pub fn to_canonical(
    request: &MessagesRequest,
    directive: &ModelDirective,
    compatibility_mode: bool,
) -> Result<GenerateContentRequest, GatewayError> {
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }

    let mut canonical = GenerateContentRequest {
        system_instruction: request.system.as_ref().map(system_content),
        ..GenerateContentRequest::default()
    };

    // tool_use id -> tool name, so tool results can name the function
    // they answer.
    let mut tool_names: HashMap<String, String> = HashMap::new();

    for message in &request.messages {
        let role = match message.role {
            Role::User => ContentRole::User,
            Role::Assistant => ContentRole::Model,
        };
        let parts = match &message.content {
            MessageContent::Text(text) => vec![Part::text(text.clone())],
            MessageContent::Blocks(blocks) => convert_blocks(blocks, &mut tool_names)?,
        };
        if parts.is_empty() {
            continue;
        }
        canonical.contents.push(Content {
            parts,
            role: Some(role),
        });
    }

    if let Some(tools) = &request.tools {
        let declarations: Vec<FunctionDeclaration> = tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone().unwrap_or_default(),
                parameters_json_schema: Some(remove_nulls(tool.input_schema.clone())),
            })
            .collect();
        if !declarations.is_empty() {
            canonical.tools = Some(vec![Tool {
                function_declarations: Some(declarations),
                ..Tool::default()
            }]);
        }
    }

    canonical.tool_config = request.tool_choice.as_ref().map(tool_config);

    let mut config = GenerationConfig {
        max_output_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        stop_sequences: request.stop_sequences.clone(),
        ..GenerationConfig::default()
    };
    config.thinking_config = match &request.thinking {
        Some(ThinkingConfigParam::Enabled { budget_tokens }) => Some(ThinkingConfig {
            include_thoughts: true,
            thinking_budget: *budget_tokens as i32,
        }),
        Some(ThinkingConfigParam::Disabled) => Some(ThinkingConfig {
            include_thoughts: false,
            thinking_budget: 0,
        }),
        None => None,
    };
    canonical.generation_config = Some(config);

    apply_directive(&mut canonical, directive);
    if compatibility_mode {
        fold_system_into_first_user(&mut canonical);
    }
    Ok(canonical)
}

fn system_content(system: &SystemParam) -> Content {
    let parts = match system {
        SystemParam::Text(text) => vec![Part::text(text.clone())],
        SystemParam::Blocks(blocks) => blocks
            .iter()
            .map(|block| Part::text(block.text.clone()))
            .collect(),
    };
    Content { parts, role: None }
}

fn convert_blocks(
    blocks: &[ContentBlockParam],
    tool_names: &mut HashMap<String, String>,
) -> Result<Vec<Part>, GatewayError> {
    let mut parts = Vec::new();
    // The most recent thinking block in this turn donates its signature
    // to the tool calls that follow it.
    let mut last_signature: Option<String> = None;

    for block in blocks {
        match block {
            ContentBlockParam::Text { text } => parts.push(Part::text(text.clone())),
            ContentBlockParam::Image { source } => match source {
                ImageSource::Base64 { media_type, data } => parts.push(Part {
                    inline_data: Some(Blob {
                        mime_type: media_type.clone(),
                        data: data.clone(),
                    }),
                    ..Part::default()
                }),
                ImageSource::Url { .. } => {
                    return Err(GatewayError::UnsupportedContent(
                        "remote image URLs are not supported; send base64 content".to_string(),
                    ));
                }
            },
            ContentBlockParam::Thinking {
                thinking,
                signature,
            } => {
                if let Some(signature) = signature {
                    last_signature = Some(signature.clone());
                }
                parts.push(Part::thought(thinking.clone(), signature.clone()));
            }
            ContentBlockParam::RedactedThinking { .. } => {}
            ContentBlockParam::ToolUse { id, name, input } => {
                tool_names.insert(id.clone(), name.clone());
                let signature = last_signature
                    .clone()
                    .unwrap_or_else(|| SKIP_SIGNATURE_SENTINEL.to_string());
                parts.push(Part {
                    function_call: Some(FunctionCall {
                        id: Some(id.clone()),
                        name: name.clone(),
                        args: Some(remove_nulls(input.clone())),
                    }),
                    thought_signature: Some(signature),
                    ..Part::default()
                });
            }
            ContentBlockParam::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let name = tool_names
                    .get(tool_use_id)
                    .cloned()
                    .unwrap_or_else(|| "unknown_tool".to_string());
                let text = tool_result_text(content.as_ref());
                let response = if is_error.unwrap_or(false) {
                    json!({ "error": text })
                } else {
                    json!({ "result": text })
                };
                parts.push(Part {
                    function_response: Some(FunctionResponse {
                        id: Some(tool_use_id.clone()),
                        name,
                        response,
                    }),
                    ..Part::default()
                });
            }
        }
    }
    Ok(parts)
}

fn tool_result_text(content: Option<&ToolResultContent>) -> String {
    match content {
        None => String::new(),
        Some(ToolResultContent::Text(text)) => text.clone(),
        Some(ToolResultContent::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlockParam::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn tool_config(choice: &ToolChoice) -> ToolConfig {
    let config = match choice {
        ToolChoice::Auto => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Auto),
            allowed_function_names: None,
        },
        ToolChoice::Any => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Any),
            allowed_function_names: None,
        },
        ToolChoice::None => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::None),
            allowed_function_names: None,
        },
        ToolChoice::Tool { name } => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Any),
            allowed_function_names: Some(vec![name.clone()]),
        },
    };
    ToolConfig {
        function_calling_config: Some(config),
    }
}
