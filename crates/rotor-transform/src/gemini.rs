//! Directive application and thought filtering on the canonical protocol.
//!
//! The native generate-content endpoints pass request bodies through
//! unchanged apart from what the model-name directive asks for; these
//! helpers are also the final step of the other normalizers.

use rotor_protocol::gemini::{
    Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, GoogleSearch,
    ImageConfig, Part, Tool,
};

use crate::directive::ModelDirective;
use crate::thinking::{
    THINKING_CLOSE_TAG, THINKING_OPEN_TAG, ThinkingDisposition, ThinkingOverride, thinking_config,
};

/// Fold directive toggles into a canonical request. An explicit
/// `thinkingBudget` already present in the body is kept as the explicit
/// value for budget resolution.
pub fn apply_directive(request: &mut GenerateContentRequest, directive: &ModelDirective) {
    let config = request.generation_config.get_or_insert_with(GenerationConfig::default);

    let explicit = config.thinking_config.as_ref().map(|t| t.thinking_budget);
    let include_thoughts = config
        .thinking_config
        .as_ref()
        .map(|t| t.include_thoughts)
        .unwrap_or(true);
    if explicit.is_some() || directive.thinking != ThinkingOverride::Default {
        config.thinking_config = Some(thinking_config(
            &directive.base_model,
            directive.thinking,
            explicit,
            include_thoughts,
        ));
    }

    if directive.image_size.is_some() || directive.aspect_ratio.is_some() {
        let image = config.image_config.get_or_insert_with(ImageConfig::default);
        if image.image_size.is_none() {
            image.image_size = directive.image_size.map(str::to_string);
        }
        if image.aspect_ratio.is_none() {
            image.aspect_ratio = directive.aspect_ratio.map(str::to_string);
        }
    }

    if directive.search {
        let tools = request.tools.get_or_insert_with(Vec::new);
        let already = tools.iter().any(|t| t.google_search.is_some());
        if !already {
            tools.push(Tool {
                google_search: Some(GoogleSearch {}),
                ..Tool::default()
            });
        }
    }
}

/// Rewrite thought parts in a passthrough response according to the
/// disposition. Verbatim keeps them, TextFallback merges them into
/// delimited visible text, Drop removes them.
pub fn filter_thoughts(response: &mut GenerateContentResponse, disposition: ThinkingDisposition) {
    if disposition == ThinkingDisposition::Verbatim {
        return;
    }
    for candidate in &mut response.candidates {
        filter_content(&mut candidate.content, disposition);
    }
}

fn filter_content(content: &mut Content, disposition: ThinkingDisposition) {
    match disposition {
        ThinkingDisposition::Verbatim => {}
        ThinkingDisposition::Drop => content.parts.retain(|p| !p.is_thought()),
        ThinkingDisposition::TextFallback => {
            for part in &mut content.parts {
                if part.is_thought() {
                    if let Some(text) = part.text.take() {
                        part.text =
                            Some(format!("{THINKING_OPEN_TAG}{text}{THINKING_CLOSE_TAG}"));
                    }
                    part.thought = None;
                    part.thought_signature = None;
                }
            }
        }
    }
}

/// Compatibility mode folds system text into the first user turn instead
/// of sending a separate system instruction.
pub fn fold_system_into_first_user(request: &mut GenerateContentRequest) {
    let Some(system) = request.system_instruction.take() else {
        return;
    };
    let system_text: String = system
        .parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n");
    if system_text.is_empty() {
        return;
    }
    let prefix = format!("System: {system_text}\n\n");
    match request
        .contents
        .iter_mut()
        .find(|c| c.role == Some(rotor_protocol::gemini::ContentRole::User))
    {
        Some(first_user) => {
            first_user.parts.insert(0, Part::text(prefix));
        }
        None => {
            request.contents.insert(
                0,
                Content {
                    parts: vec![Part::text(prefix)],
                    role: Some(rotor_protocol::gemini::ContentRole::User),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rotor_protocol::gemini::{Candidate, ContentRole};

    use crate::directive::parse_model;

    fn request_with_user(text: &str) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part::text(text)],
                role: Some(ContentRole::User),
            }],
            ..GenerateContentRequest::default()
        }
    }

    #[test]
    fn search_directive_adds_tool_once() {
        let directive = parse_model("gemini-2.5-pro-search");
        let mut request = request_with_user("hi");
        apply_directive(&mut request, &directive);
        apply_directive(&mut request, &directive);
        let tools = request.tools.as_ref().unwrap();
        assert_eq!(
            tools.iter().filter(|t| t.google_search.is_some()).count(),
            1
        );
    }

    #[test]
    fn nothinking_sets_family_floor() {
        let directive = parse_model("gemini-2.5-pro-nothinking");
        let mut request = request_with_user("hi");
        apply_directive(&mut request, &directive);
        let thinking = request
            .generation_config
            .unwrap()
            .thinking_config
            .unwrap();
        assert_eq!(thinking.thinking_budget, 128);
    }

    #[test]
    fn plain_model_leaves_thinking_untouched() {
        let directive = parse_model("gemini-2.5-pro");
        let mut request = request_with_user("hi");
        apply_directive(&mut request, &directive);
        assert!(
            request
                .generation_config
                .map(|c| c.thinking_config.is_none())
                .unwrap_or(true)
        );
    }

    #[test]
    fn drop_disposition_removes_thoughts() {
        let mut response = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    parts: vec![Part::thought("pondering", None), Part::text("answer")],
                    role: Some(ContentRole::Model),
                },
                finish_reason: None,
                index: None,
            }],
            ..GenerateContentResponse::default()
        };
        filter_thoughts(&mut response, ThinkingDisposition::Drop);
        let parts = &response.candidates[0].content.parts;
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].text.as_deref(), Some("answer"));
    }

    #[test]
    fn fallback_disposition_wraps_thoughts() {
        let mut response = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    parts: vec![Part::thought("pondering", Some("sig".into()))],
                    role: Some(ContentRole::Model),
                },
                finish_reason: None,
                index: None,
            }],
            ..GenerateContentResponse::default()
        };
        filter_thoughts(&mut response, ThinkingDisposition::TextFallback);
        let part = &response.candidates[0].content.parts[0];
        assert!(part.text.as_ref().unwrap().contains("<assistant_thinking>"));
        assert!(part.thought.is_none());
        assert!(part.thought_signature.is_none());
    }

    #[test]
    fn system_folding_prefixes_first_user_turn() {
        let mut request = request_with_user("question");
        request.system_instruction = Some(Content {
            parts: vec![Part::text("be terse")],
            role: None,
        });
        fold_system_into_first_user(&mut request);
        assert!(request.system_instruction.is_none());
        let first = &request.contents[0].parts[0];
        assert_eq!(first.text.as_deref(), Some("System: be terse\n\n"));
    }
}
