//! Model-name directive grammar.
//!
//! Clients steer per-request behavior through the model name itself: an
//! optional slash-separated prefix picks the streaming mode, and dash
//! suffixes toggle thinking, search grounding, and image parameters.
//! Suffixes combine in any order. Anything unrecognized stays part of
//! the base model name, so unknown models pass through untouched.

use crate::thinking::ThinkingOverride;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Upstream streaming relayed as-is.
    #[default]
    Normal,
    /// Non-streaming upstream call replayed to the client as a stream.
    Buffered,
    /// Streaming with the truncation guard active.
    AntiTruncation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDirective {
    pub base_model: String,
    pub stream_mode: StreamMode,
    pub thinking: ThinkingOverride,
    pub search: bool,
    /// "1K" | "2K" | "4K".
    pub image_size: Option<&'static str>,
    /// e.g. "16:9".
    pub aspect_ratio: Option<&'static str>,
}

impl ModelDirective {
    pub fn plain(base_model: impl Into<String>) -> Self {
        Self {
            base_model: base_model.into(),
            stream_mode: StreamMode::Normal,
            thinking: ThinkingOverride::Default,
            search: false,
            image_size: None,
            aspect_ratio: None,
        }
    }
}

const SIZE_SUFFIXES: &[(&str, &str)] = &[("-1k", "1K"), ("-2k", "2K"), ("-4k", "4K")];

const ASPECT_SUFFIXES: &[(&str, &str)] = &[
    ("-16x9", "16:9"),
    ("-9x16", "9:16"),
    ("-21x9", "21:9"),
    ("-1x1", "1:1"),
    ("-2x3", "2:3"),
    ("-3x2", "3:2"),
    ("-4x3", "4:3"),
    ("-3x4", "3:4"),
];

pub fn parse_model(model: &str) -> ModelDirective {
    let (rest, stream_mode) = if let Some(rest) = model.strip_prefix("buffered/") {
        (rest, StreamMode::Buffered)
    } else if let Some(rest) = model.strip_prefix("antitrunc/") {
        (rest, StreamMode::AntiTruncation)
    } else {
        (model, StreamMode::Normal)
    };

    let mut directive = ModelDirective {
        stream_mode,
        ..ModelDirective::plain(rest)
    };

    // Strip recognized suffixes and trailing date stamps until the name
    // stabilizes. Longest candidates are tried first so that "-maxthinking"
    // never loses its tail to a shorter match.
    loop {
        let name = directive.base_model.clone();

        if let Some(base) = name.strip_suffix("-maxthinking") {
            directive.thinking = ThinkingOverride::Maximum;
            directive.base_model = base.to_string();
            continue;
        }
        if let Some(base) = name.strip_suffix("-nothinking") {
            directive.thinking = ThinkingOverride::Disabled;
            directive.base_model = base.to_string();
            continue;
        }
        if let Some(base) = name.strip_suffix("-search") {
            directive.search = true;
            directive.base_model = base.to_string();
            continue;
        }
        if let Some((base, ratio)) = strip_mapped(&name, ASPECT_SUFFIXES) {
            directive.aspect_ratio = Some(ratio);
            directive.base_model = base;
            continue;
        }
        if let Some((base, size)) = strip_mapped(&name, SIZE_SUFFIXES) {
            directive.image_size = Some(size);
            directive.base_model = base;
            continue;
        }
        if let Some(base) = strip_date_stamp(&name) {
            directive.base_model = base;
            continue;
        }
        break;
    }

    directive
}

fn strip_mapped(name: &str, table: &[(&'static str, &'static str)]) -> Option<(String, &'static str)> {
    for (suffix, value) in table {
        if let Some(base) = name.strip_suffix(suffix) {
            return Some((base.to_string(), value));
        }
    }
    None
}

/// Collapse a trailing `-YYYYMMDD` release stamp.
fn strip_date_stamp(name: &str) -> Option<String> {
    let (base, tail) = name.rsplit_once('-')?;
    if tail.len() == 8 && tail.bytes().all(|b| b.is_ascii_digit()) && !base.is_empty() {
        Some(base.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_model_passes_through() {
        let d = parse_model("gemini-2.5-pro");
        assert_eq!(d.base_model, "gemini-2.5-pro");
        assert_eq!(d.stream_mode, StreamMode::Normal);
        assert_eq!(d.thinking, ThinkingOverride::Default);
        assert!(!d.search);
    }

    #[test]
    fn prefixes_pick_stream_mode() {
        assert_eq!(
            parse_model("buffered/gemini-2.5-flash").stream_mode,
            StreamMode::Buffered
        );
        assert_eq!(
            parse_model("antitrunc/gemini-2.5-pro").stream_mode,
            StreamMode::AntiTruncation
        );
    }

    #[test]
    fn suffixes_combine_in_any_order() {
        let a = parse_model("gemini-2.5-pro-search-maxthinking");
        let b = parse_model("gemini-2.5-pro-maxthinking-search");
        assert_eq!(a.base_model, "gemini-2.5-pro");
        assert_eq!(b.base_model, "gemini-2.5-pro");
        assert_eq!(a.thinking, ThinkingOverride::Maximum);
        assert_eq!(b.thinking, ThinkingOverride::Maximum);
        assert!(a.search && b.search);
    }

    #[test]
    fn nothinking_does_not_shadow_maxthinking() {
        assert_eq!(
            parse_model("gemini-2.5-flash-maxthinking").thinking,
            ThinkingOverride::Maximum
        );
        assert_eq!(
            parse_model("gemini-2.5-flash-nothinking").thinking,
            ThinkingOverride::Disabled
        );
    }

    #[test]
    fn date_stamp_collapses() {
        assert_eq!(parse_model("gemini-2.5-pro-20250605").base_model, "gemini-2.5-pro");
        assert_eq!(
            parse_model("gemini-2.5-pro-20250605-nothinking").base_model,
            "gemini-2.5-pro"
        );
    }

    #[test]
    fn image_suffixes() {
        let d = parse_model("gemini-2.5-flash-image-4k-16x9");
        assert_eq!(d.base_model, "gemini-2.5-flash-image");
        assert_eq!(d.image_size, Some("4K"));
        assert_eq!(d.aspect_ratio, Some("16:9"));
    }

    #[test]
    fn unknown_tail_fails_open() {
        let d = parse_model("gemini-2.5-pro-experimental");
        assert_eq!(d.base_model, "gemini-2.5-pro-experimental");
    }

    #[test]
    fn parse_is_idempotent_on_base_name() {
        for model in [
            "gemini-2.5-pro-maxthinking-search-16x9",
            "buffered/gemini-2.5-flash-nothinking",
            "antitrunc/gemini-2.5-pro-20250605-search",
        ] {
            let once = parse_model(model);
            let twice = parse_model(&once.base_model);
            assert_eq!(twice.base_model, once.base_model);
            assert_eq!(twice.thinking, ThinkingOverride::Default);
            assert!(!twice.search);
        }
    }
}
