//! Thinking-budget resolution and thought-content disposition.

use rotor_protocol::gemini::ThinkingConfig;

/// The upstream rejects function calls without a thought signature; this
/// sentinel satisfies the validator when no real signature exists.
pub const SKIP_SIGNATURE_SENTINEL: &str = "skip_thought_signature_validator";

/// Delimiters used when thinking is merged into visible text.
pub const THINKING_OPEN_TAG: &str = "<assistant_thinking>\n";
pub const THINKING_CLOSE_TAG: &str = "\n</assistant_thinking>\n\n";

/// Budget sent when the model should pick its own.
pub const BUDGET_AUTO: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingOverride {
    #[default]
    Default,
    Disabled,
    Maximum,
}

/// What happens to thought parts on the way back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingDisposition {
    /// Client speaks thinking natively; relay thought content as-is.
    Verbatim,
    /// Merge thoughts into the visible answer between delimiter tags.
    TextFallback,
    Drop,
}

impl ThinkingDisposition {
    pub fn for_client(client_handles_thinking: bool, text_fallback: bool) -> Self {
        if client_handles_thinking {
            Self::Verbatim
        } else if text_fallback {
            Self::TextFallback
        } else {
            Self::Drop
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Pro,
    Flash,
}

impl Family {
    fn of(base_model: &str) -> Self {
        if base_model.contains("flash") {
            Self::Flash
        } else {
            Self::Pro
        }
    }

    /// Budget floor when thinking is disabled. Pro models cannot turn
    /// thinking fully off.
    fn floor(self) -> i32 {
        match self {
            Self::Pro => 128,
            Self::Flash => 0,
        }
    }

    fn ceiling(self) -> i32 {
        match self {
            Self::Pro => 32768,
            Self::Flash => 24576,
        }
    }
}

/// Resolve the effective thinking budget for a request.
///
/// Precedence: an explicit per-request budget wins over the model-name
/// suffix, which wins over the automatic default. The result is clamped
/// into the family's supported range.
pub fn resolve_budget(
    base_model: &str,
    directive: ThinkingOverride,
    explicit: Option<i32>,
) -> i32 {
    let family = Family::of(base_model);
    let requested = match (explicit, directive) {
        (Some(budget), _) => budget,
        (None, ThinkingOverride::Disabled) => 0,
        (None, ThinkingOverride::Maximum) => family.ceiling(),
        (None, ThinkingOverride::Default) => return BUDGET_AUTO,
    };
    requested.clamp(family.floor(), family.ceiling())
}

pub fn thinking_config(
    base_model: &str,
    directive: ThinkingOverride,
    explicit: Option<i32>,
    include_thoughts: bool,
) -> ThinkingConfig {
    ThinkingConfig {
        include_thoughts,
        thinking_budget: resolve_budget(base_model, directive, explicit),
    }
}
