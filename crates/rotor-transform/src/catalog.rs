//! Static model catalog served by the listing endpoints.

/// Base upstream models the gateway fronts.
pub const BASE_MODELS: &[&str] = &[
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gemini-2.5-flash-lite",
];

const SUFFIX_VARIANTS: &[&str] = &["", "-nothinking", "-maxthinking", "-search"];
const PREFIX_VARIANTS: &[&str] = &["", "buffered/", "antitrunc/"];

/// Every advertised model id: each base model crossed with the directive
/// prefixes and the common suffixes.
pub fn model_ids() -> Vec<String> {
    let mut ids = Vec::new();
    for prefix in PREFIX_VARIANTS {
        for base in BASE_MODELS {
            for suffix in SUFFIX_VARIANTS {
                ids.push(format!("{prefix}{base}{suffix}"));
            }
        }
    }
    ids
}
