//! Output-token estimation for responses whose usage metadata the
//! upstream omitted.

/// Rough token count: one token per four characters, never zero for
/// non-empty text. Deliberately coarse; it only fills usage gaps.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    (chars as u32).div_ceil(4)
}
