//! Wire types for the protocols rotor speaks.
//!
//! `gemini` is the canonical representation every client protocol is
//! normalized to; `claude` and `openai` mirror the subset of those wire
//! formats the gateway reads and writes. No IO happens in this crate.

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod sse;
