//! Protocol translation.
//!
//! Every client request is normalized into the canonical generate-content
//! representation before dispatch, and every upstream response or stream
//! chunk is re-emitted in the client's own wire format. Model directives
//! (prefixes and suffixes on the model name) are parsed here as well.

pub mod catalog;
pub mod claude;
pub mod directive;
pub mod gemini;
pub mod json;
pub mod openai;
pub mod thinking;

pub use directive::{ModelDirective, StreamMode, parse_model};
pub use thinking::{ThinkingDisposition, ThinkingOverride};
