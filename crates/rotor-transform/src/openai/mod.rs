//! OpenAI chat-completions protocol to/from the canonical representation.

mod request;
mod response;
mod stream;

pub use request::to_canonical;
pub use response::from_canonical;
pub use stream::OpenAiStreamState;
