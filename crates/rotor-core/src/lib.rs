//! Request dispatch: upstream HTTP, retry and rotation, the truncation
//! guard, and the token-estimation fallback.

pub mod dispatch;
pub mod tokens;
pub mod truncation;
pub mod upstream;

pub use dispatch::{CanonicalStream, Dispatcher};
pub use tokens::estimate_tokens;
pub use truncation::{Decision, RetryAttempt, TruncationGuard, default_predicate};
pub use upstream::{Upstream, UpstreamClient};
