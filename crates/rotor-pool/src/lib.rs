//! Credential management: the rotating pool, OAuth token refresh, and
//! the persistence layer behind them.

pub mod credential;
pub mod oauth;
pub mod pool;
pub mod store;

pub use credential::{Credential, CredentialRecord, Family};
pub use oauth::{TokenGrant, TokenRefresher, TokenSource};
pub use pool::{CredentialPool, Lease, PoolConfig};
pub use store::{CredentialStore, FileStore, MemoryStore};
