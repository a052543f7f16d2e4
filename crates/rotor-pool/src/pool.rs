//! The rotating credential pool.
//!
//! Rotation is round-robin over the load order. The active credential
//! serves `calls_per_rotation` calls before the cursor advances; banned
//! entries are skipped. Cursor movement happens in one critical section,
//! while per-credential mutation is serialized by per-entry locks so a
//! slow token refresh never stalls the whole pool.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rotor_common::{GatewayError, GatewayResult, Outcome};
use tokio::sync::Mutex;

use crate::credential::{Credential, Family};
use crate::oauth::TokenSource;
use crate::store::CredentialStore;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub calls_per_rotation: u32,
    pub auto_ban: bool,
    pub auto_ban_error_codes: Vec<u16>,
    pub auto_ban_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            calls_per_rotation: 100,
            auto_ban: true,
            auto_ban_error_codes: vec![400, 403],
            auto_ban_threshold: 3,
        }
    }
}

/// What a dispatched request needs from the pool.
#[derive(Debug, Clone)]
pub struct Lease {
    pub name: String,
    pub access_token: String,
    pub project_id: Option<String>,
    pub family: Family,
}

struct Rotation {
    order: Vec<String>,
    cursor: usize,
}

pub struct CredentialPool {
    rotation: Mutex<Rotation>,
    entries: HashMap<String, Arc<Mutex<Credential>>>,
    store: Arc<dyn CredentialStore>,
    tokens: Arc<dyn TokenSource>,
    config: PoolConfig,
}

impl CredentialPool {
    /// Load every credential from the store.
    pub async fn load(
        store: Arc<dyn CredentialStore>,
        tokens: Arc<dyn TokenSource>,
        config: PoolConfig,
    ) -> GatewayResult<Self> {
        let records = store.list().await?;
        let mut order = Vec::with_capacity(records.len());
        let mut entries = HashMap::with_capacity(records.len());
        for (name, record) in records {
            order.push(name.clone());
            entries.insert(
                name.clone(),
                Arc::new(Mutex::new(Credential::new(name, record))),
            );
        }
        tracing::info!(count = order.len(), "credential pool loaded");
        Ok(Self {
            rotation: Mutex::new(Rotation { order, cursor: 0 }),
            entries,
            store,
            tokens,
            config,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pick the active credential, refreshing its token if needed.
    ///
    /// Walks the ring at most once; every candidate whose refresh fails is
    /// skipped for this walk. When no usable entry remains the pool is
    /// exhausted.
    pub async fn acquire(&self) -> GatewayResult<Lease> {
        let mut skipped: HashSet<String> = HashSet::new();
        loop {
            let Some((name, entry)) = self.select_candidate(&skipped).await else {
                tracing::error!("credential pool exhausted");
                return Err(GatewayError::PoolExhausted);
            };
            match self.lease_from(&name, &entry).await {
                Ok(lease) => return Ok(lease),
                Err(err) => {
                    tracing::warn!(credential = %name, %err, "credential unusable, skipping");
                    skipped.insert(name);
                }
            }
        }
    }

    /// Record the outcome of one upstream call. Called exactly once per
    /// dispatched attempt.
    pub async fn report(&self, name: &str, outcome: &Outcome) {
        let Some(entry) = self.entries.get(name) else {
            return;
        };
        let mut credential = entry.lock().await;
        match outcome {
            Outcome::Success => {
                credential.consecutive_errors = 0;
            }
            Outcome::Cancelled => {}
            Outcome::RateLimited => {
                // Push the cursor past this entry on the next acquire.
                credential.calls_since_rotation = self.config.calls_per_rotation;
            }
            Outcome::AuthError(code) | Outcome::OtherError(Some(code)) => {
                if self.config.auto_ban && self.config.auto_ban_error_codes.contains(code) {
                    credential.consecutive_errors += 1;
                    if credential.consecutive_errors >= self.config.auto_ban_threshold
                        && !credential.record.banned
                    {
                        let now = unix_now();
                        credential.ban(format!("auto-ban after repeated {code}"), now);
                        tracing::warn!(credential = %name, code, "credential banned");
                        self.persist(&mut credential).await;
                    }
                }
            }
            Outcome::OtherError(None) => {}
        }
    }

    pub async fn unban(&self, name: &str) -> GatewayResult<()> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown credential: {name}")))?;
        let mut credential = entry.lock().await;
        credential.unban();
        self.persist(&mut credential).await;
        Ok(())
    }

    pub async fn banned_names(&self) -> Vec<String> {
        let mut banned = Vec::new();
        for (name, entry) in &self.entries {
            if entry.lock().await.record.banned {
                banned.push(name.clone());
            }
        }
        banned.sort();
        banned
    }

    async fn select_candidate(
        &self,
        skipped: &HashSet<String>,
    ) -> Option<(String, Arc<Mutex<Credential>>)> {
        let mut rotation = self.rotation.lock().await;
        if rotation.order.is_empty() {
            return None;
        }
        let len = rotation.order.len();
        for _ in 0..len {
            let name = rotation.order[rotation.cursor].clone();
            let Some(entry) = self.entries.get(&name) else {
                rotation.cursor = (rotation.cursor + 1) % len;
                continue;
            };
            let mut credential = entry.lock().await;
            if credential.record.banned || skipped.contains(&name) {
                rotation.cursor = (rotation.cursor + 1) % len;
                continue;
            }
            if credential.calls_since_rotation >= self.config.calls_per_rotation {
                credential.calls_since_rotation = 0;
                rotation.cursor = (rotation.cursor + 1) % len;
                continue;
            }
            credential.calls_since_rotation += 1;
            credential.last_used = Some(unix_now());
            return Some((name, Arc::clone(entry)));
        }
        None
    }

    async fn lease_from(
        &self,
        name: &str,
        entry: &Arc<Mutex<Credential>>,
    ) -> GatewayResult<Lease> {
        let mut credential = entry.lock().await;
        let now = unix_now();
        if !credential.token_valid(now) {
            let grant = self
                .tokens
                .refresh(credential.record.family, &credential.record.refresh_token)
                .await?;
            credential.record.access_token = Some(grant.access_token);
            credential.record.expiry = Some(now + grant.expires_in);
            self.persist(&mut credential).await;
        }
        let access_token = credential
            .record
            .access_token
            .clone()
            .ok_or_else(|| GatewayError::UpstreamAuth {
                status: 401,
                message: format!("credential {name} has no access token"),
            })?;
        Ok(Lease {
            name: name.to_string(),
            access_token,
            project_id: credential.record.project_id.clone(),
            family: credential.record.family,
        })
    }

    async fn persist(&self, credential: &mut Credential) {
        if let Err(err) = self
            .store
            .put(&credential.name, &credential.record)
            .await
        {
            tracing::warn!(credential = %credential.name, %err, "failed to persist credential");
        }
    }
}

fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
