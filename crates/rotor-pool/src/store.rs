//! Credential persistence.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use rotor_common::{GatewayError, GatewayResult};
use tokio::sync::RwLock;

use crate::credential::CredentialRecord;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn list(&self) -> GatewayResult<Vec<(String, CredentialRecord)>>;
    async fn get(&self, name: &str) -> GatewayResult<Option<CredentialRecord>>;
    async fn put(&self, name: &str, record: &CredentialRecord) -> GatewayResult<()>;
    async fn delete(&self, name: &str) -> GatewayResult<()>;
}

/// One pretty-printed JSON document per credential in a flat directory;
/// the filename stem is the credential name.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> GatewayResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\', '.']) {
            return Err(GatewayError::Storage(format!(
                "invalid credential name: {name:?}"
            )));
        }
        Ok(self.dir.join(format!("{name}.json")))
    }
}

fn storage_err(context: &str, err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Storage(format!("{context}: {err}"))
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn list(&self) -> GatewayResult<Vec<(String, CredentialRecord)>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(storage_err("reading credentials dir", err)),
        };
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| storage_err("reading credentials dir", err))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|err| storage_err("reading credential file", err))?;
            match serde_json::from_str::<CredentialRecord>(&raw) {
                Ok(record) => entries.push((name.to_string(), record)),
                Err(err) => {
                    tracing::warn!(file = %path.display(), %err, "skipping unparsable credential");
                }
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn get(&self, name: &str) -> GatewayResult<Option<CredentialRecord>> {
        let path = self.path_for(name)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(storage_err("reading credential file", err)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| storage_err("parsing credential file", err))
    }

    async fn put(&self, name: &str, record: &CredentialRecord) -> GatewayResult<()> {
        let path = self.path_for(name)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| storage_err("creating credentials dir", err))?;
        let raw = serde_json::to_string_pretty(record)
            .map_err(|err| storage_err("serializing credential", err))?;
        tokio::fs::write(&path, raw)
            .await
            .map_err(|err| storage_err("writing credential file", err))
    }

    async fn delete(&self, name: &str) -> GatewayResult<()> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_err("deleting credential file", err)),
        }
    }
}

/// Test double keeping everything in a map.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, CredentialRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, name: &str, record: CredentialRecord) {
        self.records
            .write()
            .await
            .insert(name.to_string(), record);
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn list(&self) -> GatewayResult<Vec<(String, CredentialRecord)>> {
        let mut entries: Vec<_> = self
            .records
            .read()
            .await
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn get(&self, name: &str) -> GatewayResult<Option<CredentialRecord>> {
        Ok(self.records.read().await.get(name).cloned())
    }

    async fn put(&self, name: &str, record: &CredentialRecord) -> GatewayResult<()> {
        self.records
            .write()
            .await
            .insert(name.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> GatewayResult<()> {
        self.records.write().await.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Family;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        let record = CredentialRecord::new("rt", Family::GeminiCli);
        store.put("alpha", &record).await.unwrap();
        assert_eq!(store.get("alpha").await.unwrap(), Some(record));
        assert_eq!(store.list().await.unwrap().len(), 1);
        store.delete("alpha").await.unwrap();
        assert_eq!(store.get("alpha").await.unwrap(), None);
    }

    #[test]
    fn file_store_rejects_path_traversal_names() {
        let store = FileStore::new("/tmp/creds");
        assert!(store.path_for("../etc/passwd").is_err());
        assert!(store.path_for("ok-name_1").is_ok());
    }
}
