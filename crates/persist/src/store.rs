//! §4.6 "Writes are atomic: write to a sibling temp file, fsync, then
//! rename." One JSON document per sandbox id under a run-storage root.
use crate::error::PersistError;
use crate::state::{PersistedSandboxState, CURRENT_PERSIST_VERSION};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub struct PersistStore {
    run_store: PathBuf,
}

impl PersistStore {
    pub fn new(run_store: impl Into<PathBuf>) -> Self {
        Self {
            run_store: run_store.into(),
        }
    }

    fn state_path(&self, sandbox_id: &str) -> PathBuf {
        self.run_store.join(sandbox_id).join("state.json")
    }

    #[tracing::instrument(skip(self, state), fields(sandbox_id = %sandbox_id))]
    pub async fn save(
        &self,
        sandbox_id: &str,
        state: &PersistedSandboxState,
    ) -> Result<(), PersistError> {
        let dir = self.run_store.join(sandbox_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| PersistError::Io(dir.display().to_string(), e))?;

        let final_path = self.state_path(sandbox_id);
        let tmp_path = final_path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(&SortedKeys(state))
            .map_err(|e| PersistError::Corrupt(final_path.display().to_string(), e))?;

        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| PersistError::Io(tmp_path.display().to_string(), e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| PersistError::Io(tmp_path.display().to_string(), e))?;
        file.sync_all()
            .await
            .map_err(|e| PersistError::Io(tmp_path.display().to_string(), e))?;
        drop(file);

        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| PersistError::Io(final_path.display().to_string(), e))?;
        tracing::info!("persisted sandbox state");
        Ok(())
    }

    pub async fn load(&self, sandbox_id: &str) -> Result<PersistedSandboxState, PersistError> {
        let path = self.state_path(sandbox_id);
        let bytes = fs::read(&path)
            .await
            .map_err(|e| PersistError::Io(path.display().to_string(), e))?;
        let raw: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| PersistError::Corrupt(path.display().to_string(), e))?;
        let migrated = migrate(raw)?;
        serde_json::from_value(migrated)
            .map_err(|e| PersistError::Corrupt(path.display().to_string(), e))
    }

    /// §4.5 "Delete sandbox... delete persisted state; remove storage
    /// directory." Idempotent: a missing directory is not an error.
    pub async fn destroy(&self, sandbox_id: &str) -> Result<(), PersistError> {
        let dir = self.run_store.join(sandbox_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistError::Io(dir.display().to_string(), e)),
        }
    }

    pub fn exists(&self, sandbox_id: &str) -> bool {
        self.state_path(sandbox_id).exists()
    }

    pub fn run_store_path(&self) -> &Path {
        &self.run_store
    }
}

/// Upgrades an on-disk document written by an older persist version. There
/// is only one version so far; this is the hook future migrations attach
/// to rather than a no-op placeholder.
fn migrate(mut raw: serde_json::Value) -> Result<serde_json::Value, PersistError> {
    let found = raw
        .get("persist_version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    if found > CURRENT_PERSIST_VERSION {
        return Err(PersistError::Version {
            found,
            supported: CURRENT_PERSIST_VERSION,
        });
    }
    if found == 0 {
        if let Some(obj) = raw.as_object_mut() {
            obj.insert(
                "persist_version".to_string(),
                serde_json::Value::from(CURRENT_PERSIST_VERSION),
            );
        }
    }
    Ok(raw)
}

/// Serializes through a `BTreeMap`-backed pass so nested object keys come
/// out sorted, matching the on-disk contract in §6 ("JSON, UTF-8, sorted
/// keys, atomic writes").
struct SortedKeys<'a>(&'a PersistedSandboxState);

impl<'a> serde::Serialize for SortedKeys<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let value = serde_json::to_value(self.0).map_err(serde::ser::Error::custom)?;
        let sorted: std::collections::BTreeMap<String, serde_json::Value> =
            serde_json::from_value(value).map_err(serde::ser::Error::custom)?;
        sorted.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistStore::new(dir.path());
        let state = PersistedSandboxState::new("running");
        store.save("sb1", &state).await.unwrap();
        assert!(store.exists("sb1"));
        let loaded = store.load("sb1").await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistStore::new(dir.path());
        store.destroy("nonexistent").await.unwrap();
        let state = PersistedSandboxState::new("running");
        store.save("sb1", &state).await.unwrap();
        store.destroy("sb1").await.unwrap();
        assert!(!store.exists("sb1"));
        store.destroy("sb1").await.unwrap();
    }

    #[tokio::test]
    async fn future_persist_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistStore::new(dir.path());
        let mut state = PersistedSandboxState::new("running");
        state.persist_version = CURRENT_PERSIST_VERSION + 1;
        store.save("sb1", &state).await.unwrap();
        let err = store.load("sb1").await.unwrap_err();
        assert!(matches!(err, PersistError::Version { .. }));
    }
}
