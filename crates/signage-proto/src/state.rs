use crate::protocol::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// On-disk record of the paired identity, so a restarted kiosk resumes its
/// session without a new pairing code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    pub identity: Option<DeviceIdentity>,
}

pub struct IdentityStore {
    state_file: PathBuf,
}

impl IdentityStore {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    /// Returns the stored identity.  A missing or unreadable file is treated
    /// as "never paired".
    pub fn load(&self) -> Option<DeviceIdentity> {
        let content = std::fs::read_to_string(&self.state_file).ok()?;
        match serde_json::from_str::<PersistentState>(&content) {
            Ok(persistent) => persistent.identity,
            Err(e) => {
                warn!(
                    "Ignoring unreadable state file {}: {}",
                    self.state_file.display(),
                    e
                );
                None
            }
        }
    }

    pub async fn save(&self, identity: &DeviceIdentity) -> anyhow::Result<()> {
        let persistent = PersistentState {
            identity: Some(identity.clone()),
        };
        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        match tokio::fs::remove_file(&self.state_file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "dev-42".into(),
            device_name: "Lobby".into(),
            pairing_code: "AB12CD".into(),
        }
    }

    #[tokio::test]
    async fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("sub").join("state.json"));
        assert!(store.load().is_none());

        store.save(&identity()).await.unwrap();
        assert_eq!(store.load(), Some(identity()));

        store.clear().await.unwrap();
        assert!(store.load().is_none());
        // clearing twice is fine
        store.clear().await.unwrap();
    }

    #[test]
    fn test_corrupt_file_reads_as_unpaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(IdentityStore::new(path).load().is_none());
    }
}
