use proxy_hub_error::{HubError, HubResult};
use proxy_hub_sdk::ProxyDevice;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LINKED_FILE: &str = "devices.json";

/// Disk store for the linked-device map, one JSON object keyed by the dotted
/// device id. The file carries device tokens, so it is written `0600`.
#[derive(Debug, Clone)]
pub struct LinkedStore {
    path: PathBuf,
}

impl LinkedStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(LINKED_FILE),
        }
    }

    /// Load the persisted map. Startup is lenient: a missing or unreadable
    /// file just yields an empty map.
    pub async fn load(&self) -> HashMap<String, ProxyDevice> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no persisted linked devices");
                return HashMap::new();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "persisted linked devices unreadable, starting empty");
                HashMap::new()
            }
        }
    }

    /// Write the whole map. Failures surface to the caller; the hub logs and
    /// carries on, since the in-memory state stays authoritative.
    pub async fn save(&self, devices: &HashMap<String, ProxyDevice>) -> HubResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(devices)
            .map_err(|e| HubError::Msg(format!("serializing linked devices: {e}")))?;
        tokio::fs::write(&self.path, json).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, perms).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_hub_sdk::DeviceDescriptor;

    fn sample() -> HashMap<String, ProxyDevice> {
        let mut device: ProxyDevice = DeviceDescriptor {
            proxy_name: "shell".into(),
            internal_id: "1001".into(),
            proxy_device_name: "Shell".into(),
            proxy_device_type_name: "shell".into(),
            akc_dtid: "dt1".into(),
            proxy_device_data: None,
            is_virtual: false,
        }
        .into();
        device.akc_device_id = Some("D1".into());
        device.akc_device_token = Some("tok".into());
        let mut map = HashMap::new();
        map.insert("shell.1001".to_string(), device);
        map
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LinkedStore::new(dir.path());
        store.save(&sample()).await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["shell.1001"].akc_device_id.as_deref(), Some("D1"));
        assert_eq!(loaded["shell.1001"].akc_device_token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LinkedStore::new(dir.path().join("nope"));
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LinkedStore::new(dir.path());
        tokio::fs::write(dir.path().join(LINKED_FILE), b"{not json")
            .await
            .unwrap();
        assert!(store.load().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = LinkedStore::new(dir.path());
        store.save(&sample()).await.unwrap();

        let mode = std::fs::metadata(dir.path().join(LINKED_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
