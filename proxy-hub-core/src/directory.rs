use proxy_hub_error::{HubError, HubResult};
use proxy_hub_sdk::{ProxyDevice, ProxyDeviceKey};
use std::collections::HashMap;
use tracing::{debug, info};

/// Outcome of a discovery report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverOutcome {
    /// Inserted (or refreshed) in the not-linked pool.
    New,
    /// Already linked; only the `found` flag was refreshed.
    AlreadyLinked,
}

/// The device directory: every known proxy device, split into linked and
/// not-linked, plus the reverse index from cloud device id to proxy key.
///
/// Invariant: a key lives in exactly one of the two maps, and only linked
/// records carry cloud credentials. The reverse index is maintained in
/// lock-step with the linked map.
#[derive(Debug, Default)]
pub struct DeviceDirectory {
    linked: HashMap<ProxyDeviceKey, ProxyDevice>,
    not_linked: HashMap<ProxyDeviceKey, ProxyDevice>,
    reverse: HashMap<String, ProxyDeviceKey>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovery report. Linked devices only get their `found` flag
    /// refreshed; everything else lands in (or replaces its entry in) the
    /// not-linked pool.
    pub fn discover(&mut self, mut device: ProxyDevice) -> DiscoverOutcome {
        let key = device.proxy_device_id.clone();
        if let Some(existing) = self.linked.get_mut(&key) {
            existing.found = true;
            debug!(device = %key, "device already linked, refreshed found flag");
            return DiscoverOutcome::AlreadyLinked;
        }
        device.found = true;
        info!(device = %key, "new device in not-linked pool");
        self.not_linked.insert(key, device);
        DiscoverOutcome::New
    }

    /// First phase of linking: validate and move the record from not-linked
    /// to linked with the candidate cloud fields set. The cloud calls happen
    /// outside the directory; on failure `fail_link` undoes this move.
    ///
    /// The device must be in the not-linked pool; that check comes first, so
    /// an unknown device reports `UnknownDevice` even when the request is
    /// also missing its cloud fields. `akc_device_id` (bind existing) takes
    /// precedence when both are given; supplying neither is a `BadRequest`.
    pub fn begin_link(
        &mut self,
        key: &ProxyDeviceKey,
        akc_device_id: Option<String>,
        akc_device_name: Option<String>,
    ) -> HubResult<()> {
        if !self.not_linked.contains_key(key) {
            return Err(HubError::UnknownDevice(key.to_string()));
        }
        if akc_device_id.is_none() && akc_device_name.is_none() {
            return Err(HubError::BadRequest(
                "missing either akcDeviceId (link to an existing cloud device) \
                 or akcDeviceName (create a new cloud device)"
                    .to_string(),
            ));
        }
        let Some(mut device) = self.not_linked.remove(key) else {
            return Err(HubError::UnknownDevice(key.to_string()));
        };
        if akc_device_id.is_some() {
            device.akc_device_id = akc_device_id;
        } else {
            device.akc_device_name = akc_device_name;
        }
        self.linked.insert(key.clone(), device);
        Ok(())
    }

    /// Roll back a link whose cloud calls failed: drop the in-progress cloud
    /// fields and return the record to the not-linked pool.
    pub fn fail_link(&mut self, key: &ProxyDeviceKey) {
        if let Some(mut device) = self.linked.remove(key) {
            device.clear_cloud_binding();
            self.not_linked.insert(key.clone(), device);
        }
    }

    pub fn linked(&self, key: &ProxyDeviceKey) -> Option<&ProxyDevice> {
        self.linked.get(key)
    }

    pub fn linked_mut(&mut self, key: &ProxyDeviceKey) -> Option<&mut ProxyDevice> {
        self.linked.get_mut(key)
    }

    pub fn not_linked_mut(&mut self, key: &ProxyDeviceKey) -> Option<&mut ProxyDevice> {
        self.not_linked.get_mut(key)
    }

    pub fn is_not_linked(&self, key: &ProxyDeviceKey) -> bool {
        self.not_linked.contains_key(key)
    }

    /// Unlink a linked device: strip the cloud binding, drop its reverse-index
    /// entries, and return it to the not-linked pool unless it is virtual.
    /// Returns the redacted snapshot handed back to the caller.
    pub fn unlink(&mut self, key: &ProxyDeviceKey) -> HubResult<ProxyDevice> {
        let mut device = self
            .linked
            .remove(key)
            .ok_or_else(|| HubError::UnknownDevice(key.to_string()))?;
        let snapshot = device.redacted();
        device.clear_cloud_binding();
        self.reverse.retain(|_, k| k != key);
        if device.is_virtual {
            debug!(device = %key, "virtual device unlinked and dropped");
        } else {
            self.not_linked.insert(key.clone(), device);
        }
        Ok(snapshot)
    }

    /// Replace the per-device user parameters of a linked record.
    pub fn update_user_parameters(
        &mut self,
        key: &ProxyDeviceKey,
        params: Option<serde_json::Value>,
    ) -> HubResult<ProxyDevice> {
        let device = self
            .linked
            .get_mut(key)
            .ok_or_else(|| HubError::UnknownDevice(key.to_string()))?;
        device.user_parameters_per_device = params;
        Ok(device.clone())
    }

    /// Delete every record (linked or not) owned by `proxy_name`, and every
    /// reverse entry pointing at one of them.
    pub fn remove_proxy(&mut self, proxy_name: &str) {
        self.linked.retain(|k, _| k.proxy_name != proxy_name);
        self.not_linked.retain(|k, _| k.proxy_name != proxy_name);
        self.reverse.retain(|_, k| k.proxy_name != proxy_name);
        debug!(proxy = proxy_name, "removed proxy devices from directory");
    }

    pub fn add_reverse(&mut self, akc_device_id: String, key: ProxyDeviceKey) {
        self.reverse.insert(akc_device_id, key);
    }

    pub fn resolve_cloud_id(&self, akc_device_id: &str) -> Option<&ProxyDeviceKey> {
        self.reverse.get(akc_device_id)
    }

    /// Every linked key currently bound to this cloud device id.
    pub fn linked_to_cloud_id(&self, akc_device_id: &str) -> Vec<ProxyDeviceKey> {
        self.linked
            .iter()
            .filter(|(_, d)| d.akc_device_id.as_deref() == Some(akc_device_id))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// True when the plugin still has at least one not-linked device on offer.
    pub fn has_not_linked_sibling(&self, proxy_name: &str) -> bool {
        self.not_linked.keys().any(|k| k.proxy_name == proxy_name)
    }

    pub fn linked_keys(&self) -> Vec<ProxyDeviceKey> {
        self.linked.keys().cloned().collect()
    }

    pub fn linked_snapshot(&self) -> HashMap<String, ProxyDevice> {
        self.linked
            .iter()
            .map(|(k, d)| (k.to_string(), d.clone()))
            .collect()
    }

    pub fn not_linked_snapshot(&self) -> HashMap<String, ProxyDevice> {
        self.not_linked
            .iter()
            .map(|(k, d)| (k.to_string(), d.clone()))
            .collect()
    }

    /// Merge persisted records at startup. Entries already present (live
    /// discovery won a race) are left alone; merged entries keep their cloud
    /// credentials but start with `found = false` until rediscovered.
    pub fn merge_persisted(&mut self, persisted: HashMap<String, ProxyDevice>) {
        for (id, mut device) in persisted {
            let key = match id.parse::<ProxyDeviceKey>() {
                Ok(k) => k,
                Err(e) => {
                    debug!(error = %e, "skipping malformed persisted device id");
                    continue;
                }
            };
            if self.linked.contains_key(&key) || self.not_linked.contains_key(&key) {
                continue;
            }
            device.found = false;
            self.linked.insert(key, device);
        }
    }
}
