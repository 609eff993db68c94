use proxy_hub_sdk::{ActionEntry, ProxyDevice, ProxyPlugin};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Routes inbound cloud actions (and new-device requests) to the plugin that
/// owns the target device, by the proxy-name half of the device key.
#[derive(Default)]
pub struct ActionRouter {
    plugins: RwLock<HashMap<String, Arc<dyn ProxyPlugin>>>,
}

impl ActionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_plugin(&self, plugin: Arc<dyn ProxyPlugin>) {
        let name = plugin.name().to_string();
        info!(plugin = %name, "plugin registered");
        self.plugins.write().unwrap().insert(name, plugin);
    }

    pub fn remove_plugin(&self, proxy_name: &str) {
        self.plugins.write().unwrap().remove(proxy_name);
    }

    fn plugin(&self, proxy_name: &str) -> Option<Arc<dyn ProxyPlugin>> {
        self.plugins.read().unwrap().get(proxy_name).cloned()
    }

    /// Deliver each action to the owning plugin. Actions for proxies with no
    /// registered plugin are dropped.
    pub async fn dispatch(&self, device: ProxyDevice, actions: Vec<ActionEntry>) {
        let proxy_name = device.proxy_device_id.proxy_name.clone();
        let Some(plugin) = self.plugin(&proxy_name) else {
            warn!(proxy = %proxy_name, "dropping actions for unregistered plugin");
            return;
        };
        for action in actions {
            debug!(device = %device.proxy_device_id, action = %action.name, "dispatching action");
            plugin
                .dispatch_action(device.clone(), &action.name, action.parameters)
                .await;
        }
    }

    /// Tell a plugin its last offered device was taken, so it can fabricate
    /// another if it supports that.
    pub async fn request_new_device(&self, proxy_name: &str) {
        if let Some(plugin) = self.plugin(proxy_name) {
            plugin.request_new_device().await;
        }
    }
}
