use crate::device::{DeviceDescriptor, ProxyDevice, ProxyDeviceKey};
use async_trait::async_trait;
use serde_json::Value;

/// Hub-side sink for plugin reports, handed to every plugin at load time.
///
/// This is the plugin → core half of the contract: a plugin announces devices
/// it has discovered (or fabricated on demand) and forwards their telemetry.
#[async_trait]
pub trait HubEvents: Send + Sync {
    /// A device was discovered (or re-discovered) by the plugin.
    async fn new_device(&self, descriptor: DeviceDescriptor);

    /// Telemetry produced by a device. The hub decides whether to transmit
    /// immediately or park it in the deferred queue; there is no synchronous
    /// outcome for the plugin to observe.
    async fn new_message(&self, device: ProxyDeviceKey, payload: Value);
}

/// Core → plugin half of the contract, implemented by each plugin.
#[async_trait]
pub trait ProxyPlugin: Send + Sync {
    /// Plugin name; the first half of every `ProxyDeviceKey` it owns.
    fn name(&self) -> &str;

    /// An action arrived from the cloud for one of this plugin's devices.
    /// `device` is a fully-populated snapshot of the owning record.
    async fn dispatch_action(&self, device: ProxyDevice, action: &str, parameters: Value);

    /// All of this plugin's devices are linked; an on-demand plugin may answer
    /// by reporting a fresh device through `HubEvents::new_device`.
    async fn request_new_device(&self);
}
