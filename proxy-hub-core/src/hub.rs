use crate::cloud_api::CloudDeviceApi;
use crate::connection::{CloudConnectionHandle, ConnectionEvent};
use crate::deferred::{DeferredMessage, DeferredQueues};
use crate::directory::DeviceDirectory;
use crate::persistence::LinkedStore;
use crate::router::ActionRouter;
use crate::transport::BrokerTransport;
use async_trait::async_trait;
use proxy_hub_common::config::HubConfig;
use proxy_hub_error::{HubError, HubResult};
use proxy_hub_sdk::{
    now_millis, DeviceDescriptor, HubEvents, OutboundFrame, ProxyDevice, ProxyDeviceKey,
    ProxyPlugin, TelemetryFrame,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Directory and deferred queues share one lock: link, register and flush
/// happen in a single critical section so telemetry ordering survives the
/// transition from deferred to live.
struct HubState {
    directory: DeviceDirectory,
    deferred: DeferredQueues,
}

/// The hub core: owns the device directory, the cloud connection and the
/// action router, and exposes the device-management API.
pub struct ProxyHub {
    state: Mutex<HubState>,
    connection: CloudConnectionHandle,
    router: ActionRouter,
    cloud_api: Arc<dyn CloudDeviceApi>,
    store: LinkedStore,
    cancel: CancellationToken,
}

impl ProxyHub {
    /// Bring the hub up: load persisted linked devices, spawn the connection
    /// actor and the event loop.
    pub async fn start(
        config: &HubConfig,
        transport: Arc<dyn BrokerTransport>,
        cloud_api: Arc<dyn CloudDeviceApi>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(64);
        let connection =
            CloudConnectionHandle::spawn(transport, &config.cloud, events_tx, cancel.child_token());

        let store = LinkedStore::new(&config.data_dir);
        let mut directory = DeviceDirectory::new();
        let persisted = store.load().await;
        if !persisted.is_empty() {
            info!(count = persisted.len(), "restoring persisted linked devices");
            directory.merge_persisted(persisted);
        }

        let hub = Arc::new(Self {
            state: Mutex::new(HubState {
                directory,
                deferred: DeferredQueues::new(config.cloud.max_deferred_messages_per_device),
            }),
            connection,
            router: ActionRouter::new(),
            cloud_api,
            store,
            cancel,
        });
        tokio::spawn(Arc::clone(&hub).event_loop(events_rx));
        hub
    }

    pub fn add_plugin(&self, plugin: Arc<dyn ProxyPlugin>) {
        self.router.add_plugin(plugin);
    }

    /// Link a not-linked device to the cloud. Either binds to an existing
    /// cloud device (`akc_device_id`) or creates one (`akc_device_name`);
    /// the id takes precedence when both are supplied.
    #[allow(clippy::too_many_arguments)]
    pub async fn link_device(
        &self,
        user_token: &str,
        uid: &str,
        key: &ProxyDeviceKey,
        akc_device_id: Option<String>,
        akc_device_name: Option<String>,
        user_parameters: Option<Value>,
    ) -> HubResult<ProxyDevice> {
        let dtid = {
            let mut state = self.state.lock().await;
            state
                .directory
                .begin_link(key, akc_device_id.clone(), akc_device_name.clone())?;
            match state.directory.linked(key) {
                Some(d) => d.akc_dtid.clone(),
                None => return Err(HubError::UnknownDevice(key.to_string())),
            }
        };

        // cloud calls happen outside the lock
        let credentials = self
            .resolve_cloud_binding(user_token, uid, &dtid, akc_device_id, akc_device_name)
            .await;

        let mut state = self.state.lock().await;
        let (device_id, device_name, token) = match credentials {
            Ok(c) => c,
            Err(e) => {
                warn!(device = %key, error = %e, "link failed, rolling back");
                state.directory.fail_link(key);
                return Err(e);
            }
        };

        let snapshot = match state.directory.linked_mut(key) {
            Some(device) => {
                device.akc_device_id = Some(device_id.clone());
                if device_name.is_some() {
                    device.akc_device_name = device_name;
                }
                device.akc_device_token = Some(token);
                if user_parameters.is_some() {
                    device.user_parameters_per_device = user_parameters;
                }
                device.clone()
            }
            None => return Err(HubError::UnknownDevice(key.to_string())),
        };

        info!(device = %key, cloud_device = %device_id, "device linked");
        self.register_device(&mut state, key);
        self.persist(state.directory.linked_snapshot());

        let has_sibling = state.directory.has_not_linked_sibling(&key.proxy_name);
        drop(state);
        if !has_sibling {
            self.router.request_new_device(&key.proxy_name).await;
        }
        Ok(snapshot)
    }

    /// Resolve the cloud binding for a link request: `(id, name, token)`.
    /// The id path tolerates a failed name lookup; the token is mandatory.
    async fn resolve_cloud_binding(
        &self,
        user_token: &str,
        uid: &str,
        dtid: &str,
        akc_device_id: Option<String>,
        akc_device_name: Option<String>,
    ) -> HubResult<(String, Option<String>, String)> {
        let (device_id, device_name) = match (akc_device_id, akc_device_name) {
            (Some(id), _) => {
                let name = match self.cloud_api.get_device_name(user_token, &id).await {
                    Ok(name) => Some(name),
                    Err(e) => {
                        debug!(cloud_device = %id, error = %e, "could not resolve device name");
                        None
                    }
                };
                (id, name)
            }
            (None, Some(name)) => {
                let id = self
                    .cloud_api
                    .create_device(user_token, uid, dtid, &name)
                    .await?;
                (id, Some(name))
            }
            (None, None) => {
                return Err(HubError::BadRequest(
                    "missing akcDeviceId or akcDeviceName".to_string(),
                ))
            }
        };
        let token = self
            .cloud_api
            .get_device_token(user_token, &device_id)
            .await?;
        Ok((device_id, device_name, token))
    }

    /// Unlink a device: drop its binding, unregister from the broker and
    /// persist. Returns the redacted snapshot.
    pub async fn unlink_device(&self, key: &ProxyDeviceKey) -> HubResult<ProxyDevice> {
        let mut state = self.state.lock().await;
        let cloud_id = state
            .directory
            .linked(key)
            .and_then(|d| d.akc_device_id.clone());
        let snapshot = state.directory.unlink(key)?;
        self.persist(state.directory.linked_snapshot());
        drop(state);

        info!(device = %key, "device unlinked");
        if let Some(cloud_id) = cloud_id {
            let _ = self.connection.unregister(cloud_id);
        }
        Ok(snapshot)
    }

    /// Replace the per-device user parameters of a linked device.
    pub async fn update_device(
        &self,
        key: &ProxyDeviceKey,
        user_parameters: Option<Value>,
    ) -> HubResult<ProxyDevice> {
        let mut state = self.state.lock().await;
        let device = state
            .directory
            .update_user_parameters(key, user_parameters)?;
        self.persist(state.directory.linked_snapshot());
        Ok(device)
    }

    /// A linked device by key.
    pub async fn get_device(&self, key: &ProxyDeviceKey) -> HubResult<ProxyDevice> {
        let state = self.state.lock().await;
        state
            .directory
            .linked(key)
            .cloned()
            .ok_or_else(|| HubError::UnknownDevice(key.to_string()))
    }

    pub async fn linked_devices(&self) -> HashMap<String, ProxyDevice> {
        self.state.lock().await.directory.linked_snapshot()
    }

    pub async fn not_linked_devices(&self) -> HashMap<String, ProxyDevice> {
        self.state.lock().await.directory.not_linked_snapshot()
    }

    /// Drop a plugin and every device it owns from both pools.
    pub async fn remove_proxy(&self, proxy_name: &str) {
        let mut state = self.state.lock().await;
        state.directory.remove_proxy(proxy_name);
        drop(state);
        self.router.remove_plugin(proxy_name);
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let _ = self.connection.close();
    }

    /// Register a credentialed device on the broker and flush its deferred
    /// queue. Called with the state lock held so nothing interleaves between
    /// registration and the flush.
    fn register_device(&self, state: &mut HubState, key: &ProxyDeviceKey) {
        let Some(device) = state.directory.linked(key) else {
            return;
        };
        let (Some(cloud_id), Some(token)) = (
            device.akc_device_id.clone(),
            device.akc_device_token.clone(),
        ) else {
            return;
        };
        state.directory.add_reverse(cloud_id.clone(), key.clone());
        let _ = self.connection.register(cloud_id, token);
        self.flush_deferred(state, key);
    }

    /// Hand the device's deferred telemetry to the connection, oldest first.
    /// Undeliverable messages go back to the front of the queue.
    fn flush_deferred(&self, state: &mut HubState, key: &ProxyDeviceKey) {
        let (cloud_id, token) = match state.directory.linked(key) {
            Some(d) if d.is_fully_credentialed() => (
                d.akc_device_id.clone().unwrap_or_default(),
                d.akc_device_token.clone().unwrap_or_default(),
            ),
            _ => return,
        };
        let messages = state.deferred.take(key);
        if messages.is_empty() {
            return;
        }
        debug!(device = %key, count = messages.len(), "flushing deferred messages");

        let mut last_ts = None;
        let mut remaining = messages.into_iter();
        while let Some(message) = remaining.next() {
            let frame = OutboundFrame::Telemetry(TelemetryFrame {
                sdid: cloud_id.clone(),
                token: token.clone(),
                ts: message.ts,
                data: message.data.clone(),
                cid: None,
            });
            if self.connection.send(frame).is_err() {
                let mut rest = vec![message];
                rest.extend(remaining);
                state.deferred.restore(key, rest);
                return;
            }
            last_ts = Some(message.ts);
        }
        if let Some(device) = state.directory.linked_mut(key) {
            if device.last_message_ts.is_none() {
                device.last_message_ts = last_ts;
            }
        }
    }

    fn persist(&self, snapshot: HashMap<String, ProxyDevice>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save(&snapshot).await {
                warn!(error = %e, "failed to persist linked devices");
            }
        });
    }

    async fn event_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<ConnectionEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => self.on_connection_event(event).await,
                    None => break,
                },
            }
        }
        debug!("hub event loop stopped");
    }

    async fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => {
                let mut state = self.state.lock().await;
                for key in state.directory.linked_keys() {
                    self.register_device(&mut state, &key);
                }
            }
            ConnectionEvent::Closed => debug!("cloud connection lost"),
            ConnectionEvent::UnlinkCloudDevice(cloud_id) => {
                let mut state = self.state.lock().await;
                let keys = state.directory.linked_to_cloud_id(&cloud_id);
                if keys.is_empty() {
                    return;
                }
                warn!(cloud_device = %cloud_id, count = keys.len(),
                    "unlinking devices with rejected credentials");
                for key in keys {
                    if let Err(e) = state.directory.unlink(&key) {
                        debug!(device = %key, error = %e, "device vanished during unlink");
                    }
                }
                self.persist(state.directory.linked_snapshot());
            }
            ConnectionEvent::Action { ddid, actions } => {
                let snapshot = {
                    let mut state = self.state.lock().await;
                    let Some(key) = state.directory.resolve_cloud_id(&ddid).cloned() else {
                        debug!(cloud_device = %ddid, "dropping actions for unknown cloud device");
                        return;
                    };
                    match state.directory.linked_mut(&key) {
                        Some(device) => {
                            device.last_action_ts = Some(now_millis());
                            device.clone()
                        }
                        None => return,
                    }
                };
                // plugin callbacks run outside the state lock
                self.router.dispatch(snapshot, actions).await;
            }
        }
    }
}

#[async_trait]
impl HubEvents for ProxyHub {
    async fn new_device(&self, descriptor: DeviceDescriptor) {
        let key = descriptor.key();
        let mut state = self.state.lock().await;
        state.directory.discover(descriptor.into());
        debug!(device = %key, "device reported");
    }

    async fn new_message(&self, device: ProxyDeviceKey, payload: Value) {
        let mut state = self.state.lock().await;
        let ts = now_millis();

        if let Some(record) = state.directory.linked_mut(&device) {
            if record.is_fully_credentialed() {
                record.last_message_ts = Some(ts);
                let frame = OutboundFrame::Telemetry(TelemetryFrame {
                    sdid: record.akc_device_id.clone().unwrap_or_default(),
                    token: record.akc_device_token.clone().unwrap_or_default(),
                    ts,
                    data: payload,
                    cid: None,
                });
                if let Err(e) = self.connection.send(frame) {
                    warn!(device = %device, error = %e, "telemetry send failed");
                }
            } else {
                // linked but mid-credential, defer alongside not-linked traffic
                state
                    .deferred
                    .enqueue(&device, DeferredMessage { ts, data: payload });
            }
            return;
        }

        if let Some(record) = state.directory.not_linked_mut(&device) {
            record.last_message_ts = Some(ts);
            state
                .deferred
                .enqueue(&device, DeferredMessage { ts, data: payload });
        } else {
            debug!(device = %device, "dropping message from unknown device");
        }
    }
}
