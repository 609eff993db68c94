#![allow(dead_code)]

use async_trait::async_trait;
use proxy_hub_common::config::HubConfig;
use proxy_hub_core::{BrokerSocket, BrokerTransport, CloudDeviceApi};
use proxy_hub_error::{HubError, HubResult};
use proxy_hub_sdk::{DeviceDescriptor, ProxyDevice, ProxyPlugin};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// In-memory broker double: records outbound frames, lets tests inject
/// inbound frames and kill the connection.
pub struct MockBroker {
    sent: Mutex<Vec<Value>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    connects: AtomicUsize,
    fail_sends: AtomicBool,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(None),
            connects: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
        })
    }

    pub fn sent_frames(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn push_inbound(&self, frame: Value) {
        if let Some(tx) = &*self.inbound.lock().unwrap() {
            let _ = tx.send(frame.to_string());
        }
    }

    /// Simulate the broker dropping the socket.
    pub fn drop_connection(&self) {
        *self.inbound.lock().unwrap() = None;
    }

    /// Cid of the first sent frame matching `pred`.
    pub fn find_cid(&self, pred: impl Fn(&Value) -> bool) -> Option<String> {
        self.sent_frames()
            .iter()
            .find(|f| pred(f))
            .and_then(|f| f["cid"].as_str().map(String::from))
    }

    pub fn count_matching(&self, pred: impl Fn(&Value) -> bool) -> usize {
        self.sent_frames().iter().filter(|f| pred(f)).count()
    }
}

pub struct MockTransport(pub Arc<MockBroker>);

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn connect(&self, _url: &str) -> HubResult<Box<dyn BrokerSocket>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.0.inbound.lock().unwrap() = Some(tx);
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSocket {
            broker: Arc::clone(&self.0),
            rx,
        }))
    }
}

struct MockSocket {
    broker: Arc<MockBroker>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl BrokerSocket for MockSocket {
    async fn send(&mut self, text: String) -> HubResult<()> {
        if self.broker.fail_sends.load(Ordering::SeqCst) {
            return Err(HubError::Transmission("mock send failure".into()));
        }
        let frame: Value = serde_json::from_str(&text).unwrap();
        self.broker.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn next(&mut self) -> Option<HubResult<String>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

/// Device API double: fixed ids/tokens, call counting, optional token
/// failure to exercise link rollback.
#[derive(Default)]
pub struct MockCloudApi {
    pub create_calls: AtomicUsize,
    pub fail_token: AtomicBool,
}

#[async_trait]
impl CloudDeviceApi for MockCloudApi {
    async fn create_device(
        &self,
        _user_token: &str,
        _uid: &str,
        _dtid: &str,
        _name: &str,
    ) -> HubResult<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Ok("D1".to_string())
    }

    async fn get_device_name(&self, _user_token: &str, _device_id: &str) -> HubResult<String> {
        Ok("Cloud Lamp".to_string())
    }

    async fn get_device_token(&self, _user_token: &str, _device_id: &str) -> HubResult<String> {
        if self.fail_token.load(Ordering::SeqCst) {
            return Err(HubError::CloudApi("mock token failure".into()));
        }
        Ok("tok".to_string())
    }
}

/// Plugin double recording dispatched actions and new-device requests.
#[derive(Default)]
pub struct RecordingPlugin {
    pub actions: Mutex<Vec<(String, Value)>>,
    pub new_device_requests: AtomicUsize,
}

#[async_trait]
impl ProxyPlugin for RecordingPlugin {
    fn name(&self) -> &str {
        "shell"
    }

    async fn dispatch_action(&self, _device: ProxyDevice, action: &str, parameters: Value) {
        self.actions
            .lock()
            .unwrap()
            .push((action.to_string(), parameters));
    }

    async fn request_new_device(&self) {
        self.new_device_requests.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn descriptor(internal_id: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        proxy_name: "shell".into(),
        internal_id: internal_id.into(),
        proxy_device_name: format!("Shell {internal_id}"),
        proxy_device_type_name: "shell".into(),
        akc_dtid: "dt1".into(),
        proxy_device_data: None,
        is_virtual: false,
    }
}

pub fn test_config(data_dir: &Path) -> HubConfig {
    let mut config = HubConfig::default();
    config.data_dir = data_dir.to_path_buf();
    // keep the stall window well clear of the virtual clock in most tests
    config.cloud.stalled_connection_period_ms = 60_000;
    config
}

/// Poll `f` under the paused clock until it holds.
pub async fn wait_until<F, Fut>(what: &str, f: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..20_000 {
        if f().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn is_register(frame: &Value) -> bool {
    frame["type"] == "register"
}

pub fn is_telemetry(frame: &Value) -> bool {
    frame.get("token").is_some() && frame.get("data").is_some()
}
