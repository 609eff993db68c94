use proxy_hub_sdk::ProxyDeviceKey;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// One telemetry payload captured while its device had no cloud binding.
/// The timestamp is taken at capture time so a later flush reports when the
/// message actually happened.
#[derive(Debug, Clone)]
pub struct DeferredMessage {
    pub ts: i64,
    pub data: serde_json::Value,
}

/// Per-device FIFO queues for telemetry produced before the device is linked.
/// Each queue is bounded; the oldest entry is dropped on overflow.
#[derive(Debug)]
pub struct DeferredQueues {
    queues: HashMap<ProxyDeviceKey, VecDeque<DeferredMessage>>,
    max_per_device: usize,
}

impl DeferredQueues {
    pub fn new(max_per_device: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_per_device,
        }
    }

    pub fn enqueue(&mut self, key: &ProxyDeviceKey, message: DeferredMessage) {
        let queue = self.queues.entry(key.clone()).or_default();
        queue.push_back(message);
        while queue.len() > self.max_per_device {
            queue.pop_front();
            debug!(device = %key, "deferred queue full, dropped oldest message");
        }
    }

    /// Drain the whole queue for `key`, oldest first.
    pub fn take(&mut self, key: &ProxyDeviceKey) -> Vec<DeferredMessage> {
        self.queues
            .remove(key)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    /// Put back messages a flush could not deliver, preserving their order
    /// ahead of anything queued since.
    pub fn restore(&mut self, key: &ProxyDeviceKey, messages: Vec<DeferredMessage>) {
        if messages.is_empty() {
            return;
        }
        let queue = self.queues.entry(key.clone()).or_default();
        for (i, message) in messages.into_iter().enumerate() {
            queue.insert(i, message);
        }
    }

    pub fn len(&self, key: &ProxyDeviceKey) -> usize {
        self.queues.get(key).map(VecDeque::len).unwrap_or(0)
    }
}
