use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Epoch milliseconds, the timestamp unit of every wire frame.
#[inline]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Broker registration frame: announces a cloud device id on the socket so
/// subsequent telemetry and inbound actions can use it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterFrame {
    pub sdid: String,
    #[serde(rename = "Authorization")]
    pub authorization: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}

impl RegisterFrame {
    pub fn new(sdid: impl Into<String>, token: &str) -> Self {
        Self {
            sdid: sdid.into(),
            authorization: format!("bearer {token}"),
            kind: "register".to_string(),
            cid: None,
        }
    }
}

/// Broker telemetry frame carrying one device message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub sdid: String,
    pub token: String,
    pub ts: i64,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}

/// Any frame the connection can put on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Register(RegisterFrame),
    Telemetry(TelemetryFrame),
}

impl OutboundFrame {
    pub fn cid(&self) -> Option<&str> {
        match self {
            OutboundFrame::Register(f) => f.cid.as_deref(),
            OutboundFrame::Telemetry(f) => f.cid.as_deref(),
        }
    }

    pub fn set_cid(&mut self, cid: String) {
        match self {
            OutboundFrame::Register(f) => f.cid = Some(cid),
            OutboundFrame::Telemetry(f) => f.cid = Some(cid),
        }
    }

    pub fn sdid(&self) -> &str {
        match self {
            OutboundFrame::Register(f) => &f.sdid,
            OutboundFrame::Telemetry(f) => &f.sdid,
        }
    }

    /// Register frames are regenerated on demand and never retried from the
    /// failed queue.
    pub fn is_register(&self) -> bool {
        matches!(self, OutboundFrame::Register(_))
    }
}

/// Acknowledgement payload found under `data` in broker replies.
#[derive(Debug, Clone, Deserialize)]
pub struct AckData {
    pub cid: Option<String>,
    pub mid: Option<Value>,
    pub code: Option<String>,
}

/// Error payload found under `error` in broker replies.
#[derive(Debug, Clone, Deserialize)]
pub struct WireError {
    pub code: i64,
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// One action inside an inbound `{ddid, data: {actions: [...]}}` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEntry {
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Raw inbound broker envelope. Fields are all optional; `classify` decides
/// what the frame actually is.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub ddid: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<WireError>,
    #[serde(default)]
    pub mid: Option<Value>,
}

/// Classified inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Keepalive, always ignored.
    Ping,
    /// Ack for a sent cid. `success` means `mid` present or `code == "200"`;
    /// anything else with a cid is a malformed ack and retried.
    Ack { cid: String, success: bool },
    Error(WireError),
    Action {
        ddid: String,
        actions: Vec<ActionEntry>,
    },
    /// Nothing we understand; logged and dropped.
    Other,
}

impl InboundEnvelope {
    /// Classification order matters and mirrors the broker contract: ping
    /// first, then acks (anything with `data.cid`), then errors, then action
    /// payloads.
    pub fn classify(&self) -> Inbound {
        if self.kind.as_deref() == Some("ping") {
            return Inbound::Ping;
        }

        if let Some(data) = &self.data {
            if let Ok(ack) = serde_json::from_value::<AckData>(data.clone()) {
                if let Some(cid) = ack.cid {
                    let success = ack.mid.is_some() || ack.code.as_deref() == Some("200");
                    return Inbound::Ack { cid, success };
                }
            }
        }

        if let Some(error) = &self.error {
            return Inbound::Error(error.clone());
        }

        if let (Some(ddid), Some(data)) = (&self.ddid, &self.data) {
            if let Some(actions) = data.get("actions") {
                if let Ok(actions) = serde_json::from_value::<Vec<ActionEntry>>(actions.clone()) {
                    return Inbound::Action {
                        ddid: ddid.clone(),
                        actions,
                    };
                }
            }
        }

        Inbound::Other
    }
}

/// Correlation-id source: `{connectionSeed}-{randomSegment}-{timestampHex}`.
///
/// The seed is drawn once per connection instance, which makes collisions
/// across reconnects practically impossible without a central counter.
#[derive(Debug, Clone)]
pub struct CidGenerator {
    seed: String,
}

impl CidGenerator {
    pub fn new() -> Self {
        Self {
            seed: random_segment(),
        }
    }

    pub fn next(&self) -> String {
        format!("{}-{}-{:x}", self.seed, random_segment(), now_millis())
    }
}

impl Default for CidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Five hex digits in `10000..=1ffff`.
fn random_segment() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..0x10000);
    format!("{:x}", 0x10000 + n)
}
