use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Composite device identity: `{proxy_name}.{internal_id}`.
///
/// The dotted string form is the only external key (wire, persistence, API),
/// but internally the two halves are kept apart so that per-plugin operations
/// (remove, sibling lookup) never re-split strings ad hoc.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyDeviceKey {
    pub proxy_name: String,
    pub internal_id: String,
}

impl ProxyDeviceKey {
    pub fn new(proxy_name: impl Into<String>, internal_id: impl Into<String>) -> Self {
        Self {
            proxy_name: proxy_name.into(),
            internal_id: internal_id.into(),
        }
    }
}

impl Display for ProxyDeviceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.proxy_name, self.internal_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDeviceKeyError(pub String);

impl Display for ProxyDeviceKeyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "invalid proxy device id: {}", self.0)
    }
}

impl std::error::Error for ProxyDeviceKeyError {}

impl FromStr for ProxyDeviceKey {
    type Err = ProxyDeviceKeyError;

    /// Splits on the first dot; the internal id may itself contain dots.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((proxy, internal)) if !proxy.is_empty() && !internal.is_empty() => {
                Ok(Self::new(proxy, internal))
            }
            _ => Err(ProxyDeviceKeyError(s.to_string())),
        }
    }
}

impl Serialize for ProxyDeviceKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProxyDeviceKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Uniform representation of a plugin-owned device.
///
/// Serialized shape (camelCase) is shared by the persisted linked-device file
/// and the device API responses, so renames here are load-bearing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyDevice {
    pub proxy_device_id: ProxyDeviceKey,
    pub proxy_device_name: String,
    pub proxy_device_type_name: String,
    /// Cloud device-type id declared by the owning plugin.
    pub akc_dtid: String,
    /// Opaque plugin payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_device_data: Option<serde_json::Value>,
    /// Cloud binding, present only while linked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub akc_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub akc_device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub akc_device_token: Option<String>,
    /// Seen in the current discovery pass.
    #[serde(default)]
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "lastMessageTS")]
    pub last_message_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "lastActionTS")]
    pub last_action_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_parameters_per_device: Option<serde_json::Value>,
    /// Created on demand rather than discovered; never returned to the
    /// not-linked pool on unlink.
    #[serde(default)]
    pub is_virtual: bool,
}

impl ProxyDevice {
    /// Linked with both cloud fields, i.e. eligible for registration and
    /// immediate transmission.
    pub fn is_fully_credentialed(&self) -> bool {
        self.akc_device_id.is_some() && self.akc_device_token.is_some()
    }

    /// Drops the cloud binding (unlink, or rollback of a failed link).
    pub fn clear_cloud_binding(&mut self) {
        self.akc_device_id = None;
        self.akc_device_name = None;
        self.akc_device_token = None;
    }

    /// Identity-only view returned by unlink: no token, no timestamps.
    pub fn redacted(&self) -> ProxyDevice {
        ProxyDevice {
            proxy_device_id: self.proxy_device_id.clone(),
            proxy_device_name: self.proxy_device_name.clone(),
            proxy_device_type_name: self.proxy_device_type_name.clone(),
            akc_dtid: self.akc_dtid.clone(),
            proxy_device_data: None,
            akc_device_id: None,
            akc_device_name: None,
            akc_device_token: None,
            found: self.found,
            last_message_ts: None,
            last_action_ts: None,
            user_parameters_per_device: self.user_parameters_per_device.clone(),
            is_virtual: self.is_virtual,
        }
    }
}

/// What a plugin reports when it discovers (or fabricates) a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub proxy_name: String,
    pub internal_id: String,
    pub proxy_device_name: String,
    pub proxy_device_type_name: String,
    pub akc_dtid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_device_data: Option<serde_json::Value>,
    #[serde(default)]
    pub is_virtual: bool,
}

impl DeviceDescriptor {
    pub fn key(&self) -> ProxyDeviceKey {
        ProxyDeviceKey::new(self.proxy_name.clone(), self.internal_id.clone())
    }
}

impl From<DeviceDescriptor> for ProxyDevice {
    fn from(d: DeviceDescriptor) -> Self {
        let key = d.key();
        ProxyDevice {
            proxy_device_id: key,
            proxy_device_name: d.proxy_device_name,
            proxy_device_type_name: d.proxy_device_type_name,
            akc_dtid: d.akc_dtid,
            proxy_device_data: d.proxy_device_data,
            akc_device_id: None,
            akc_device_name: None,
            akc_device_token: None,
            found: false,
            last_message_ts: None,
            last_action_ts: None,
            user_parameters_per_device: None,
            is_virtual: d.is_virtual,
        }
    }
}
