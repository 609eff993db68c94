//! Shared contract between the hub core and its proxy plugins: device
//! identity and records, broker wire frames, and the two trait halves of the
//! plugin seam ([`HubEvents`] / [`ProxyPlugin`]).

mod device;
mod events;
mod wire;

pub use device::{DeviceDescriptor, ProxyDevice, ProxyDeviceKey, ProxyDeviceKeyError};
pub use events::{HubEvents, ProxyPlugin};
pub use wire::{
    now_millis, ActionEntry, AckData, CidGenerator, Inbound, InboundEnvelope, OutboundFrame,
    RegisterFrame, TelemetryFrame, WireError,
};
