//! The hub core: device directory and link state machine, deferred telemetry
//! queues, the cloud broker connection actor with its ack/retry machinery,
//! and the inbound action router, all wired together by [`ProxyHub`].

pub mod cloud_api;
pub mod connection;
pub mod deferred;
pub mod directory;
pub mod hub;
pub mod persistence;
pub mod router;
pub mod transport;

// Re-export commonly used types
pub use cloud_api::{CloudDeviceApi, RestCloudApi};
pub use connection::{CloudConnectionHandle, ConnectionEvent};
pub use hub::ProxyHub;
pub use transport::{BrokerSocket, BrokerTransport, WsTransport};
