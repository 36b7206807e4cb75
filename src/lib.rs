//! Resilient background workers for network-attached device controllers.
//!
//! One [`Worker`] per device: it owns the device session, polls a fixed set
//! of attributes into a snapshot cache, serializes commands from callers
//! through a bounded queue, and gates non-critical commands on a derived
//! health signal. The transport to the device is supplied through the
//! [`device::Connector`] / [`device::DeviceProxy`] traits.

pub mod device;
pub mod error;
pub mod worker;

pub use device::{AttrValue, CommandArgs, Connector, DeviceError, DeviceProxy, DeviceState, Scalar};
pub use error::{ConfigError, WorkerError};
pub use worker::{
    CommandOutcome, ConnectionState, Shutdown, StatusSnapshot, Worker, WorkerConfig, WorkerEvent,
};
