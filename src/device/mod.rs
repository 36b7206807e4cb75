//! The device seam: what the worker needs from a remote-controlled device.
//!
//! The RPC framework that actually talks to the device server is an
//! external collaborator; it plugs in by implementing [`Connector`] and
//! [`DeviceProxy`]. [`sim`] provides an in-memory implementation.

pub mod sim;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single dynamically-typed device value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(n) => Some(*n as f64),
            Scalar::Float(f) => Some(*f),
            Scalar::Text(s) => s.trim().parse().ok(),
            Scalar::Bool(_) => None,
        }
    }

    fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Scalar::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Scalar::Int)
                .or_else(|| n.as_f64().map(Scalar::Float)),
            serde_json::Value::String(s) => Some(Scalar::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(n) => write!(f, "{n}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// Value of a polled attribute: a scalar or an array of scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Scalar(Scalar),
    Array(Vec<Scalar>),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Scalar(s) => write!(f, "{s}"),
            AttrValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Arguments passed along with a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandArgs {
    #[default]
    None,
    Scalar(Scalar),
    List(Vec<Scalar>),
}

impl CommandArgs {
    /// Parse a textual payload (e.g. an MQTT message body).
    ///
    /// Empty → `None`, JSON array of scalars → `List`, JSON scalar → `Scalar`,
    /// anything else is passed through verbatim as text.
    pub fn from_payload(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return CommandArgs::None;
        }

        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(serde_json::Value::Null) => CommandArgs::None,
            Ok(serde_json::Value::Array(items)) => {
                let scalars: Option<Vec<Scalar>> = items.iter().map(Scalar::from_json).collect();
                match scalars {
                    Some(list) => CommandArgs::List(list),
                    None => CommandArgs::Scalar(Scalar::Text(trimmed.to_string())),
                }
            }
            Ok(value) => Scalar::from_json(&value)
                .map(CommandArgs::Scalar)
                .unwrap_or_else(|| CommandArgs::Scalar(Scalar::Text(trimmed.to_string()))),
            Err(_) => CommandArgs::Scalar(Scalar::Text(trimmed.to_string())),
        }
    }

    /// First argument as a number, if there is one.
    pub fn first_f64(&self) -> Option<f64> {
        match self {
            CommandArgs::None => None,
            CommandArgs::Scalar(s) => s.as_f64(),
            CommandArgs::List(items) => items.first().and_then(Scalar::as_f64),
        }
    }
}

/// Run state reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    On,
    Off,
    Standby,
    Moving,
    Running,
    Fault,
    Alarm,
    Init,
    Disable,
    Unknown,
}

impl DeviceState {
    /// States in which the device is considered alive and serving commands.
    pub fn is_running(self) -> bool {
        matches!(self, DeviceState::On | DeviceState::Moving | DeviceState::Running)
    }

    /// States in which a command that needs an idle, initialised device may run.
    pub fn is_ready(self) -> bool {
        matches!(self, DeviceState::On | DeviceState::Standby)
    }
}

impl FromStr for DeviceState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "ON" => DeviceState::On,
            "OFF" => DeviceState::Off,
            "STANDBY" => DeviceState::Standby,
            "MOVING" => DeviceState::Moving,
            "RUNNING" => DeviceState::Running,
            "FAULT" => DeviceState::Fault,
            "ALARM" => DeviceState::Alarm,
            "INIT" => DeviceState::Init,
            "DISABLE" => DeviceState::Disable,
            _ => DeviceState::Unknown,
        })
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::On => "ON",
            DeviceState::Off => "OFF",
            DeviceState::Standby => "STANDBY",
            DeviceState::Moving => "MOVING",
            DeviceState::Running => "RUNNING",
            DeviceState::Fault => "FAULT",
            DeviceState::Alarm => "ALARM",
            DeviceState::Init => "INIT",
            DeviceState::Disable => "DISABLE",
            DeviceState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Per-attribute result of a batched read. A batched read can succeed as a
/// whole while individual attributes fail.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeReading {
    pub name: String,
    pub result: Result<AttrValue, String>,
}

impl AttributeReading {
    pub fn ok(name: impl Into<String>, value: AttrValue) -> Self {
        Self {
            name: name.into(),
            result: Ok(value),
        }
    }

    pub fn err(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: Err(reason.into()),
        }
    }
}

/// Errors raised by a device proxy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Device not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    /// The device processed the request and refused it.
    #[error("{0}")]
    Rejected(String),
}

impl DeviceError {
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        DeviceError::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Errors after which the session must be considered dead.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            DeviceError::Timeout { .. } | DeviceError::NotConnected | DeviceError::Transport(_)
        )
    }
}

/// Client bound to one named remote device.
#[async_trait]
pub trait DeviceProxy: Send {
    /// Client-side timeout applied to every subsequent call.
    fn set_timeout(&mut self, timeout: Duration);

    async fn query_state(&mut self) -> Result<DeviceState, DeviceError>;

    /// Device-level status string (the low-frequency auxiliary read).
    async fn query_status(&mut self) -> Result<String, DeviceError>;

    async fn read_attributes(
        &mut self,
        names: &[String],
    ) -> Result<Vec<AttributeReading>, DeviceError>;

    /// Invoke a command; a command may return a value.
    async fn invoke_command(
        &mut self,
        name: &str,
        args: &CommandArgs,
    ) -> Result<Option<AttrValue>, DeviceError>;
}

/// Opens proxies for an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn DeviceProxy>, DeviceError>;
}
