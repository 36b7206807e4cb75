//! In-memory motion axis used for `sim://` endpoints and in tests.
//!
//! Supports fault injection so the worker's reconnect, health and timeout
//! paths can be driven without hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{
    AttrValue, AttributeReading, CommandArgs, Connector, DeviceError, DeviceProxy, DeviceState,
    Scalar,
};

const DEFAULT_LIMITS: (f64, f64) = (-100.0, 100.0);
/// Invocations kept for inspection; older entries are dropped.
const INVOCATION_LOG_LEN: usize = 256;

#[derive(Debug)]
struct SimState {
    online: bool,
    attributes_failing: bool,
    read_delay: Option<Duration>,
    command_delays: HashMap<String, Duration>,
    rejections: HashMap<String, String>,
    state: DeviceState,
    initialised: bool,
    position: f64,
    velocity: f64,
    limits: (f64, f64),
    invocations: VecDeque<String>,
    attribute_reads: u32,
    status_reads: u32,
    connect_attempts: u32,
    connects: u32,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            online: true,
            attributes_failing: false,
            read_delay: None,
            command_delays: HashMap::new(),
            rejections: HashMap::new(),
            state: DeviceState::Off,
            initialised: false,
            position: 0.0,
            velocity: 1.0,
            limits: DEFAULT_LIMITS,
            invocations: VecDeque::new(),
            attribute_reads: 0,
            status_reads: 0,
            connect_attempts: 0,
            connects: 0,
        }
    }
}

/// Handle to a simulated axis. Clones share the same device.
#[derive(Debug, Clone, Default)]
pub struct SimDevice {
    inner: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the device off the network. Open proxies start failing too.
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// Make every attribute in a batched read fail while the call itself succeeds.
    pub fn set_attributes_failing(&self, failing: bool) {
        self.lock().attributes_failing = failing;
    }

    /// Delay every batched attribute read.
    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = Some(delay);
    }

    pub fn set_command_delay(&self, command: &str, delay: Duration) {
        self.lock().command_delays.insert(command.to_string(), delay);
    }

    pub fn reject_command(&self, command: &str, reason: &str) {
        self.lock()
            .rejections
            .insert(command.to_string(), reason.to_string());
    }

    pub fn set_state(&self, state: DeviceState) {
        self.lock().state = state;
    }

    /// Names of the most recent commands that reached the device, in order,
    /// including ones that later timed out or were rejected.
    pub fn invocations(&self) -> Vec<String> {
        self.lock().invocations.iter().cloned().collect()
    }

    /// Batched attribute reads started.
    pub fn attribute_reads(&self) -> u32 {
        self.lock().attribute_reads
    }

    /// Status string reads answered.
    pub fn status_reads(&self) -> u32 {
        self.lock().status_reads
    }

    /// Connection attempts, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Successful connections.
    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }

    pub fn position(&self) -> f64 {
        self.lock().position
    }

    pub fn state(&self) -> DeviceState {
        self.lock().state
    }

    fn check_online(&self) -> Result<(), DeviceError> {
        if self.lock().online {
            Ok(())
        } else {
            Err(DeviceError::Transport("connection refused".to_string()))
        }
    }

    fn read_one(state: &SimState, name: &str) -> Result<AttrValue, String> {
        if state.attributes_failing {
            return Err(format!("{name}: read failed"));
        }
        let value = match name {
            "position" => AttrValue::Scalar(Scalar::Float(state.position)),
            "velocity" => AttrValue::Scalar(Scalar::Float(state.velocity)),
            "limits" => AttrValue::Array(vec![
                Scalar::Float(state.limits.0),
                Scalar::Float(state.limits.1),
            ]),
            "state" => AttrValue::Scalar(Scalar::Text(state.state.to_string())),
            "initialised" => AttrValue::Scalar(Scalar::Bool(state.initialised)),
            _ => return Err(format!("{name}: unknown attribute")),
        };
        Ok(value)
    }

    fn apply(&self, name: &str, args: &CommandArgs) -> Result<Option<AttrValue>, DeviceError> {
        let mut state = self.lock();
        if let Some(reason) = state.rejections.get(name) {
            return Err(DeviceError::Rejected(reason.clone()));
        }

        match name {
            "init" => {
                state.initialised = true;
                state.state = DeviceState::On;
            }
            "reset" => {
                state.state = DeviceState::Standby;
            }
            "stop" | "abort" => {
                if state.initialised {
                    state.state = DeviceState::On;
                }
            }
            "home" => {
                require_initialised(&state)?;
                state.position = 0.0;
            }
            "moveAbsolute" | "moveRelative" => {
                require_initialised(&state)?;
                let amount = args
                    .first_f64()
                    .ok_or_else(|| DeviceError::Rejected(format!("{name} needs a numeric argument")))?;
                let target = if name == "moveRelative" {
                    state.position + amount
                } else {
                    amount
                };
                let (min, max) = state.limits;
                if target < min || target > max {
                    return Err(DeviceError::Rejected(format!(
                        "target {target} outside limits [{min}, {max}]"
                    )));
                }
                state.position = target;
                return Ok(Some(AttrValue::Scalar(Scalar::Float(target))));
            }
            "setVelocity" => {
                let v = args
                    .first_f64()
                    .filter(|v| *v > 0.0)
                    .ok_or_else(|| DeviceError::Rejected("velocity must be positive".to_string()))?;
                state.velocity = v;
            }
            _ => return Err(DeviceError::Rejected(format!("unknown command {name}"))),
        }
        Ok(None)
    }
}

fn require_initialised(state: &SimState) -> Result<(), DeviceError> {
    if state.initialised {
        Ok(())
    } else {
        Err(DeviceError::Rejected("axis not initialised".to_string()))
    }
}

/// Proxy onto a [`SimDevice`].
pub struct SimProxy {
    device: SimDevice,
    timeout: Duration,
}

#[async_trait]
impl DeviceProxy for SimProxy {
    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn query_state(&mut self) -> Result<DeviceState, DeviceError> {
        self.device.check_online()?;
        Ok(self.device.state())
    }

    async fn query_status(&mut self) -> Result<String, DeviceError> {
        self.device.check_online()?;
        let mut state = self.device.lock();
        state.status_reads += 1;
        Ok(format!("{}: position {:.3}", state.state, state.position))
    }

    async fn read_attributes(
        &mut self,
        names: &[String],
    ) -> Result<Vec<AttributeReading>, DeviceError> {
        self.device.check_online()?;
        let delay = {
            let mut state = self.device.lock();
            state.attribute_reads += 1;
            state.read_delay
        };
        if let Some(delay) = delay {
            if delay > self.timeout {
                tokio::time::sleep(self.timeout).await;
                return Err(DeviceError::timeout("read_attributes", self.timeout));
            }
            tokio::time::sleep(delay).await;
            self.device.check_online()?;
        }

        let state = self.device.lock();
        Ok(names
            .iter()
            .map(|name| AttributeReading {
                name: name.clone(),
                result: SimDevice::read_one(&state, name),
            })
            .collect())
    }

    async fn invoke_command(
        &mut self,
        name: &str,
        args: &CommandArgs,
    ) -> Result<Option<AttrValue>, DeviceError> {
        self.device.check_online()?;

        let delay = {
            let mut state = self.device.lock();
            if state.invocations.len() == INVOCATION_LOG_LEN {
                state.invocations.pop_front();
            }
            state.invocations.push_back(name.to_string());
            state.command_delays.get(name).copied()
        };
        if let Some(delay) = delay {
            if delay > self.timeout {
                tokio::time::sleep(self.timeout).await;
                return Err(DeviceError::timeout(name, self.timeout));
            }
            tokio::time::sleep(delay).await;
            self.device.check_online()?;
        }

        debug!("sim: {} {:?}", name, args);
        self.device.apply(name, args)
    }
}

/// Connector handing out proxies onto one simulated device.
#[derive(Debug, Clone, Default)]
pub struct SimConnector {
    device: SimDevice,
}

impl SimConnector {
    pub fn new(device: SimDevice) -> Self {
        Self { device }
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn DeviceProxy>, DeviceError> {
        {
            let mut state = self.device.lock();
            state.connect_attempts += 1;
            if !state.online {
                return Err(DeviceError::Transport(format!("{endpoint}: connection refused")));
            }
            state.connects += 1;
        }
        debug!("sim: opened proxy for {}", endpoint);
        Ok(Box::new(SimProxy {
            device: self.device.clone(),
            timeout: Duration::from_secs(3),
        }))
    }
}
