use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::ConfigError;

/// The RPC framework refuses reconnects faster than this.
pub const FRAMEWORK_MIN_RECONNECT: Duration = Duration::from_secs(1);

/// Everything that distinguishes one device's worker from another's.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Device name, used in logs and events.
    pub device: String,
    /// Endpoint handed to the [`Connector`](crate::device::Connector).
    pub endpoint: String,
    /// Attributes read in one batch per poll cycle.
    pub attributes: Vec<String>,
    /// Commands exempt from the health gate (stop, reset...).
    pub critical_commands: BTreeSet<String>,
    /// Commands that need the device in a ready state before running.
    pub ready_commands: BTreeSet<String>,
    /// Command tried once to bring a device into a ready state.
    pub init_command: String,
    pub poll_interval: Duration,
    pub reconnect_interval: Duration,
    /// Upper bound for the reconnect backoff.
    pub max_reconnect_interval: Duration,
    pub command_timeout: Duration,
    pub poll_timeout: Duration,
    pub max_queue_size: usize,
    /// Consecutive failed polls before health flips to unhealthy.
    pub failure_threshold: u32,
    /// Read the device state/status string every Nth poll cycle.
    pub status_every: u32,
    pub join_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(device: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            endpoint: endpoint.into(),
            attributes: Vec::new(),
            critical_commands: ["stop", "reset", "init", "abort"]
                .into_iter()
                .map(String::from)
                .collect(),
            ready_commands: BTreeSet::new(),
            init_command: "init".to_string(),
            poll_interval: Duration::from_millis(500),
            reconnect_interval: Duration::from_secs(3),
            max_reconnect_interval: Duration::from_secs(30),
            command_timeout: Duration::from_millis(1500),
            poll_timeout: Duration::from_secs(3),
            max_queue_size: 3,
            failure_threshold: 2,
            status_every: 10,
            join_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_critical_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_commands = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ready_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ready_commands = commands.into_iter().map(Into::into).collect();
        self
    }

    /// Critical commands bypass the health gate. Matching ignores ASCII case.
    pub fn is_critical(&self, command: &str) -> bool {
        self.critical_commands
            .iter()
            .any(|c| c.eq_ignore_ascii_case(command))
    }

    pub fn needs_ready_state(&self, command: &str) -> bool {
        self.ready_commands
            .iter()
            .any(|c| c.eq_ignore_ascii_case(command))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(format!("{}: {msg}", self.device)));

        if self.device.is_empty() {
            return Err(ConfigError::Invalid("device name must not be empty".into()));
        }
        if self.endpoint.is_empty() {
            return invalid("endpoint must not be empty".into());
        }
        if self.attributes.is_empty() {
            return invalid("at least one attribute must be polled".into());
        }
        if self.max_queue_size == 0 {
            return invalid("max_queue_size must be > 0".into());
        }
        if self.failure_threshold == 0 {
            return invalid("failure_threshold must be > 0".into());
        }
        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("command_timeout", self.command_timeout),
            ("poll_timeout", self.poll_timeout),
            ("join_timeout", self.join_timeout),
        ] {
            if value.is_zero() {
                return invalid(format!("{name} must be > 0"));
            }
        }
        if self.reconnect_interval <= FRAMEWORK_MIN_RECONNECT {
            return invalid(format!(
                "reconnect_interval must exceed {:?}",
                FRAMEWORK_MIN_RECONNECT
            ));
        }
        if self.max_reconnect_interval < self.reconnect_interval {
            return invalid("max_reconnect_interval must not be below reconnect_interval".into());
        }
        Ok(())
    }
}
