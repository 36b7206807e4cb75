use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

use device_worker::{ConfigError, WorkerConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub bridge: BridgeConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How often cached device status is pulled and published.
    pub status_publish_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    /// Sanitized name for use in MQTT topics (lowercase, spaces to underscores)
    pub topic_name: String,
    pub worker: WorkerConfig,
}

// Serde struct for one entry of the devices file. Durations are in milliseconds.
#[derive(Deserialize)]
struct RawDevice {
    name: String,
    endpoint: String,
    attributes: Vec<String>,
    #[serde(default)]
    critical_commands: Option<Vec<String>>,
    #[serde(default)]
    ready_commands: Vec<String>,
    #[serde(default)]
    init_command: Option<String>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
    #[serde(default)]
    reconnect_interval_ms: Option<u64>,
    #[serde(default)]
    max_reconnect_interval_ms: Option<u64>,
    #[serde(default)]
    command_timeout_ms: Option<u64>,
    #[serde(default)]
    poll_timeout_ms: Option<u64>,
    #[serde(default)]
    join_timeout_ms: Option<u64>,
    #[serde(default)]
    max_queue_size: Option<usize>,
    #[serde(default)]
    failure_threshold: Option<u32>,
    #[serde(default)]
    status_every: Option<u32>,
}

fn env_required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnv(key))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let devices_file = env_or_default("DEVICES_FILE", "devices.json".to_string());
        let devices = load_devices(&devices_file)?;

        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_required("MQTT_BROKER_HOST")?,
                broker_port: env_or_default("MQTT_BROKER_PORT", 1883),
                username: env_optional("MQTT_USERNAME"),
                password: env_optional("MQTT_PASSWORD"),
                topic_prefix: env_or_default("MQTT_TOPIC_PREFIX", "panel".to_string()),
                client_id: env_or_default("MQTT_CLIENT_ID", "device-worker".to_string()),
            },
            bridge: BridgeConfig {
                status_publish_interval: Duration::from_millis(env_or_default(
                    "STATUS_PUBLISH_INTERVAL_MS",
                    1000,
                )),
            },
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker_host.is_empty() {
            return Err(ConfigError::Invalid("MQTT_BROKER_HOST must not be empty".into()));
        }
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("No devices found in devices file".into()));
        }
        if self.bridge.status_publish_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "STATUS_PUBLISH_INTERVAL_MS must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn device_status_topic(&self, topic_name: &str) -> String {
        format!("{}/{}/bridge_status", self.mqtt.topic_prefix, topic_name)
    }

    pub fn device_command_topic(&self, topic_name: &str) -> String {
        format!("{}/{}/command/#", self.mqtt.topic_prefix, topic_name)
    }

    pub fn device_state_topic(&self, topic_name: &str, attribute: &str) -> String {
        format!("{}/{}/state/{}", self.mqtt.topic_prefix, topic_name, attribute)
    }

    pub fn device_outcome_topic(&self, topic_name: &str) -> String {
        format!("{}/{}/outcome", self.mqtt.topic_prefix, topic_name)
    }
}

fn load_devices(path: &str) -> Result<Vec<DeviceConfig>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    parse_devices(&content, path)
}

fn parse_devices(content: &str, path: &str) -> Result<Vec<DeviceConfig>, ConfigError> {
    let raw_devices: Vec<RawDevice> =
        serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;

    let mut seen_topics = HashSet::new();
    raw_devices
        .into_iter()
        .map(|raw| {
            let topic_name = sanitize_topic_name(&raw.name);
            if topic_name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Device name {:?} has no usable characters",
                    raw.name
                )));
            }
            if !seen_topics.insert(topic_name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "Device {} collides with another device on topic {topic_name}",
                    raw.name
                )));
            }

            let worker = worker_config(raw);
            worker.validate()?;
            Ok(DeviceConfig {
                name: worker.device.clone(),
                topic_name,
                worker,
            })
        })
        .collect()
}

fn worker_config(raw: RawDevice) -> WorkerConfig {
    let mut cfg = WorkerConfig::new(raw.name, raw.endpoint)
        .with_attributes(raw.attributes)
        .with_ready_commands(raw.ready_commands);

    if let Some(critical) = raw.critical_commands {
        cfg = cfg.with_critical_commands(critical);
    }
    if let Some(init) = raw.init_command {
        cfg.init_command = init;
    }

    let ms = Duration::from_millis;
    if let Some(v) = raw.poll_interval_ms {
        cfg.poll_interval = ms(v);
    }
    if let Some(v) = raw.reconnect_interval_ms {
        cfg.reconnect_interval = ms(v);
    }
    if let Some(v) = raw.max_reconnect_interval_ms {
        cfg.max_reconnect_interval = ms(v);
    }
    if let Some(v) = raw.command_timeout_ms {
        cfg.command_timeout = ms(v);
    }
    if let Some(v) = raw.poll_timeout_ms {
        cfg.poll_timeout = ms(v);
    }
    if let Some(v) = raw.join_timeout_ms {
        cfg.join_timeout = ms(v);
    }
    if let Some(v) = raw.max_queue_size {
        cfg.max_queue_size = v;
    }
    if let Some(v) = raw.failure_threshold {
        cfg.failure_threshold = v;
    }
    if let Some(v) = raw.status_every {
        cfg.status_every = v;
    }
    cfg
}

/// Convert a device name into a safe MQTT topic segment.
/// "Hexapod Pose" → "hexapod_pose"
fn sanitize_topic_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}
