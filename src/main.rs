mod config;
mod mqtt;

use std::collections::HashMap;
use std::sync::Arc;

use device_worker::device::sim::{SimConnector, SimDevice};
use device_worker::{CommandArgs, Connector, Shutdown, Worker, WorkerEvent};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use mqtt::Publication;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting device-worker panel bridge (mqtt={}:{}, devices={})",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.devices.len(),
    );

    for device in &config.devices {
        info!(
            "  Device: {} at {}: {} attributes polled every {:?}",
            device.name,
            device.worker.endpoint,
            device.worker.attributes.len(),
            device.worker.poll_interval,
        );
    }

    // Channels
    let (mqtt_cmd_tx, mut mqtt_cmd_rx) = mpsc::channel::<mqtt::client::MqttMessage>(100);
    let (pub_tx, pub_rx) = mpsc::channel::<Publication>(200);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();

    let mqtt_client = mqtt::client::MqttClient::new(&config);
    let mqtt_handle = tokio::spawn(async move {
        mqtt_client.run(mqtt_cmd_tx, pub_rx).await;
    });

    // One worker per device, keyed by topic_name for command routing
    let mut workers: HashMap<String, Worker> = HashMap::new();
    // Worker events carry the device name; map it back to the topic segment
    let mut topic_names: HashMap<String, String> = HashMap::new();

    for device in &config.devices {
        let connector = match connector_for(&device.worker.endpoint) {
            Ok(c) => c,
            Err(e) => {
                error!("Device {}: {}", device.name, e);
                std::process::exit(1);
            }
        };
        let mut worker = match Worker::new(device.worker.clone(), connector, event_tx.clone()) {
            Ok(w) => w,
            Err(e) => {
                error!("Device {}: {}", device.name, e);
                std::process::exit(1);
            }
        };
        worker.start();
        topic_names.insert(device.name.clone(), device.topic_name.clone());
        workers.insert(device.topic_name.clone(), worker);
    }
    drop(event_tx);

    let topic_prefix = config.mqtt.topic_prefix.clone();
    let mut status_timer = tokio::time::interval(config.bridge.status_publish_interval);

    // Registered once so a signal arriving while an arm is busy is not lost.
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let terminate = sigterm();
    tokio::pin!(terminate);

    // Main loop: route MQTT commands to workers, forward worker events,
    // pull cached status on a timer, handle shutdown
    loop {
        tokio::select! {
            Some(msg) = mqtt_cmd_rx.recv() => {
                // Parse topic: {prefix}/{topic_name}/command/{command}
                let Some((topic_name, command)) = parse_command_topic(&msg.topic, &topic_prefix) else {
                    debug!("Ignoring message on {}", msg.topic);
                    continue;
                };
                let Some(worker) = workers.get(topic_name) else {
                    warn!("Unknown device in command topic: {}", topic_name);
                    continue;
                };
                let args = CommandArgs::from_payload(&msg.payload);
                info!("Command for {}: {} {:?}", topic_name, command, args);
                // Rejections are also delivered as outcome events.
                if let Err(e) = worker.queue_command(command, args) {
                    debug!("{} not queued for {}: {}", command, topic_name, e);
                }
            }
            Some(event) = event_rx.recv() => {
                if let Some(publication) = to_publication(event, &topic_names) {
                    if pub_tx.send(publication).await.is_err() {
                        warn!("Publication channel closed");
                    }
                }
            }
            _ = status_timer.tick() => {
                for (topic_name, worker) in &workers {
                    let skipped = offer(&pub_tx, status_publications(topic_name, worker));
                    if skipped > 0 {
                        debug!("MQTT backlog, skipped {} status update(s) for {}", skipped, topic_name);
                    }
                }
            }
            _ = &mut ctrl_c => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = &mut terminate => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    for (topic_name, worker) in workers.iter_mut() {
        if worker.stop().await == Shutdown::Aborted {
            warn!("Worker for {} had to be aborted", topic_name);
        }
    }
    mqtt_handle.abort();
    info!("device-worker panel bridge stopped");
}

async fn sigterm() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Pick a transport for an endpoint. Only simulated devices are built in;
/// real device proxies plug in through [`Connector`].
fn connector_for(endpoint: &str) -> Result<Arc<dyn Connector>, String> {
    match endpoint.split_once("://") {
        Some(("sim", _)) => Ok(Arc::new(SimConnector::new(SimDevice::new()))),
        Some((scheme, _)) => Err(format!("unsupported endpoint scheme {scheme:?}")),
        None => Err(format!("endpoint {endpoint:?} has no scheme")),
    }
}

fn to_publication(event: WorkerEvent, topic_names: &HashMap<String, String>) -> Option<Publication> {
    match event {
        WorkerEvent::CommandOutcome(outcome) => Some(Publication::Outcome {
            topic_name: topic_names.get(&outcome.device)?.clone(),
            outcome,
        }),
        WorkerEvent::ConnectionChanged { device, connected } => Some(Publication::Connection {
            topic_name: topic_names.get(&device)?.clone(),
            connected,
        }),
        WorkerEvent::HealthChanged { device, healthy } => Some(Publication::State {
            topic_name: topic_names.get(&device)?.clone(),
            attribute: "healthy".to_string(),
            value: healthy.to_string(),
        }),
    }
}

fn status_publications(topic_name: &str, worker: &Worker) -> Vec<Publication> {
    let Some(snapshot) = worker.cached_status() else {
        return Vec::new();
    };

    let state = |attribute: &str, value: String| Publication::State {
        topic_name: topic_name.to_string(),
        attribute: attribute.to_string(),
        value,
    };

    let mut out: Vec<Publication> = snapshot
        .attributes
        .iter()
        .map(|(name, attr)| state(name, attr.value.to_string()))
        .collect();
    if let Some(device_state) = snapshot.device_state {
        out.push(state("device_state", device_state.to_string()));
    }
    if let Some(status) = &snapshot.device_status {
        out.push(state("device_status", status.clone()));
    }
    out
}

/// Queue status publications without waiting on a backed-up MQTT task.
/// A newer snapshot follows on the next tick, so dropping one is harmless.
/// Returns how many were dropped.
fn offer(pub_tx: &mpsc::Sender<Publication>, publications: Vec<Publication>) -> usize {
    let mut skipped = 0;
    for publication in publications {
        match pub_tx.try_send(publication) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => skipped += 1,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Publication channel closed");
                return skipped;
            }
        }
    }
    skipped
}

/// Parse a command topic into (topic_name, command).
/// Expected format: {prefix}/{topic_name}/command/{command}
fn parse_command_topic<'a>(topic: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    // rest = "{topic_name}/command/{command}"
    let (topic_name, rest) = rest.split_once('/')?;
    let command = rest.strip_prefix("command/")?;
    if topic_name.is_empty() || command.is_empty() || command.contains('/') {
        return None;
    }
    Some((topic_name, command))
}
