use std::collections::HashMap;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;

use super::Publication;

pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    config: Config,
}

impl MqttClient {
    pub fn new(config: &Config) -> Self {
        let mut mqttopts = MqttOptions::new(
            &config.mqtt.client_id,
            &config.mqtt.broker_host,
            config.mqtt.broker_port,
        );
        mqttopts.set_keep_alive(std::time::Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            mqttopts.set_credentials(user, pass);
        }

        // LWT: the broker marks the whole bridge offline if we vanish.
        let lwt = rumqttc::LastWill::new(
            format!("{}/bridge_status", config.mqtt.topic_prefix),
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        mqttopts.set_last_will(lwt);

        let (client, eventloop) = AsyncClient::new(mqttopts, 100);

        Self {
            client,
            eventloop,
            config: config.clone(),
        }
    }

    /// Run the MQTT event loop. Subscribes to command topics on connect,
    /// forwards incoming command messages through `command_tx`, and
    /// publishes device state, outcomes and connection status from `pub_rx`.
    pub async fn run(
        self,
        command_tx: mpsc::Sender<MqttMessage>,
        mut pub_rx: mpsc::Receiver<Publication>,
    ) {
        // The event loop is not Sync; only the client and config are
        // borrowed across publish awaits.
        let Self {
            client,
            mut eventloop,
            config,
        } = self;

        let subscribe_topics: Vec<String> = config
            .devices
            .iter()
            .map(|d| config.device_command_topic(&d.topic_name))
            .collect();

        let mut last_values: HashMap<String, String> = HashMap::new();
        // Last known device connection, re-announced after a broker reconnect.
        let mut device_online: HashMap<String, bool> = HashMap::new();

        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("Connected to MQTT broker");
                            announce(&client, &config, &subscribe_topics, &device_online).await;
                            // Retained state may have been lost with the session.
                            last_values.clear();
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let payload = String::from_utf8_lossy(&publish.payload).to_string();
                            let msg = MqttMessage {
                                topic: publish.topic.clone(),
                                payload,
                            };
                            if command_tx.send(msg).await.is_err() {
                                warn!("Command channel closed");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT connection error: {}. Reconnecting...", e);
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                    }
                }
                Some(publication) = pub_rx.recv() => {
                    match publication {
                        Publication::State { topic_name, attribute, value } => {
                            let topic = config.device_state_topic(&topic_name, &attribute);
                            if last_values.get(&topic) == Some(&value) {
                                continue;
                            }
                            debug!("Publishing {}: {}", topic, value);
                            if let Err(e) = client
                                .publish(&topic, QoS::AtMostOnce, true, value.as_bytes())
                                .await
                            {
                                warn!("Failed to publish {}: {}", topic, e);
                                continue;
                            }
                            last_values.insert(topic, value);
                        }
                        Publication::Outcome { topic_name, outcome } => {
                            let topic = config.device_outcome_topic(&topic_name);
                            let body = match serde_json::to_string(&outcome) {
                                Ok(body) => body,
                                Err(e) => {
                                    warn!("Failed to encode outcome for {}: {}", topic_name, e);
                                    continue;
                                }
                            };
                            info!("Publishing {}: {}", topic, body);
                            if let Err(e) = client
                                .publish(&topic, QoS::AtLeastOnce, false, body)
                                .await
                            {
                                warn!("Failed to publish {}: {}", topic, e);
                            }
                        }
                        Publication::Connection { topic_name, connected } => {
                            device_online.insert(topic_name.clone(), connected);
                            publish_status(&client, &config, &topic_name, connected).await;
                        }
                    }
                }
            }
        }
    }
}

async fn announce(
    client: &AsyncClient,
    config: &Config,
    subscribe_topics: &[String],
    device_online: &HashMap<String, bool>,
) {
    let bridge_topic = format!("{}/bridge_status", config.mqtt.topic_prefix);
    if let Err(e) = client
        .publish(&bridge_topic, QoS::AtLeastOnce, true, "online")
        .await
    {
        error!("Failed to publish bridge status: {}", e);
    }

    for device in &config.devices {
        let connected = device_online
            .get(&device.topic_name)
            .copied()
            .unwrap_or(false);
        publish_status(client, config, &device.topic_name, connected).await;
    }

    for topic in subscribe_topics {
        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
            error!("Failed to subscribe to {}: {}", topic, e);
        }
    }
}

async fn publish_status(client: &AsyncClient, config: &Config, topic_name: &str, connected: bool) {
    let topic = config.device_status_topic(topic_name);
    let payload = if connected { "online" } else { "offline" };
    if let Err(e) = client
        .publish(&topic, QoS::AtLeastOnce, true, payload)
        .await
    {
        error!("Failed to publish {}: {}", topic, e);
    }
}
