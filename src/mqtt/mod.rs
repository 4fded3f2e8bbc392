pub mod internal_commands;
pub mod ha_interface;

use std::collections::HashMap;
use lazy_static::lazy_static;
use tokio::sync::RwLock;
use crate::config::MqttConfig;
use crate::metering_62056::sensors::SensorValue;
use crate::mqtt::ha_interface::{safe_name, HaDiscover};
use log::{debug, error, info};
use tokio::sync::mpsc::{Receiver, Sender};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;

/// `<base>/<meter>/<leaf>`
pub fn meter_topic(base_topic: &str, meter: &str, leaf: &str) -> String {
    return format!("{base_topic}/{meter}/{leaf}");
}

pub struct SensorStateData {
    pub name: String,
    pub obis: String,
    pub value: SensorValue,
}

pub struct SubscribeData {
    /// Relative to the base topic
    pub topic: String,
    pub sender: tokio::sync::mpsc::Sender<String>
}

pub enum Transmission {
    SensorState(SensorStateData),
    Connection(bool),
    Identification(String),
    AutoDiscovery(HaDiscover),
    Subscribe(SubscribeData),
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    exit_thread: bool,
    client: AsyncClient,
    base_topic: String,
    meter_name: String,
}

pub struct Callbacks {
    calls: HashMap<String, Vec<tokio::sync::mpsc::Sender<String>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        return Callbacks { calls: HashMap::new() };
    }

    pub fn insert(&mut self, topic: String, callback: tokio::sync::mpsc::Sender<String>) {
        debug!("Adding callback to topic {topic}");
        self.calls.entry(topic).or_default().push(callback);
    }

    pub async fn send(&self, topic: &str, payload: String) {
        let v = match self.calls.get(topic) {
            Some(v) => v,
            None => {
                debug!("Send for unknown topic {topic}");
                return;
            }
        };

        for call in v {
            debug!("Sending to callback: {payload}");
            if let Err(e) = call.send(payload.clone()).await {
                error!("Callback for {topic} is gone: {e}");
            }
        }
    }

    pub fn get_topics(&self) -> Vec<String> {
        return self.calls.keys().cloned().collect();
    }
}

lazy_static! {
    pub static ref CALLBACKS: RwLock<Callbacks> = RwLock::new(Callbacks::new());
}

fn connection_payload(connected: bool) -> &'static str {
    if connected { "ON" } else { "OFF" }
}

impl MqttManager {
    pub fn new(config: &MqttConfig, meter_name: &str) -> (Self, Sender<Transmission>) {
        let (mtx, mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection starting up");
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        mqttoptions.set_credentials(config.user.clone(), config.pass.clone());

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // Spawn a new task to handle the incoming commands
        let reconnect_c = client.clone();
        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let payload = String::from_utf8_lossy(&p.payload).to_string();
                        debug!("Received MQTT message on {}: {payload:?}", p.topic);

                        let callback = CALLBACKS.read().await;
                        callback.send(&p.topic, payload).await;
                    },
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected, resubscribing everything");

                        let topics = CALLBACKS.read().await.get_topics();
                        for topic in topics {
                            let client_clone = reconnect_c.clone();
                            tokio::spawn(async move {
                                if let Err(e) = client_clone.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                                    error!("Resubscribing {topic} failed: {e}");
                                }
                            });
                        }
                    },
                    Ok(_) => {},
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting ", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        return (MqttManager {
            client,
            rx: mrx,
            exit_thread: false,
            base_topic: config.base_topic.clone(),
            meter_name: meter_name.to_string(),
        }, mtx);
    }

    fn topic(&self, leaf: &str) -> String {
        meter_topic(&self.base_topic, &self.meter_name, leaf)
    }

    async fn publish(&self, topic: String, qos: QoS, retain: bool, payload: String) {
        match self.client.publish(topic.clone(), qos, retain, payload).await {
            Err(e) => { error!("Error publishing to {topic}: {}", e); },
            Ok(_) => { debug!("Published {topic} successfully"); }
        }
    }

    pub async fn start_thread(&mut self) {
        while !self.exit_thread {
            let transmission = match self.rx.recv().await {
                Some(t) => t,
                None => {
                    debug!("Reading returned none, we exit now");
                    self.exit_thread = true;
                    continue;
                }
            };

            match transmission {
                Transmission::SensorState(data) => {
                    debug!("Publishing sensor '{}' (OBIS '{}'): {}", data.name, data.obis, data.value.to_payload());
                    let topic = self.topic(&format!("sensor/{}", safe_name(&data.name)));
                    self.publish(topic, QoS::AtLeastOnce, false, data.value.to_payload()).await;
                }
                Transmission::Connection(connected) => {
                    let topic = self.topic("connection");
                    self.publish(topic, QoS::AtLeastOnce, true, connection_payload(connected).to_string()).await;
                }
                Transmission::Identification(id) => {
                    info!("Meter identification: {id}");
                    let topic = self.topic("identification");
                    self.publish(topic, QoS::AtLeastOnce, true, id).await;
                }
                Transmission::AutoDiscovery(disc) => {
                    match serde_json::to_string(&disc) {
                        Ok(payload) => self.publish(disc.discover_topic.clone(), QoS::AtLeastOnce, true, payload).await,
                        Err(e) => error!("Unable to serialize discovery for {}: {e}", disc.get_dev_id()),
                    }
                }
                Transmission::Subscribe(subscribe_data) => {
                    let topic = format!("{}/{}", self.base_topic, subscribe_data.topic);
                    if self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await.is_ok() {
                        CALLBACKS.write().await.insert(topic.clone(), subscribe_data.sender);
                        info!("Registered Callback {topic}");
                    }
                }
            };
        }

        info!("MQTT thread exit");
    }
}
