use crate::config::{Config, SensorConfig, SensorType};
use crate::mqtt::ha_interface::build_discovery;
use crate::mqtt::{SensorStateData, Transmission};
use log::{debug, error, info};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::MissedTickBehavior;

pub mod utils;
pub mod structs;
pub mod obis_parser;
pub mod negotiation;
pub mod sensors;
pub mod transport;
pub mod frame;
pub mod session;

use sensors::{SensorEntry, SensorKind, SensorRegistry, TextGroup};
use session::Session;
use structs::SessionEvent;
use transport::{SerialTransport, Transport};

#[derive(Error, Debug)]
pub enum Iec62056ParseError {
    #[error("Invalid data line format")]
    InvalidDataLine,
    #[error("Invalid OBIS code format: '{0}'")]
    InvalidObisCode(String),
    #[error("Invalid number: '{0}'")]
    InvalidNumber(String),
    #[error("Missing identification line")]
    MissingIdentification,
    #[error("Frame of {0} bytes does not fit into the output buffer")]
    FrameTooLarge(usize),
}

#[derive(Error, Debug)]
pub enum Iec62056Error {
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
    #[error("Invalid meter configuration: {0}")]
    Config(String),
}

/// Manufacturer used for the discovery until the meter identified itself
const UNKNOWN_MANUFACTURER: &str = "unknown";

pub struct Iec62056Manager {
    sender: Sender<Transmission>,
    config: Config,
    trigger: Receiver<()>,
}

/// Sensors of the config in dispatch order.
pub fn build_registry(sensors: &[SensorConfig]) -> SensorRegistry {
    let mut registry = SensorRegistry::new();
    for s in sensors {
        let kind = match s.sensor_type {
            SensorType::Sensor => SensorKind::Numeric,
            SensorType::TextSensor => SensorKind::Text(TextGroup::from_u8(s.group).unwrap_or(TextGroup::Value1)),
        };
        registry.register(SensorEntry::new(s.name.clone(), s.obis.clone(), kind));
    }
    registry
}

impl Iec62056Manager {
    pub fn new(sender: Sender<Transmission>, config: Config, trigger: Receiver<()>) -> Self {
        Self { sender, config, trigger }
    }

    pub async fn start_thread(&mut self) -> Result<(), Iec62056Error> {
        info!("Starting IEC 62056-21 thread");
        self.config.validate().map_err(|e| Iec62056Error::Config(e.to_string()))?;
        self.dump_config();

        let transport = SerialTransport::open(&self.config.meter.port)?;
        self.run(transport).await;
        Ok(())
    }

    /// Drives the session until the trigger channel is closed.
    pub async fn run<T: Transport>(&mut self, transport: T) {
        let meter = &self.config.meter;
        let registry = build_registry(&meter.sensors);
        let mut session = Session::new(meter.session_settings(), transport, registry, Instant::now());

        session.setup(Instant::now());

        if self.config.mqtt.ha_enabled {
            self.send_discovery(UNKNOWN_MANUFACTURER).await;
        }

        let mut interval = tokio::time::interval(meter.loop_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // the serial port is blocking, keep it off the async workers
                    tokio::task::block_in_place(|| session.tick(Instant::now()));
                }
                t = self.trigger.recv() => {
                    match t {
                        Some(_) => {
                            session.trigger_readout();
                        }
                        None => {
                            info!("Trigger channel closed, stopping IEC 62056-21 thread");
                            return;
                        }
                    }
                }
            }

            for event in session.drain_events() {
                self.forward(event).await;
            }
        }
    }

    async fn forward(&self, event: SessionEvent) {
        let t = match event {
            SessionEvent::Connection(connected) => Transmission::Connection(connected),
            SessionEvent::Identification(id) => {
                if self.config.mqtt.ha_enabled {
                    if let Ok(device) = utils::parse_identification_line(id.as_bytes()) {
                        self.send_discovery(&device.manufacturer).await;
                    }
                }
                Transmission::Identification(id)
            }
            SessionEvent::SensorState { name, obis, value } => {
                Transmission::SensorState(SensorStateData { name, obis, value })
            }
        };

        if let Err(e) = self.sender.send(t).await {
            error!("Unable to hand over meter data: {e}");
        }
    }

    async fn send_discovery(&self, manufacturer: &str) {
        match build_discovery(&self.config.mqtt.base_topic, &self.config.meter, manufacturer) {
            Ok(disc) => {
                debug!("Sending discovery for {}", disc.get_dev_id());
                if let Err(e) = self.sender.send(Transmission::AutoDiscovery(disc)).await {
                    error!("Unable to hand over discovery: {e}");
                }
            }
            Err(e) => error!("Unable to build discovery: {e}"),
        }
    }

    pub fn dump_config(&self) {
        let m = &self.config.meter;
        info!("IEC62056:");
        info!("  Meter: {} on {}", m.name, m.port);
        info!("  Connection timeout: {} ms", m.connection_timeout);
        info!("  Battery meter: {}", if m.battery_meter { "YES" } else { "NO" });
        if m.baud_rate_max == 0 {
            info!("  Max baud rate: not limited");
        } else {
            info!("  Max baud rate: {} bps", m.baud_rate_max);
        }
        info!("  Retries: {}", m.max_retries);
        info!("  Retry delay: {} ms", m.retry_delay);
        info!("  Mode D: {}", if m.mode_d { "YES" } else { "NO" });
        if m.update_interval == 0 {
            info!("  Update interval: never");
        } else {
            info!("  Update interval: {} s", m.update_interval);
        }
        info!("  OBIS codes requested: {}", m.obis_codes.len());
        for s in &m.sensors {
            info!("  Sensor '{}': OBIS '{}' ({:?})", s.name, s.obis, s.sensor_type);
        }
    }
}
