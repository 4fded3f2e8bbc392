//! IEC 62056-21 meter readout bridge
//!
//! This library reads electricity meters through an optical reading head on a serial
//! line (protocol modes A, B, C and D) and hands the values to MQTT.

pub mod mqtt;
pub mod config;
pub mod metering_62056;

// Re-export common types for easier access
pub use config::Config;
pub use mqtt::{CALLBACKS, MqttManager, Transmission};
pub use metering_62056::Iec62056Manager;
