use serde::{Deserialize, Serialize};
use crate::config::{MeterConfig, SensorType};
use super::meter_topic;

const ORIGIN_NAME: &str = "iec2mqtt";

#[derive(Serialize)]
pub struct HaDevice {
    ids: String,
    name: String,
    manufacturer: String,
    model: String,
}

#[derive(Serialize)]
pub struct HaOrigin {
    pub name: String,
    pub sw_version: String,
}

fn is_none_str(value: &String) -> bool {
    if value.is_empty() || value == "NONE" {
        return true;
    }
    return false;
}

#[derive(Serialize, PartialEq, Deserialize, Clone, Default)]
pub enum HAPlatform {
    #[default]
    Sensor,
    BinarySensor,
}

impl HAPlatform {
    pub fn to_string(&self) -> String {
        match self {
            HAPlatform::Sensor => "sensor".to_string(),
            HAPlatform::BinarySensor => "binary_sensor".to_string(),
        }
    }
}

pub fn safe_name(name: &str) -> String {
    return name.replace(" ", "_").to_lowercase();
}

#[derive(Serialize)]
pub struct HaComponent {
    pub p: String,
    pub name: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub device_class: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub unit_of_measurement: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub state_class: String,
    pub state_topic: String,
    pub unique_id: String,
    pub object_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,
}

impl HaComponent {
    pub fn new(platform: HAPlatform, device: &str, name: &str, state_topic: String) -> Self {
        let safe = safe_name(name);
        let device = safe_name(device);

        let mut p_off = None;
        let mut p_on = None;
        if platform == HAPlatform::BinarySensor {
            p_on = Some("ON".to_string());
            p_off = Some("OFF".to_string());
        }

        return HaComponent {
            p: platform.to_string(),
            name: name.to_string(),
            device_class: String::new(),
            unit_of_measurement: String::new(),
            state_class: String::new(),
            state_topic,
            unique_id: format!("iec2mqtt_{device}_{safe}"),
            object_id: format!("{device}_{safe}"),
            payload_on: p_on,
            payload_off: p_off,
        }
    }

    pub fn new_connectivity(device: &str, state_topic: String) -> Self {
        let mut c = Self::new(HAPlatform::BinarySensor, device, "connection", state_topic);
        c.device_class = "connectivity".to_string();
        return c;
    }
}

#[derive(Serialize)]
pub struct HaDiscover {
    pub dev: HaDevice,
    pub o: HaOrigin,
    pub cmps: serde_json::Map<String, serde_json::Value>,
    pub qos: u32,
    #[serde(skip_serializing)]
    pub discover_topic: String,
}

impl HaDiscover {
    pub fn new(name: &str, manu: String, model: String) -> Self {
        return HaDiscover {
            discover_topic: format!("homeassistant/device/iec2mqtt_{}/config", safe_name(name)),
            dev: HaDevice {
                ids: format!("iec2mqtt_{}", safe_name(name)),
                name: name.to_string(),
                manufacturer: manu,
                model,
            },
            o: HaOrigin {
                name: ORIGIN_NAME.to_string(),
                sw_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            cmps: serde_json::Map::new(),
            qos: 1,
        }
    }

    pub fn add_component(&mut self, key: String, component: HaComponent) -> Result<(), serde_json::Error> {
        self.cmps.insert(key, serde_json::to_value(component)?);
        Ok(())
    }

    pub fn get_dev_id(&self) -> String {
        return self.dev.ids.clone();
    }
}

/// Device discovery with one component per configured sensor plus the
/// connectivity indicator.
pub fn build_discovery(base_topic: &str, meter: &MeterConfig, manufacturer: &str) -> Result<HaDiscover, serde_json::Error> {
    let model = if meter.mode_d { "IEC 62056-21 mode D" } else { "IEC 62056-21" };
    let mut disc = HaDiscover::new(&meter.name, manufacturer.to_string(), model.to_string());

    disc.add_component("connection".to_string(),
                       HaComponent::new_connectivity(&meter.name, meter_topic(base_topic, &meter.name, "connection")))?;

    for s in &meter.sensors {
        let key = safe_name(&s.name);
        let mut c = HaComponent::new(HAPlatform::Sensor, &meter.name, &s.name,
                                     meter_topic(base_topic, &meter.name, &format!("sensor/{key}")));
        // text sensors carry no unit or class in HA
        if s.sensor_type == SensorType::Sensor {
            c.device_class = s.device_class.clone();
            c.unit_of_measurement = s.unit_of_measurement.clone();
            c.state_class = s.state_class.clone();
        }
        disc.add_component(key, c)?;
    }

    Ok(disc)
}
