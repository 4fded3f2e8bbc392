//! Sensors fed by the readout, keyed by OBIS code.
//!
//! The registry is an ordered vector (by OBIS code, then registration order)
//! so the publish sweep can walk it by index across several scheduler ticks.

use super::obis_parser::{self, ObisLine};
use super::Iec62056ParseError;
use log::{debug, error};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextGroup {
    /// The whole data line
    Line,
    Value1,
    Value2,
}

impl TextGroup {
    pub fn from_u8(group: u8) -> Option<Self> {
        match group {
            0 => Some(TextGroup::Line),
            1 => Some(TextGroup::Value1),
            2 => Some(TextGroup::Value2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Numeric,
    Text(TextGroup),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SensorValue {
    Number(f64),
    Text(String),
}

impl SensorValue {
    pub fn to_payload(&self) -> String {
        match self {
            SensorValue::Number(n) => n.to_string(),
            SensorValue::Text(t) => t.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SensorEntry {
    pub name: String,
    pub obis: String,
    pub kind: SensorKind,
    value: Option<SensorValue>,
}

impl SensorEntry {
    pub fn new(name: String, obis: String, kind: SensorKind) -> Self {
        return SensorEntry { name, obis, kind, value: None };
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&SensorValue> {
        self.value.as_ref()
    }

    pub fn reset(&mut self) {
        self.value = None;
    }

    /// Converts the matching part of a data line and stores it as pending value.
    pub fn set_from_line(&mut self, raw_line: &str, data: &ObisLine) -> Result<(), Iec62056ParseError> {
        match self.kind {
            SensorKind::Text(group) => {
                let text = match group {
                    TextGroup::Line => raw_line,
                    TextGroup::Value1 => data.value1.as_str(),
                    TextGroup::Value2 => data.value2.as_str(),
                };
                debug!("Set text sensor '{}' for OBIS '{}' group {:?}. Value: '{}'", self.name, self.obis, group, text);
                self.value = Some(SensorValue::Text(text.to_string()));
            }
            SensorKind::Numeric => {
                let number = obis_parser::parse_number(&data.value1)?;
                debug!("Set sensor '{}' for OBIS '{}'. Value: {}", self.name, self.obis, number);
                self.value = Some(SensorValue::Number(number));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SensorRegistry {
    sensors: Vec<SensorEntry>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sensor: SensorEntry) {
        let pos = self.sensors.partition_point(|s| s.obis <= sensor.obis);
        self.sensors.insert(pos, sensor);
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn get(&self, index: usize) -> Option<&SensorEntry> {
        self.sensors.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SensorEntry> {
        self.sensors.iter()
    }

    fn range(&self, obis: &str) -> std::ops::Range<usize> {
        let start = self.sensors.partition_point(|s| s.obis.as_str() < obis);
        let end = self.sensors.partition_point(|s| s.obis.as_str() <= obis);
        start..end
    }

    /// Updates every sensor registered for the OBIS code of `data`.
    /// Returns the number of sensors that received a value.
    pub fn dispatch(&mut self, raw_line: &str, data: &ObisLine) -> usize {
        let mut updated = 0;
        for i in self.range(&data.code) {
            match self.sensors[i].set_from_line(raw_line, data) {
                Ok(_) => updated += 1,
                Err(e) => {
                    error!("Cannot convert data to number. Consider using text sensor. {}", e);
                }
            }
        }
        updated
    }

    pub fn reset_all(&mut self) {
        for s in self.sensors.iter_mut() {
            s.reset();
        }
    }

    pub fn first_without_value(&self) -> Option<&SensorEntry> {
        self.sensors.iter().find(|s| !s.has_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(code: &str, v1: &str, v2: &str) -> ObisLine {
        ObisLine { code: code.to_string(), value1: v1.to_string(), value2: v2.to_string() }
    }

    fn registry() -> SensorRegistry {
        let mut r = SensorRegistry::new();
        r.register(SensorEntry::new("voltage".into(), "200700FF".into(), SensorKind::Numeric));
        r.register(SensorEntry::new("energy".into(), "0F0880FF".into(), SensorKind::Numeric));
        r.register(SensorEntry::new("energy_raw".into(), "0F0880FF".into(), SensorKind::Text(TextGroup::Line)));
        r.register(SensorEntry::new("energy_v2".into(), "0F0880FF".into(), SensorKind::Text(TextGroup::Value2)));
        r
    }

    #[test]
    fn test_registry_order() {
        let r = registry();
        let names: Vec<&str> = r.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["energy", "energy_raw", "energy_v2", "voltage"]);
    }

    #[test]
    fn test_dispatch_multiple_sensors() {
        let mut r = registry();
        let raw = "0F0880FF(001234.56*kWh)(2401011200)";
        let n = r.dispatch(raw, &line("0F0880FF", "001234.56*kWh", "2401011200"));
        assert_eq!(n, 3);
        assert_eq!(r.get(0).unwrap().value(), Some(&SensorValue::Number(1234.56)));
        assert_eq!(r.get(1).unwrap().value(), Some(&SensorValue::Text(raw.to_string())));
        assert_eq!(r.get(2).unwrap().value(), Some(&SensorValue::Text("2401011200".to_string())));
        assert!(!r.get(3).unwrap().has_value());
        assert_eq!(r.first_without_value().unwrap().name, "voltage");
    }

    #[test]
    fn test_dispatch_unknown_obis() {
        let mut r = registry();
        assert_eq!(r.dispatch("1.8.0(1)", &line("1.8.0", "1", "")), 0);
        assert!(r.iter().all(|s| !s.has_value()));
    }

    #[test]
    fn test_dispatch_invalid_number() {
        let mut r = registry();
        let n = r.dispatch("200700FF(23a)", &line("200700FF", "23a", ""));
        assert_eq!(n, 0);
        assert!(!r.get(3).unwrap().has_value());
    }

    #[test]
    fn test_text_default_group() {
        let mut s = SensorEntry::new("id".into(), "C.1.0".into(), SensorKind::Text(TextGroup::Value1));
        s.set_from_line("C.1.0(1234)(5)", &line("C.1.0", "1234", "5")).unwrap();
        assert_eq!(s.value(), Some(&SensorValue::Text("1234".to_string())));
        s.reset();
        assert!(!s.has_value());
    }

    #[test]
    fn test_text_group_from_u8() {
        assert_eq!(TextGroup::from_u8(0), Some(TextGroup::Line));
        assert_eq!(TextGroup::from_u8(2), Some(TextGroup::Value2));
        assert_eq!(TextGroup::from_u8(3), None);
    }

    #[test]
    fn test_payload() {
        assert_eq!(SensorValue::Number(1234.56).to_payload(), "1234.56");
        assert_eq!(SensorValue::Text("abc".into()).to_payload(), "abc");
    }
}
