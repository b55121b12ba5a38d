use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("topic has fewer than 4 segments")]
    TopicTooShort,
    #[error("topic root {0:?} does not match")]
    WrongRoot(String),
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
    #[error("tele topic is missing the field segment")]
    MissingField,
    #[error("unknown tele field {0:?}")]
    UnknownField(String),
    #[error("payload is not numeric")]
    NonNumeric,
    #[error("state payload is not a JSON object")]
    NotAnObject,
    #[error("event payload has no name")]
    MissingEventName,
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] simd_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Tele,
    State,
    Event,
}

impl FromStr for MessageKind {
    type Err = DecodeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "tele" => Ok(MessageKind::Tele),
            "state" => Ok(MessageKind::State),
            "event" => Ok(MessageKind::Event),
            other => Err(DecodeError::UnknownKind(other.to_string())),
        }
    }
}

/// `<root>/<tenant>/<device>/<kind>/<rest...>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic<'a> {
    pub root: &'a str,
    pub tenant: &'a str,
    pub device: &'a str,
    pub kind: MessageKind,
    pub rest: Vec<&'a str>,
}

impl<'a> Topic<'a> {
    pub fn parse(expected_root: &str, topic: &'a str) -> Result<Self, DecodeError> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 4 || parts[1].is_empty() || parts[2].is_empty() {
            return Err(DecodeError::TopicTooShort);
        }
        if parts[0] != expected_root {
            return Err(DecodeError::WrongRoot(parts[0].to_string()));
        }
        Ok(Self {
            root: parts[0],
            tenant: parts[1],
            device: parts[2],
            kind: parts[3].parse()?,
            rest: parts[4..].to_vec(),
        })
    }

    /// `<root>/<tenant>/<device>`, the namespace a device is registered under.
    pub fn prefix(&self) -> String {
        format!("{}/{}/{}", self.root, self.tenant, self.device)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeleField {
    PresostatLow,
    PressureInter,
    FlowPerm,
    FlowReject,
    ConductivityPerm,
    PressureFeed,
    TemperatureFeed,
}

impl TeleField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeleField::PresostatLow => "presostat_low",
            TeleField::PressureInter => "pressure_inter",
            TeleField::FlowPerm => "flow_perm",
            TeleField::FlowReject => "flow_reject",
            TeleField::ConductivityPerm => "conductivity_perm",
            TeleField::PressureFeed => "pressure_feed",
            TeleField::TemperatureFeed => "temperature_feed",
        }
    }
}

impl fmt::Display for TeleField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TeleField {
    type Err = DecodeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "presostat_low" => Ok(TeleField::PresostatLow),
            "pressure_inter" => Ok(TeleField::PressureInter),
            "flow_perm" => Ok(TeleField::FlowPerm),
            "flow_reject" => Ok(TeleField::FlowReject),
            "conductivity_perm" => Ok(TeleField::ConductivityPerm),
            "pressure_feed" => Ok(TeleField::PressureFeed),
            "temperature_feed" => Ok(TeleField::TemperatureFeed),
            other => Err(DecodeError::UnknownField(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateUpdate {
    pub float_call: Option<f64>,
    pub valve_feed: Option<f64>,
    pub pump_low: Option<f64>,
    pub pump_high: Option<f64>,
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotUpdate {
    Tele(TeleField, f64),
    State(StateUpdate),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub name: String,
    pub payload: Value,
}

impl DeviceEvent {
    pub fn is_ack(&self) -> bool {
        self.name.eq_ignore_ascii_case("ACK")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Update(SnapshotUpdate),
    Event(DeviceEvent),
}

/// Latest known value of every tele/state field for one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub presostat_low: Option<f64>,
    pub pressure_inter: Option<f64>,
    pub flow_perm: Option<f64>,
    pub flow_reject: Option<f64>,
    pub conductivity_perm: Option<f64>,
    pub pressure_feed: Option<f64>,
    pub temperature_feed: Option<f64>,
    pub float_call: Option<f64>,
    pub valve_feed: Option<f64>,
    pub pump_low: Option<f64>,
    pub pump_high: Option<f64>,
    pub mode: Option<String>,
}

impl Snapshot {
    pub fn merge(&mut self, update: &SnapshotUpdate) {
        match update {
            SnapshotUpdate::Tele(field, value) => {
                let slot = match field {
                    TeleField::PresostatLow => &mut self.presostat_low,
                    TeleField::PressureInter => &mut self.pressure_inter,
                    TeleField::FlowPerm => &mut self.flow_perm,
                    TeleField::FlowReject => &mut self.flow_reject,
                    TeleField::ConductivityPerm => &mut self.conductivity_perm,
                    TeleField::PressureFeed => &mut self.pressure_feed,
                    TeleField::TemperatureFeed => &mut self.temperature_feed,
                };
                *slot = Some(*value);
            }
            SnapshotUpdate::State(state) => {
                let merge = |slot: &mut Option<f64>, value: Option<f64>| {
                    if value.is_some() {
                        *slot = value;
                    }
                };
                merge(&mut self.float_call, state.float_call);
                merge(&mut self.valve_feed, state.valve_feed);
                merge(&mut self.pump_low, state.pump_low);
                merge(&mut self.pump_high, state.pump_high);
                if let Some(mode) = &state.mode {
                    self.mode = Some(mode.clone());
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRow {
    pub ts: DateTime<Utc>,
    pub device_id: String,
    pub snapshot: Snapshot,
}

pub fn decode_payload(
    kind: MessageKind,
    rest: &[&str],
    payload: &mut [u8],
) -> Result<Decoded, DecodeError> {
    match kind {
        MessageKind::Tele => {
            let field: TeleField = rest.first().ok_or(DecodeError::MissingField)?.parse()?;
            let value = tele_value(&parse_json(payload)?).ok_or(DecodeError::NonNumeric)?;
            Ok(Decoded::Update(SnapshotUpdate::Tele(field, value)))
        }
        MessageKind::State => {
            let value = parse_json(payload)?;
            let Value::Object(map) = value else {
                return Err(DecodeError::NotAnObject);
            };
            let numeric = |key: &str| map.get(key).and_then(coerce_number);
            let mode = map.get("mode").and_then(|value| match value {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            Ok(Decoded::Update(SnapshotUpdate::State(StateUpdate {
                float_call: numeric("float_call"),
                valve_feed: numeric("valve_feed"),
                pump_low: numeric("pump_low"),
                pump_high: numeric("pump_high"),
                mode,
            })))
        }
        MessageKind::Event => {
            let value = parse_json(payload)?;
            let name = match value.get("name") {
                Some(Value::String(name)) => name.trim().to_string(),
                Some(other) if !other.is_null() => other.to_string(),
                _ => return Err(DecodeError::MissingEventName),
            };
            Ok(Decoded::Event(DeviceEvent {
                name,
                payload: value,
            }))
        }
    }
}

fn parse_json(payload: &mut [u8]) -> Result<Value, DecodeError> {
    Ok(simd_json::serde::from_slice(payload)?)
}

fn tele_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(_) | Value::Bool(_) => coerce_number(value),
        Value::Object(map) => map
            .get("value")
            .or_else(|| map.get("v"))
            .filter(|inner| matches!(inner, Value::Number(_) | Value::Bool(_)))
            .and_then(coerce_number),
        _ => None,
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite())
}
