use std::fmt;

use serde::{Deserialize, Serialize};

/// Raw integer read from a payload before the field's fixed-point scale is applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PointValue {
    U8(u8),
    I16(i16),
    U16(u16),
    U32(u32),
}

impl PointValue {
    pub fn as_f64(self) -> f64 {
        match self {
            PointValue::U8(v) => f64::from(v),
            PointValue::I16(v) => f64::from(v),
            PointValue::U16(v) => f64::from(v),
            PointValue::U32(v) => f64::from(v),
        }
    }
}

/// A decoded field value: numeric telemetry or an identity string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Number(_) => None,
            FieldValue::Text(v) => Some(v),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(v) => write!(f, "{v}"),
            FieldValue::Text(v) => f.write_str(v),
        }
    }
}

/// Identity of one inverter on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub address: u8,
    pub variant: u8,
}

/// One value handed to the downstream sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub device: DeviceIdentity,
    pub field: String,
    pub value: FieldValue,
    pub unit: String,
    pub collected_at_ms: u64,
}
