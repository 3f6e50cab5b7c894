//! Core data model for the broker
//!
//! Registry records serialize with camelCase keys. Stored data points and
//! alerts use the short keys of the wire format (`_id`, `v`, `t`, `n`, `a`).

use crate::alert::AlertSpec;
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Collection holding registered clients
pub const CLIENTS_COLLECTION: &str = "client_registry";

/// Collection holding registered datatypes
pub const DATATYPES_COLLECTION: &str = "type_metadata";

/// Prefix shared by every per-(client, datatype) data collection
pub const DATA_COLLECTION_PREFIX: &str = "data.";

/// Name of the data collection for one (client, datatype) pair
pub fn data_collection(client: &str, datatype: &str) -> String {
    format!("{}{}.{}", DATA_COLLECTION_PREFIX, client, datatype)
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// Store-assigned identifier of a registered client
    ClientId
);
id_type!(
    /// Store-assigned identifier of a registered datatype
    DatatypeId
);
id_type!(
    /// Store-assigned identifier of a persisted data point
    DataPointId
);

/// Runtime kind of a stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Number,
    String,
    Array,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageKind::Number => "number",
            StorageKind::String => "string",
            StorageKind::Array => "array",
        };
        f.write_str(name)
    }
}

/// Inclusive numeric bounds, either side may be open
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
}

impl Bounds {
    pub fn new(low: Option<f64>, high: Option<f64>) -> Self {
        Self { low, high }
    }

    /// `low <= high` when both sides are set
    pub fn is_ordered(&self) -> bool {
        match (self.low, self.high) {
            (Some(low), Some(high)) => low <= high,
            _ => true,
        }
    }

    /// Whether `value` lies within `[low, high]`, unset sides being unbounded
    pub fn contains(&self, value: f64) -> bool {
        self.low.map_or(true, |low| value >= low) && self.high.map_or(true, |high| value <= high)
    }

    /// Whether every value admitted by `other` is admitted by `self`
    pub fn encloses(&self, other: &Bounds) -> bool {
        let low_ok = match (self.low, other.low) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(outer), Some(inner)) => inner >= outer,
        };
        let high_ok = match (self.high, other.high) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(outer), Some(inner)) => inner <= outer,
        };
        low_ok && high_ok
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |v: Option<f64>| v.map_or_else(|| "none".to_string(), |v| v.to_string());
        write!(f, "({}, {})", side(self.low), side(self.high))
    }
}

/// A registered device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: ClientId,

    /// Unique client name, also the namespace of its stored data
    pub name: String,

    /// PEM-encoded P-384 SubjectPublicKeyInfo used to verify writes
    pub public_key: String,

    pub registered_at: DateTime<Utc>,
}

/// A registered measurement schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datatype {
    pub id: DatatypeId,
    pub name: String,
    pub storage_kind: StorageKind,

    /// Element kind, present iff `storage_kind` is `Array`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_element_kind: Option<StorageKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_bounds: Option<Bounds>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_spec: Option<AlertSpec>,
}

impl Datatype {
    /// Kind of the scalar values (the element kind for arrays)
    pub fn scalar_kind(&self) -> StorageKind {
        match self.storage_kind {
            StorageKind::Array => self.array_element_kind.unwrap_or(StorageKind::Number),
            kind => kind,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.scalar_kind() == StorageKind::Number
    }
}

/// One array element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn kind(&self) -> StorageKind {
        match self {
            Scalar::Number(_) => StorageKind::Number,
            Scalar::Text(_) => StorageKind::String,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            Scalar::Text(_) => None,
        }
    }
}

/// A measured value, its shape decided once when decoded from the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Number(f64),
    Text(String),
    Array(Vec<Scalar>),
}

impl DataValue {
    /// Decode a JSON value, rejecting shapes no datatype can hold
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(DataValue::Number)
                .ok_or_else(|| BrokerError::InvalidData(format!("Unrepresentable number {}", n))),
            serde_json::Value::String(s) => Ok(DataValue::Text(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    serde_json::Value::Number(n) => n.as_f64().map(Scalar::Number).ok_or_else(
                        || BrokerError::InvalidData(format!("Unrepresentable number {}", n)),
                    ),
                    serde_json::Value::String(s) => Ok(Scalar::Text(s.clone())),
                    serde_json::Value::Array(_) => {
                        Err(BrokerError::InvalidData("Nested arrays are not supported".into()))
                    }
                    other => Err(BrokerError::InvalidData(format!(
                        "Unsupported array element {}",
                        other
                    ))),
                })
                .collect::<Result<Vec<_>>>()
                .map(DataValue::Array),
            other => Err(BrokerError::InvalidData(format!(
                "Unsupported value type: {}",
                other
            ))),
        }
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            DataValue::Number(_) => StorageKind::Number,
            DataValue::Text(_) => StorageKind::String,
            DataValue::Array(_) => StorageKind::Array,
        }
    }
}

/// A persisted measurement
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub id: DataPointId,
    pub client: String,
    pub datatype: String,
    pub value: DataValue,
    pub timestamp: DateTime<Utc>,
}

/// Stored shape of a data point inside its pair collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    #[serde(rename = "_id")]
    pub id: DataPointId,

    #[serde(rename = "v")]
    pub value: DataValue,

    /// Epoch seconds
    #[serde(rename = "t")]
    pub time: i64,
}

impl From<&DataPoint> for StoredValue {
    fn from(point: &DataPoint) -> Self {
        Self {
            id: point.id.clone(),
            value: point.value.clone(),
            time: point.timestamp.timestamp(),
        }
    }
}

/// An alert raised by an inserted value; never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "n")]
    pub datatype: String,

    #[serde(rename = "t", with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "a")]
    pub description: String,
}
