//! Ingestion pipeline: validate and persist one data point
//!
//! Validation runs in a fixed order: client, required fields, timestamp,
//! datatype, value kind, bounds, then a non-fatal clock desync check.
//! Alert evaluation is left to the caller; an insert never depends on it.

use crate::alert::HistorySource;
use crate::error::{BrokerError, Result};
use crate::provider::{new_id, Document, DocumentStore, Filter, FindOptions};
use crate::schema::SchemaRegistry;
use crate::timestamp::RawTimestamp;
use crate::types::{
    data_collection, DataPoint, DataPointId, DataValue, Datatype, StorageKind, StoredValue,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;

/// One decoded write item, before validation against its datatype
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    pub name: String,
    pub value: Value,
    pub time: RawTimestamp,
}

fn field<'a>(obj: &'a serde_json::Map<String, Value>, short: &str, long: &str) -> Result<&'a Value> {
    obj.get(short)
        .or_else(|| obj.get(long))
        .ok_or_else(|| BrokerError::InvalidData(format!("Missing '{}' or '{}'", short, long)))
}

impl DataItem {
    /// Decode `{n|name, v|value, t|time}`
    pub fn from_json(item: &Value) -> Result<Self> {
        let obj = item
            .as_object()
            .ok_or_else(|| BrokerError::InvalidData("Bad JSON format".into()))?;

        let name = match field(obj, "n", "name")? {
            Value::String(name) => name.clone(),
            other => {
                return Err(BrokerError::InvalidData(format!(
                    "Datatype name {} must be a string",
                    other
                )))
            }
        };
        let value = field(obj, "v", "value")?.clone();
        let time = RawTimestamp::from_json(field(obj, "t", "time")?)?;

        Ok(Self { name, value, time })
    }
}

/// Validates and stores data points
pub struct IngestPipeline {
    registry: Arc<SchemaRegistry>,
    max_ahead: Duration,
    max_behind: Duration,
}

impl IngestPipeline {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            max_ahead: Duration::minutes(15),
            max_behind: Duration::hours(24),
        }
    }

    /// Tolerated clock skew before a desync warning is logged
    pub fn with_desync_window(mut self, max_ahead: Duration, max_behind: Duration) -> Self {
        self.max_ahead = max_ahead;
        self.max_behind = max_behind;
        self
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Validate `item` for `client_ref` (name or id) and persist it
    pub async fn insert(&self, client_ref: &str, item: &Value) -> Result<DataPoint> {
        let client = self
            .registry
            .lookup_client(client_ref)
            .await
            .map_err(|e| match e {
                BrokerError::UnknownClient(name) => BrokerError::InvalidClient(name),
                other => other,
            })?;

        let item = DataItem::from_json(item)?;
        let timestamp = item.time.resolve()?;

        let datatype = self
            .registry
            .lookup_datatype(&item.name)
            .await
            .map_err(|e| match e {
                BrokerError::UnknownDatatype(name) => {
                    BrokerError::InvalidData(format!("Unknown datatype '{}'", name))
                }
                other => other,
            })?;

        let value = DataValue::from_json(&item.value)?;
        check_kind(&datatype, &value)?;
        check_bounds(&datatype, &value)?;
        self.check_desync(&client.name, &datatype.name, timestamp);

        let point = DataPoint {
            id: DataPointId(new_id()),
            client: client.name.clone(),
            datatype: datatype.name.clone(),
            value,
            timestamp,
        };

        let doc: Document = match serde_json::to_value(StoredValue::from(&point))? {
            Value::Object(doc) => doc,
            _ => return Err(BrokerError::Storage("stored value must be an object".into())),
        };
        self.registry
            .store()
            .insert_one(&data_collection(&point.client, &point.datatype), doc)
            .await?;

        tracing::debug!(
            client = %point.client,
            datatype = %point.datatype,
            id = %point.id,
            "Data point stored"
        );
        Ok(point)
    }

    /// Stored values preceding `point` in its pair
    pub fn history_for(&self, point: &DataPoint) -> StoredHistory {
        StoredHistory {
            store: self.registry.store().clone(),
            collection: data_collection(&point.client, &point.datatype),
            exclude: point.id.clone(),
            until: point.timestamp.timestamp(),
        }
    }

    fn check_desync(&self, client: &str, datatype: &str, timestamp: DateTime<Utc>) {
        let now = Utc::now();
        if timestamp > now + self.max_ahead {
            tracing::warn!(
                client = %client,
                datatype = %datatype,
                ahead_secs = (timestamp - now).num_seconds(),
                "Client clock ahead of broker"
            );
        } else if timestamp < now - self.max_behind {
            tracing::warn!(
                client = %client,
                datatype = %datatype,
                behind_secs = (now - timestamp).num_seconds(),
                "Client clock behind broker"
            );
        }
    }
}

fn check_kind(datatype: &Datatype, value: &DataValue) -> Result<()> {
    if value.kind() != datatype.storage_kind {
        return Err(BrokerError::InvalidData(format!(
            "Datatype '{}' expects {}, got {}",
            datatype.name,
            datatype.storage_kind,
            value.kind()
        )));
    }

    if let DataValue::Array(items) = value {
        if items.is_empty() {
            return Err(BrokerError::InvalidData(format!(
                "Empty array for datatype '{}'",
                datatype.name
            )));
        }
        let expected = datatype.scalar_kind();
        if let Some((i, item)) = items.iter().enumerate().find(|(_, s)| s.kind() != expected) {
            return Err(BrokerError::InvalidData(format!(
                "Datatype '{}' expects {} elements, element {} is {}",
                datatype.name,
                expected,
                i,
                item.kind()
            )));
        }
    }
    Ok(())
}

fn check_bounds(datatype: &Datatype, value: &DataValue) -> Result<()> {
    let bounds = match &datatype.valid_bounds {
        Some(bounds) if datatype.scalar_kind() == StorageKind::Number => bounds,
        _ => return Ok(()),
    };

    let numbers: Vec<f64> = match value {
        DataValue::Number(n) => vec![*n],
        DataValue::Array(items) => items.iter().filter_map(|s| s.as_number()).collect(),
        DataValue::Text(_) => Vec::new(),
    };

    match numbers.into_iter().find(|n| !bounds.contains(*n)) {
        Some(out) => Err(BrokerError::InvalidData(format!(
            "Value {} outside valid bounds {} of datatype '{}'",
            out, bounds, datatype.name
        ))),
        None => Ok(()),
    }
}

/// History of one (client, datatype) pair read from the store
///
/// Only points that precede the evaluated one count: earlier timestamps, or
/// the same timestamp inserted before it. Later rows of the same batch never
/// leak into its window.
pub struct StoredHistory {
    store: Arc<dyn DocumentStore>,
    collection: String,
    exclude: DataPointId,
    until: i64,
}

impl StoredHistory {
    fn decode(doc: Document) -> Result<StoredValue> {
        Ok(serde_json::from_value(Value::Object(doc))?)
    }
}

#[async_trait]
impl HistorySource for StoredHistory {
    async fn recent(&self, limit: usize) -> Result<Vec<DataValue>> {
        // Same-second rows in insertion order; keep those before the point
        let same_second = self
            .store
            .find(
                &self.collection,
                &Filter::all().between("t", Some(self.until), Some(self.until)),
                &FindOptions::oldest_first("t"),
            )
            .await?;
        let mut tied = Vec::new();
        for doc in same_second {
            let stored = Self::decode(doc)?;
            if stored.id == self.exclude {
                break;
            }
            tied.push(stored.value);
        }

        let mut values: Vec<DataValue> = tied.into_iter().rev().take(limit).collect();
        if values.len() < limit {
            let older = self
                .store
                .find(
                    &self.collection,
                    &Filter::all().between("t", None, Some(self.until - 1)),
                    &FindOptions::newest("t", limit - values.len()),
                )
                .await?;
            for doc in older {
                values.push(Self::decode(doc)?.value);
            }
        }
        Ok(values)
    }
}
