//! Read-side queries over stored data
//!
//! Filter bodies are JSON objects with optional keys:
//!
//! - `nd` / `nodata`: truthy to skip the data entirely; the keys below are
//!   then ignored
//! - `d` / `datatype`: restrict to one datatype
//! - `t` / `time`: `[start|null, end|null]`, inclusive, swapped when inverted

use crate::error::{BrokerError, Result};
use crate::provider::{DocumentStore, Filter, FindOptions};
use crate::schema::SchemaRegistry;
use crate::timestamp::TimeRange;
use crate::types::{data_collection, StoredValue};
use serde_json::{Map, Value};

/// Parsed read filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadParams {
    pub no_data: bool,
    pub datatype: Option<String>,
    pub range: TimeRange,
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// First truthy value among the aliases
fn param<'a>(obj: &'a Map<String, Value>, short: &str, long: &str) -> Option<&'a Value> {
    [short, long]
        .into_iter()
        .filter_map(|key| obj.get(key))
        .find(|v| truthy(v))
}

fn parse_object(body: &[u8]) -> Result<Option<Map<String, Value>>> {
    if body.is_empty() {
        return Ok(None);
    }
    match serde_json::from_slice(body) {
        Ok(Value::Object(obj)) => Ok(Some(obj)),
        _ => Err(BrokerError::BadPayloadFormat("Bad JSON format".into())),
    }
}

fn range_param(obj: &Map<String, Value>) -> Result<TimeRange> {
    match param(obj, "t", "time") {
        None => Ok(TimeRange::default()),
        Some(range) => TimeRange::from_json(range),
    }
}

impl ReadParams {
    /// Parse a (decompressed) filter body; empty means no filter
    pub fn parse(body: &[u8]) -> Result<Self> {
        let obj = match parse_object(body)? {
            Some(obj) => obj,
            None => return Ok(Self::default()),
        };

        let no_data = param(&obj, "nd", "nodata").is_some();
        if no_data {
            // Nothing is read, so the remaining keys are not looked at
            return Ok(Self {
                no_data,
                ..Self::default()
            });
        }

        let datatype = match param(&obj, "d", "datatype") {
            None => None,
            Some(Value::String(name)) => Some(name.clone()),
            Some(other) => {
                return Err(BrokerError::InvalidData(format!(
                    "Datatype filter {} must be a string",
                    other
                )))
            }
        };

        Ok(Self {
            no_data,
            datatype,
            range: range_param(&obj)?,
        })
    }

    /// Only the time range of a filter body; other keys are ignored
    pub fn parse_range(body: &[u8]) -> Result<TimeRange> {
        match parse_object(body)? {
            Some(obj) => range_param(&obj),
            None => Ok(TimeRange::default()),
        }
    }
}

/// Values of one (client, datatype) pair within `range`, oldest first
pub async fn read_pair(
    store: &dyn DocumentStore,
    client: &str,
    datatype: &str,
    range: &TimeRange,
) -> Result<Vec<Value>> {
    let (start, end) = range.as_epoch_secs();
    let filter = match (start, end) {
        (None, None) => Filter::all(),
        _ => Filter::all().between("t", start, end),
    };

    store
        .find(
            &data_collection(client, datatype),
            &filter,
            &FindOptions::oldest_first("t"),
        )
        .await?
        .into_iter()
        .map(|doc| -> Result<Value> {
            // Normalize through the typed shape so stray fields never leak
            let stored: StoredValue = serde_json::from_value(Value::Object(doc))?;
            Ok(serde_json::to_value(stored)?)
        })
        .collect()
}

/// `{datatype: [...]}` for one client; datatypes without data are omitted
/// unless explicitly requested
pub async fn client_data(
    registry: &SchemaRegistry,
    client: &str,
    params: &ReadParams,
) -> Result<Map<String, Value>> {
    let names = match &params.datatype {
        Some(name) => vec![registry.lookup_datatype(name).await?.name.clone()],
        None => registry
            .list_datatypes()
            .await?
            .iter()
            .map(|d| d.name.clone())
            .collect(),
    };

    let mut data = Map::new();
    for name in names {
        let values = read_pair(registry.store().as_ref(), client, &name, &params.range).await?;
        if !values.is_empty() || params.datatype.is_some() {
            data.insert(name, Value::Array(values));
        }
    }
    Ok(data)
}

/// `{client: [...]}` for one datatype; clients without data are omitted
pub async fn datatype_data(
    registry: &SchemaRegistry,
    datatype: &str,
    range: &TimeRange,
) -> Result<Map<String, Value>> {
    let mut data = Map::new();
    for client in registry.list_clients().await? {
        let values = read_pair(registry.store().as_ref(), &client.name, datatype, range).await?;
        if !values.is_empty() {
            data.insert(client.name.clone(), Value::Array(values));
        }
    }
    Ok(data)
}

/// `{client: {datatype: [...]}}` over every registered client
pub async fn all_data(registry: &SchemaRegistry, range: &TimeRange) -> Result<Map<String, Value>> {
    let datatypes = registry.list_datatypes().await?;
    let mut data = Map::new();
    for client in registry.list_clients().await? {
        let mut per_type = Map::new();
        for datatype in &datatypes {
            let values =
                read_pair(registry.store().as_ref(), &client.name, &datatype.name, range).await?;
            if !values.is_empty() {
                per_type.insert(datatype.name.clone(), Value::Array(values));
            }
        }
        data.insert(client.name.clone(), Value::Object(per_type));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryStore;
    use crate::provider::Document;
    use serde_json::json;

    #[test]
    fn test_parse_empty_and_aliases() {
        assert_eq!(ReadParams::parse(b"").unwrap(), ReadParams::default());

        let p = ReadParams::parse(br#"{"nodata": 1, "datatype": "temp"}"#).unwrap();
        assert!(p.no_data);
        assert_eq!(p.datatype, None);

        let p = ReadParams::parse(br#"{"datatype": "temp"}"#).unwrap();
        assert_eq!(p.datatype.as_deref(), Some("temp"));

        let p = ReadParams::parse(br#"{"nd": false, "t": [200, 100]}"#).unwrap();
        assert!(!p.no_data);
        assert_eq!(p.range.as_epoch_secs(), (Some(100), Some(200)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ReadParams::parse(b"[1, 2]"),
            Err(BrokerError::BadPayloadFormat(_))
        ));
        assert!(matches!(
            ReadParams::parse(b"{oops"),
            Err(BrokerError::BadPayloadFormat(_))
        ));
        assert!(ReadParams::parse(br#"{"t": [1]}"#).is_err());

        // Filters that would be rejected are ignored once data is skipped
        let p = ReadParams::parse(br#"{"nd": 1, "t": [1], "d": 7}"#).unwrap();
        assert_eq!(
            p,
            ReadParams {
                no_data: true,
                ..Default::default()
            }
        );

        // Range-only reads keep the range whatever `nd` says
        let range = ReadParams::parse_range(br#"{"nd": 1, "t": [200, 100]}"#).unwrap();
        assert_eq!(range.as_epoch_secs(), (Some(100), Some(200)));
        assert!(ReadParams::parse_range(br#"{"nd": 1, "t": [1]}"#).is_err());
        assert_eq!(ReadParams::parse_range(b"").unwrap(), TimeRange::default());
        assert!(ReadParams::parse(br#"{"d": 5}"#).is_err());
    }

    #[tokio::test]
    async fn test_read_pair_range() {
        let store = MemoryStore::new();
        for (id, t) in [("a", 300), ("b", 100), ("c", 200)] {
            let doc: Document = json!({"_id": id, "v": 1.5, "t": t}).as_object().cloned().unwrap();
            store.insert_one("data.c0.temp", doc).await.unwrap();
        }

        let all = read_pair(&store, "c0", "temp", &TimeRange::default()).await.unwrap();
        let times: Vec<i64> = all.iter().map(|v| v["t"].as_i64().unwrap()).collect();
        assert_eq!(times, vec![100, 200, 300]);

        let range = TimeRange::from_json(&json!([null, 200])).unwrap();
        let some = read_pair(&store, "c0", "temp", &range).await.unwrap();
        assert_eq!(some.len(), 2);
        assert_eq!(some[0], json!({"_id": "b", "v": 1.5, "t": 100}));

        assert!(read_pair(&store, "c0", "volts", &range).await.unwrap().is_empty());
    }
}
