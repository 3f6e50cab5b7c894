//! Schema registry: clients and datatype definitions
//!
//! Records live in the document store and are immutable once created, so
//! the registry keeps read-through caches keyed by name and by id. A cache
//! entry is inserted once and never replaced; concurrent population of the
//! same record is idempotent.

use crate::alert::AlertSpec;
use crate::auth::ClientKey;
use crate::error::{BrokerError, Result};
use crate::provider::{new_id, Document, DocumentStore, Filter, FindOptions, ID_FIELD};
use crate::types::{
    Bounds, Client, ClientId, Datatype, DatatypeId, StorageKind, CLIENTS_COLLECTION,
    DATATYPES_COLLECTION,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// Definition of a datatype to register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDatatype {
    pub name: String,
    pub storage_kind: StorageKind,
    #[serde(default)]
    pub array_element_kind: Option<StorageKind>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub valid_bounds: Option<Bounds>,
    #[serde(default)]
    pub alert_spec: Option<AlertSpec>,
}

impl NewDatatype {
    pub fn new(name: impl Into<String>, storage_kind: StorageKind) -> Self {
        Self {
            name: name.into(),
            storage_kind,
            array_element_kind: None,
            unit: None,
            valid_bounds: None,
            alert_spec: None,
        }
    }

    /// Array datatype holding `element` values
    pub fn array(name: impl Into<String>, element: StorageKind) -> Self {
        Self {
            array_element_kind: Some(element),
            ..Self::new(name, StorageKind::Array)
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_bounds(mut self, low: Option<f64>, high: Option<f64>) -> Self {
        self.valid_bounds = Some(Bounds::new(low, high));
        self
    }

    pub fn with_alert_spec(mut self, spec: AlertSpec) -> Self {
        self.alert_spec = Some(spec);
        self
    }
}

/// Non-fatal findings reported by a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaWarning {
    /// The new name resembles an existing one, likely a typo
    SimilarName { name: String, existing: String },
    /// A numeric constraint was dropped from a textual datatype
    IgnoredConstraint { name: String, constraint: String },
}

/// Result of a successful registration
#[derive(Debug, Clone)]
pub struct Registered<Id> {
    pub id: Id,
    pub warnings: Vec<SchemaWarning>,
}

/// Registry of clients and datatypes over a document store
pub struct SchemaRegistry {
    store: Arc<dyn DocumentStore>,
    clients_by_name: RwLock<HashMap<String, Arc<Client>>>,
    clients_by_id: RwLock<HashMap<ClientId, Arc<Client>>>,
    datatypes_by_name: RwLock<HashMap<String, Arc<Datatype>>>,
    datatypes_by_id: RwLock<HashMap<DatatypeId, Arc<Datatype>>>,
}

fn lock_err<E: std::fmt::Display>(e: E) -> BrokerError {
    BrokerError::Storage(format!("Schema registry lock poisoned: {}", e))
}

/// Insert-once: keep whatever is already cached under `key`
fn cache_once<K: Eq + Hash, V>(map: &RwLock<HashMap<K, Arc<V>>>, key: K, value: Arc<V>) -> Result<Arc<V>> {
    let mut map = map.write().map_err(lock_err)?;
    Ok(map.entry(key).or_insert(value).clone())
}

fn cached<K: Eq + Hash, V>(map: &RwLock<HashMap<K, Arc<V>>>, key: &K) -> Result<Option<Arc<V>>> {
    let map = map.read().map_err(lock_err)?;
    Ok(map.get(key).cloned())
}

/// Names become resource path segments and `data.{client}.{datatype}`
/// collection segments, so neither separator may appear in them
fn check_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains(['/', '.'])
        || name.chars().any(char::is_whitespace)
    {
        return Err(BrokerError::InvalidSchema {
            name: name.to_string(),
            reason: "names must be non-empty without '/', '.' or whitespace".to_string(),
        });
    }
    Ok(())
}

/// Existing names matching `name` case-insensitively as a substring
pub fn similar_names<'a>(name: &str, existing: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let lower = name.to_lowercase();
    existing
        .into_iter()
        .filter(|other| *other != name)
        .filter(|other| {
            let other = other.to_lowercase();
            other.contains(&lower) || lower.contains(&other)
        })
        .map(str::to_string)
        .collect()
}

impl SchemaRegistry {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            clients_by_name: RwLock::new(HashMap::new()),
            clients_by_id: RwLock::new(HashMap::new()),
            datatypes_by_name: RwLock::new(HashMap::new()),
            datatypes_by_id: RwLock::new(HashMap::new()),
        }
    }

    /// Declare the unique name indexes; call once before registering
    pub async fn init(&self) -> Result<()> {
        self.store.ensure_unique(CLIENTS_COLLECTION, "name").await?;
        self.store.ensure_unique(DATATYPES_COLLECTION, "name").await?;
        Ok(())
    }

    /// The backing document store
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Register a client with its PEM-encoded public key
    pub async fn register_client(
        &self,
        name: &str,
        public_key: &str,
    ) -> Result<Registered<ClientId>> {
        check_name(name)?;
        ClientKey::from_pem(public_key).map_err(|e| BrokerError::InvalidSchema {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let existing = self.list_clients().await?;
        let warnings = similar_warnings(name, existing.iter().map(|c| c.name.as_str()));

        let client = Client {
            id: ClientId(new_id()),
            name: name.to_string(),
            public_key: public_key.to_string(),
            registered_at: Utc::now(),
        };
        self.insert_record(CLIENTS_COLLECTION, &client.id.0, &client, name)
            .await?;

        tracing::info!(client = %name, id = %client.id, "Client registered");
        let id = client.id.clone();
        self.cache_client(client)?;
        Ok(Registered { id, warnings })
    }

    /// Validate and register a datatype definition
    pub async fn register_datatype(&self, def: NewDatatype) -> Result<Registered<DatatypeId>> {
        let (def, mut warnings) = validate_datatype(def)?;

        let existing = self.list_datatypes().await?;
        warnings.extend(similar_warnings(
            &def.name,
            existing.iter().map(|d| d.name.as_str()),
        ));

        let datatype = Datatype {
            id: DatatypeId(new_id()),
            name: def.name,
            storage_kind: def.storage_kind,
            array_element_kind: def.array_element_kind,
            unit: def.unit,
            valid_bounds: def.valid_bounds,
            alert_spec: def.alert_spec,
        };
        self.insert_record(DATATYPES_COLLECTION, &datatype.id.0, &datatype, &datatype.name)
            .await?;

        tracing::info!(
            datatype = %datatype.name,
            kind = %datatype.storage_kind,
            alerting = datatype.alert_spec.is_some(),
            "Datatype registered"
        );
        let id = datatype.id.clone();
        self.cache_datatype(datatype)?;
        Ok(Registered { id, warnings })
    }

    /// Resolve a client by name, falling back to id
    pub async fn lookup_client(&self, name_or_id: &str) -> Result<Arc<Client>> {
        if let Some(client) = cached(&self.clients_by_name, &name_or_id.to_string())? {
            return Ok(client);
        }
        if let Some(client) = cached(&self.clients_by_id, &ClientId(name_or_id.to_string()))? {
            return Ok(client);
        }

        match self.find_record::<Client>(CLIENTS_COLLECTION, name_or_id).await? {
            Some(client) => self.cache_client(client),
            None => Err(BrokerError::UnknownClient(name_or_id.to_string())),
        }
    }

    /// Resolve a datatype by name, falling back to id
    pub async fn lookup_datatype(&self, name_or_id: &str) -> Result<Arc<Datatype>> {
        if let Some(dt) = cached(&self.datatypes_by_name, &name_or_id.to_string())? {
            return Ok(dt);
        }
        if let Some(dt) = cached(&self.datatypes_by_id, &DatatypeId(name_or_id.to_string()))? {
            return Ok(dt);
        }

        match self.find_record::<Datatype>(DATATYPES_COLLECTION, name_or_id).await? {
            Some(dt) => self.cache_datatype(dt),
            None => Err(BrokerError::UnknownDatatype(name_or_id.to_string())),
        }
    }

    /// All registered clients, sorted by name
    pub async fn list_clients(&self) -> Result<Vec<Arc<Client>>> {
        let mut clients = self
            .all_records::<Client>(CLIENTS_COLLECTION)
            .await?
            .into_iter()
            .map(|c| self.cache_client(c))
            .collect::<Result<Vec<_>>>()?;
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clients)
    }

    /// All registered datatypes, sorted by name
    pub async fn list_datatypes(&self) -> Result<Vec<Arc<Datatype>>> {
        let mut datatypes = self
            .all_records::<Datatype>(DATATYPES_COLLECTION)
            .await?
            .into_iter()
            .map(|d| self.cache_datatype(d))
            .collect::<Result<Vec<_>>>()?;
        datatypes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(datatypes)
    }

    fn cache_client(&self, client: Client) -> Result<Arc<Client>> {
        let client = cache_once(&self.clients_by_name, client.name.clone(), Arc::new(client))?;
        cache_once(&self.clients_by_id, client.id.clone(), client.clone())
    }

    fn cache_datatype(&self, datatype: Datatype) -> Result<Arc<Datatype>> {
        let datatype = cache_once(&self.datatypes_by_name, datatype.name.clone(), Arc::new(datatype))?;
        cache_once(&self.datatypes_by_id, datatype.id.clone(), datatype.clone())
    }

    async fn insert_record<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        record: &T,
        name: &str,
    ) -> Result<()> {
        let mut doc: Document = match serde_json::to_value(record)? {
            serde_json::Value::Object(map) => map,
            _ => return Err(BrokerError::Storage("record must serialize to an object".into())),
        };
        doc.insert(ID_FIELD.to_string(), serde_json::Value::String(id.to_string()));

        match self.store.insert_one(collection, doc).await {
            Ok(_) => Ok(()),
            Err(BrokerError::DuplicateKey { .. }) => Err(BrokerError::DuplicateName(name.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn find_record<T: for<'de> Deserialize<'de>>(
        &self,
        collection: &str,
        name_or_id: &str,
    ) -> Result<Option<T>> {
        for field in ["name", ID_FIELD] {
            let filter = Filter::all().eq(field, name_or_id);
            let options = FindOptions {
                limit: Some(1),
                ..Default::default()
            };
            if let Some(doc) = self.store.find(collection, &filter, &options).await?.pop() {
                return Ok(Some(serde_json::from_value(serde_json::Value::Object(doc))?));
            }
        }
        Ok(None)
    }

    async fn all_records<T: for<'de> Deserialize<'de>>(&self, collection: &str) -> Result<Vec<T>> {
        self.store
            .find(collection, &Filter::all(), &FindOptions::default())
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(serde_json::Value::Object(doc)).map_err(Into::into))
            .collect()
    }
}

fn similar_warnings<'a>(name: &str, existing: impl IntoIterator<Item = &'a str>) -> Vec<SchemaWarning> {
    similar_names(name, existing)
        .into_iter()
        .map(|existing| {
            tracing::warn!(
                name = %name,
                existing = %existing,
                "Registering a name similar to an existing one"
            );
            SchemaWarning::SimilarName {
                name: name.to_string(),
                existing,
            }
        })
        .collect()
}

/// Check a datatype definition, dropping numeric constraints from textual kinds
fn validate_datatype(mut def: NewDatatype) -> Result<(NewDatatype, Vec<SchemaWarning>)> {
    check_name(&def.name)?;
    let name = def.name.clone();
    let invalid = |reason: String| BrokerError::InvalidSchema {
        name: name.clone(),
        reason,
    };

    let scalar_kind = match (def.storage_kind, def.array_element_kind) {
        (StorageKind::Array, None) => {
            return Err(invalid("array datatypes require an array element kind".into()))
        }
        (StorageKind::Array, Some(StorageKind::Array)) => {
            return Err(invalid("nested arrays are not supported".into()))
        }
        (StorageKind::Array, Some(element)) => element,
        (kind, Some(_)) => {
            return Err(invalid(format!(
                "array element kind is only valid for arrays, not {}",
                kind
            )))
        }
        (kind, None) => kind,
    };

    let mut warnings = Vec::new();
    if scalar_kind == StorageKind::String {
        for (constraint, present) in [
            ("valid_bounds", def.valid_bounds.take().is_some()),
            ("alert_spec", def.alert_spec.take().is_some()),
        ] {
            if present {
                tracing::warn!(
                    datatype = %def.name,
                    constraint,
                    "Ignoring numeric constraint on a string datatype"
                );
                warnings.push(SchemaWarning::IgnoredConstraint {
                    name: def.name.clone(),
                    constraint: constraint.to_string(),
                });
            }
        }
        return Ok((def, warnings));
    }

    if let Some(bounds) = &def.valid_bounds {
        if !bounds.is_ordered() {
            return Err(invalid(format!("valid bounds {} are inverted", bounds)));
        }
    }

    if let Some(spec) = &def.alert_spec {
        spec.validate(&def.name)?;

        if def.storage_kind == StorageKind::Array && spec.array_treatment.is_none() {
            return Err(invalid("array datatypes require an array treatment".into()));
        }

        if let Some(bounds) = &def.valid_bounds {
            if let Some(thresholds) = &spec.absolute_thresholds {
                let inside = [thresholds.low, thresholds.high]
                    .into_iter()
                    .flatten()
                    .all(|v| bounds.contains(v));
                if !inside {
                    return Err(invalid(format!(
                        "absolute thresholds {} lie outside valid bounds {}",
                        thresholds, bounds
                    )));
                }
            }
            if let Some(groups) = &spec.interval_groups {
                if let Some(group) = groups
                    .iter()
                    .find(|g| !bounds.contains(g.low) || !bounds.contains(g.high))
                {
                    return Err(invalid(format!(
                        "alert interval ({}, {}) lies outside valid bounds {}",
                        group.low, group.high, bounds
                    )));
                }
            }
        }
    }

    Ok((def, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::ArrayTreatment;
    use crate::auth::tests::test_key;
    use crate::provider::memory::MemoryStore;

    async fn test_registry() -> SchemaRegistry {
        let reg = SchemaRegistry::new(Arc::new(MemoryStore::new()));
        reg.init().await.unwrap();
        reg
    }

    fn pem() -> String {
        test_key(0x11).public_pem()
    }

    #[tokio::test]
    async fn test_register_and_lookup_client() {
        let reg = test_registry().await;
        let registered = reg.register_client("sensorA", &pem()).await.unwrap();
        assert!(registered.warnings.is_empty());

        let by_name = reg.lookup_client("sensorA").await.unwrap();
        let by_id = reg.lookup_client(registered.id.as_str()).await.unwrap();
        assert_eq!(by_name.id, registered.id);
        assert!(Arc::ptr_eq(&by_name, &by_id));
    }

    #[tokio::test]
    async fn test_duplicate_client_name() {
        let reg = test_registry().await;
        reg.register_client("sensorA", &pem()).await.unwrap();

        let err = reg.register_client("sensorA", &pem()).await.unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateName(ref n) if n == "sensorA"));
        assert_eq!(reg.list_clients().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_client_key_rejected() {
        let reg = test_registry().await;
        let err = reg.register_client("sensorA", "not a key").await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidSchema { .. }));
    }

    #[tokio::test]
    async fn test_names_cannot_alias_collections() {
        let reg = test_registry().await;

        for name in ["a.b", "", "a/b", "a b"] {
            let err = reg.register_client(name, &pem()).await.unwrap_err();
            assert!(matches!(err, BrokerError::InvalidSchema { .. }), "{:?}", name);
        }
        let err = reg
            .register_datatype(NewDatatype::new("b.c", StorageKind::Number))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidSchema { ref reason, .. } if reason.contains("'.'")));

        // Only the unambiguous halves register
        reg.register_client("a", &pem()).await.unwrap();
        reg
            .register_datatype(NewDatatype::new("c", StorageKind::Number))
            .await
            .unwrap();
        assert_eq!(reg.list_clients().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_similar_name_warns_but_registers() {
        let reg = test_registry().await;
        reg.register_client("sensor", &pem()).await.unwrap();

        let registered = reg.register_client("Sensor1", &pem()).await.unwrap();
        assert_eq!(
            registered.warnings,
            vec![SchemaWarning::SimilarName {
                name: "Sensor1".into(),
                existing: "sensor".into(),
            }]
        );
        assert_eq!(reg.list_clients().await.unwrap().len(), 2);
    }

    #[test]
    fn test_similar_names() {
        let existing = ["temp", "pressure_1", "volts"];
        assert_eq!(similar_names("Temperature", existing), vec!["temp"]);
        assert_eq!(similar_names("pressure", existing), vec!["pressure_1"]);
        assert!(similar_names("humidity", existing).is_empty());
        assert!(similar_names("temp", existing).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_lookups() {
        let reg = test_registry().await;
        assert!(matches!(
            reg.lookup_client("ghost").await.unwrap_err(),
            BrokerError::UnknownClient(_)
        ));
        assert!(matches!(
            reg.lookup_datatype("ghost").await.unwrap_err(),
            BrokerError::UnknownDatatype(_)
        ));
    }

    #[tokio::test]
    async fn test_bound_pairs() {
        let reg = test_registry().await;
        let err = reg
            .register_datatype(NewDatatype::new("a", StorageKind::Number).with_bounds(Some(5.0), Some(1.0)))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidSchema { .. }));

        reg.register_datatype(NewDatatype::new("b", StorageKind::Number).with_bounds(Some(0.0), None))
            .await
            .unwrap();
        reg.register_datatype(NewDatatype::new("c", StorageKind::Number).with_bounds(None, Some(100.0)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_array_rules() {
        let reg = test_registry().await;

        let missing_element = NewDatatype::new("volts", StorageKind::Array);
        assert!(reg.register_datatype(missing_element).await.is_err());

        let nested = NewDatatype::array("volts", StorageKind::Array);
        assert!(reg.register_datatype(nested).await.is_err());

        let no_treatment = NewDatatype::array("volts", StorageKind::Number)
            .with_alert_spec(AlertSpec::thresholds(None, Some(5.0)));
        let err = reg.register_datatype(no_treatment).await.unwrap_err();
        assert!(err.to_string().contains("array treatment"));

        let ok = NewDatatype::array("volts", StorageKind::Number).with_alert_spec(
            AlertSpec::intervals([(-4.2, 4.2)]).with_array_treatment(ArrayTreatment::Individually),
        );
        reg.register_datatype(ok).await.unwrap();

        let stray_element = NewDatatype {
            array_element_kind: Some(StorageKind::Number),
            ..NewDatatype::new("temp", StorageKind::Number)
        };
        assert!(reg.register_datatype(stray_element).await.is_err());
    }

    #[tokio::test]
    async fn test_thresholds_must_lie_within_bounds() {
        let reg = test_registry().await;

        let outside = NewDatatype::new("level", StorageKind::Number)
            .with_bounds(Some(0.0), Some(100.0))
            .with_alert_spec(AlertSpec::thresholds(Some(-5.0), Some(50.0)));
        assert!(reg.register_datatype(outside).await.is_err());

        let interval_outside = NewDatatype::new("level", StorageKind::Number)
            .with_bounds(Some(-6.0), Some(6.0))
            .with_alert_spec(AlertSpec::intervals([(-7.0, 4.2)]));
        assert!(reg.register_datatype(interval_outside).await.is_err());

        let inside = NewDatatype::new("level", StorageKind::Number)
            .with_bounds(Some(0.0), Some(100.0))
            .with_alert_spec(AlertSpec::thresholds(Some(10.0), Some(50.0)));
        reg.register_datatype(inside).await.unwrap();
    }

    #[tokio::test]
    async fn test_string_constraints_ignored_with_warning() {
        let reg = test_registry().await;
        let def = NewDatatype::new("location", StorageKind::String)
            .with_bounds(Some(0.0), Some(1.0))
            .with_alert_spec(AlertSpec::thresholds(None, Some(1.0)));

        let registered = reg.register_datatype(def).await.unwrap();
        assert_eq!(registered.warnings.len(), 2);

        let dt = reg.lookup_datatype("location").await.unwrap();
        assert!(dt.valid_bounds.is_none());
        assert!(dt.alert_spec.is_none());
    }

    #[tokio::test]
    async fn test_lookup_reads_through_store() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let writer = SchemaRegistry::new(store.clone());
        writer.init().await.unwrap();
        writer
            .register_datatype(NewDatatype::new("temp", StorageKind::Number).with_unit("C"))
            .await
            .unwrap();

        // Fresh registry over the same store starts with empty caches
        let reader = SchemaRegistry::new(store);
        let dt = reader.lookup_datatype("temp").await.unwrap();
        assert_eq!(dt.unit.as_deref(), Some("C"));
        assert_eq!(reader.list_datatypes().await.unwrap().len(), 1);
    }
}
