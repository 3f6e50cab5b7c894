//! # fog-broker
//!
//! Schema-validated ingestion, alerting, and observer notification for
//! constrained IoT clients.
//!
//! ## Overview
//!
//! `fog-broker` sits between small devices and a document store. Devices
//! register a P-384 public key, post signed and gzip-compressed batches of
//! measurements, and observe their alert resource for pushed alert batches.
//! Every measurement is validated against a registered datatype before it is
//! stored, then checked against the datatype's alert rules.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fog_broker::{Broker, BrokerConfig, NewDatatype, Request, StorageKind};
//!
//! # async fn example(device_pem: &str, sealed_body: Vec<u8>) -> fog_broker::Result<()> {
//! let broker = Broker::open(BrokerConfig::default()).await?;
//! broker.register_client("sensorA", device_pem).await?;
//! broker
//!     .register_datatype(NewDatatype::new("temp", StorageKind::Number).with_bounds(Some(-40.0), Some(85.0)))
//!     .await?;
//! broker.start().await?;
//!
//! // Alert pushes for sensorA
//! let mut alerts = broker.observe("alert/sensorA").await?;
//!
//! // A transport front end hands each inbound message to the broker
//! let resp = broker.handle(Request::post("client/sensorA", sealed_body)).await;
//! println!("{}", resp.status);
//! # let _ = alerts.try_next();
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - **memory**: in-memory document store for testing and single-process use
//! - **file**: in-memory store persisted to one JSON file
//!
//! ## Architecture
//!
//! - **DocumentStore** trait: storage abstraction all backends implement
//! - **SchemaRegistry**: client and datatype registration with read-through caches
//! - **IngestPipeline**: per-item validation and storage
//! - **alert::evaluate**: threshold, interval, and average-deviation rules
//! - **Broker**: route table, middleware, and lifecycle
//! - **Notifier**: per-client alert resources and their observers

pub mod alert;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod ingest;
pub mod notify;
pub mod provider;
pub mod schema;
pub mod timestamp;
pub mod transport;
pub mod types;

// Re-export core types
pub use alert::{ArrayTreatment, AlertSpec, Deviation, HistorySource, Interval};
pub use auth::{ClientKey, DeviceKey, SignedEnvelope};
pub use config::{BrokerConfig, ClientEntry, Manifest};
pub use dispatch::Broker;
pub use error::{BrokerError, Result};
pub use framing::Framing;
pub use ingest::IngestPipeline;
pub use notify::{AlertResource, AlertSubscription, Notifier, ResourceState};
pub use provider::{DocumentStore, Filter, FindOptions, StoreInfo};
pub use schema::{NewDatatype, Registered, SchemaRegistry, SchemaWarning};
pub use timestamp::TimeRange;
pub use transport::{Method, Request, Response, Status};
pub use types::{
    Alert, Bounds, Client, ClientId, DataPoint, DataPointId, DataValue, Datatype, DatatypeId,
    Scalar, StorageKind,
};

// Re-export providers for convenience
pub use provider::file::FileStore;
pub use provider::memory::MemoryStore;
