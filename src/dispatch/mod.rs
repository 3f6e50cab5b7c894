//! Broker: route table, lifecycle, and request dispatch
//!
//! `Broker` owns the schema registry, the ingestion pipeline, and the alert
//! notifier, and maps resource paths to handlers:
//!
//! | Path | GET | POST |
//! |---|---|---|
//! | `list/clients` | registered clients | |
//! | `list/datatypes` | registered datatypes | |
//! | `client/{name}` | stored data of one client | signed write batch |
//! | `datatype/{name}` | stored data of one datatype | |
//! | `alldata` | everything | |
//! | `alert/{client}` | last alert batch (observable) | |

mod handlers;
pub mod middleware;
pub mod query;

use self::middleware::{handler, with_auth, with_framing, Handler};
use crate::auth::ClientKey;
use crate::config::{BrokerConfig, Manifest};
use crate::error::{BrokerError, Result};
use crate::framing::Framing;
use crate::ingest::IngestPipeline;
use crate::notify::{AlertResource, AlertSubscription, Notifier};
use crate::provider::file::FileStore;
use crate::provider::memory::MemoryStore;
use crate::provider::DocumentStore;
use crate::schema::{NewDatatype, Registered, SchemaRegistry, SchemaWarning};
use crate::transport::{Method, Request, Response, Status};
use crate::types::{Client, ClientId, DatatypeId};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

pub const LIST_CLIENTS_PATH: &str = "list/clients";
pub const LIST_DATATYPES_PATH: &str = "list/datatypes";
pub const ALL_DATA_PATH: &str = "alldata";

pub fn client_path(client: &str) -> String {
    format!("client/{}", client)
}

pub fn datatype_path(datatype: &str) -> String {
    format!("datatype/{}", datatype)
}

pub fn alert_path(client: &str) -> String {
    format!("alert/{}", client)
}

/// State shared by every handler
pub(crate) struct Core {
    pub(crate) registry: Arc<SchemaRegistry>,
    pub(crate) ingest: IngestPipeline,
    pub(crate) notifier: Notifier,

    /// Epoch seconds of each client's last successful write
    last_received: RwLock<HashMap<String, i64>>,
}

impl Core {
    pub(crate) fn last_received(&self, client: &str) -> i64 {
        let map = self.last_received.read().unwrap_or_else(PoisonError::into_inner);
        map.get(client).copied().unwrap_or(0)
    }

    pub(crate) fn mark_received(&self, client: &str) {
        let mut map = self.last_received.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(client.to_string(), Utc::now().timestamp());
    }
}

#[derive(Clone, Default)]
struct Route {
    get: Option<Handler>,
    post: Option<Handler>,
}

/// The IoT broker
pub struct Broker {
    config: BrokerConfig,
    framing: Framing,
    core: Arc<Core>,
    routes: RwLock<HashMap<String, Route>>,
    running: AtomicBool,
}

impl Broker {
    /// Create a broker over `store`
    pub async fn new(config: BrokerConfig, store: Arc<dyn DocumentStore>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(SchemaRegistry::new(store));
        registry.init().await?;

        let framing = Framing::new(config.compression_level);
        let ingest = IngestPipeline::new(registry.clone())
            .with_desync_window(config.max_ahead(), config.max_behind());
        let notifier = Notifier::new(framing, config.observer_queue);

        tracing::info!(
            store = registry.store().name(),
            compression = config.compression_level,
            "Broker created"
        );

        Ok(Self {
            config,
            framing,
            core: Arc::new(Core {
                registry,
                ingest,
                notifier,
                last_received: RwLock::new(HashMap::new()),
            }),
            routes: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Create a broker over the store named by `config.storage_path`,
    /// in memory when unset
    pub async fn open(config: BrokerConfig) -> Result<Self> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => Arc::new(FileStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        Self::new(config, store).await
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.core.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Apply a manifest; names already registered are skipped
    pub async fn bootstrap(&self, manifest: &Manifest) -> Result<Vec<SchemaWarning>> {
        let mut warnings = Vec::new();

        for entry in &manifest.clients {
            match self.register_client(&entry.name, &entry.public_key).await {
                Ok(registered) => warnings.extend(registered.warnings),
                Err(BrokerError::DuplicateName(name)) => {
                    tracing::info!(client = %name, "Client already registered, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        for def in &manifest.datatypes {
            match self.register_datatype(def.clone()).await {
                Ok(registered) => warnings.extend(registered.warnings),
                Err(BrokerError::DuplicateName(name)) => {
                    tracing::info!(datatype = %name, "Datatype already registered, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(warnings)
    }

    /// Mount routes for every registered client and datatype
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Broker already running");
            return Ok(());
        }

        let core = self.core.clone();
        self.mount_get(LIST_CLIENTS_PATH, move |_| handlers::list_clients(core.clone()));
        let core = self.core.clone();
        self.mount_get(LIST_DATATYPES_PATH, move |_| handlers::list_datatypes(core.clone()));
        let core = self.core.clone();
        self.mount_get(ALL_DATA_PATH, move |req| handlers::all_data(core.clone(), req));

        let clients = self.core.registry.list_clients().await?;
        for client in &clients {
            self.mount_client(client)?;
        }
        let datatypes = self.core.registry.list_datatypes().await?;
        for datatype in &datatypes {
            self.mount_datatype(&datatype.name);
        }

        tracing::info!(
            clients = clients.len(),
            datatypes = datatypes.len(),
            routes = self.routes().len(),
            "Broker started"
        );
        Ok(())
    }

    /// Unmount every route and close all observer channels
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.core.notifier.close_all();
        tracing::info!("Broker stopped");
    }

    /// Register a client, mounting its resources when running
    pub async fn register_client(
        &self,
        name: &str,
        public_key: &str,
    ) -> Result<Registered<ClientId>> {
        let registered = self.core.registry.register_client(name, public_key).await?;
        if self.is_running() {
            let client = self.core.registry.lookup_client(name).await?;
            self.mount_client(&client)?;
        }
        Ok(registered)
    }

    /// Register a datatype, mounting its resource when running
    pub async fn register_datatype(&self, def: NewDatatype) -> Result<Registered<DatatypeId>> {
        let name = def.name.clone();
        let registered = self.core.registry.register_datatype(def).await?;
        if self.is_running() {
            self.mount_datatype(&name);
        }
        Ok(registered)
    }

    /// Dispatch one request
    pub async fn handle(&self, req: Request) -> Response {
        let route = {
            let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
            routes.get(&req.path).cloned()
        };

        let (method, path) = (req.method, req.path.clone());
        let resp = match route {
            None => Response::plain_error(Status::NotFound, "Resource not found"),
            Some(route) => {
                let handler = match method {
                    Method::Get => route.get,
                    Method::Post => route.post,
                };
                match handler {
                    Some(handler) => handler(req).await,
                    None => Response::plain_error(Status::MethodNotAllowed, "Method not allowed"),
                }
            }
        };

        tracing::debug!(method = %method, path = %path, status = %resp.status, "Request handled");
        resp
    }

    /// Subscribe to pushes on an `alert/{client}` resource
    pub async fn observe(&self, path: &str) -> Result<AlertSubscription> {
        let path = path.trim_matches('/');
        let client = path.strip_prefix("alert/").ok_or_else(|| {
            BrokerError::InvalidData(format!("'{}' is not an observable resource", path))
        })?;

        let mounted = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(path);
        if !mounted {
            return Err(BrokerError::UnknownClient(client.to_string()));
        }

        Ok(self.alert_resource(client).subscribe())
    }

    /// The alert resource of `client`
    pub fn alert_resource(&self, client: &str) -> Arc<AlertResource> {
        self.core.notifier.resource(client)
    }

    /// Mounted paths, sorted
    pub fn routes(&self) -> Vec<String> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        let mut paths: Vec<String> = routes.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn mount(&self, path: String, route: Route) {
        tracing::debug!(path = %path, "Route mounted");
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, route);
    }

    fn mount_get<F, Fut>(&self, path: &str, f: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Response> + Send + 'static,
    {
        let route = Route {
            get: Some(with_framing(self.framing, handler(f))),
            post: None,
        };
        self.mount(path.to_string(), route);
    }

    fn mount_client(&self, client: &Client) -> Result<()> {
        let key = ClientKey::from_pem(&client.public_key)?;
        let name: Arc<str> = Arc::from(client.name.as_str());

        let (core, get_name) = (self.core.clone(), name.clone());
        let get = with_framing(
            self.framing,
            handler(move |req| handlers::client_get(core.clone(), get_name.clone(), req)),
        );

        let (core, post_name) = (self.core.clone(), name.clone());
        let post = with_auth(
            client.name.clone(),
            key,
            with_framing(
                self.framing,
                handler(move |req| handlers::client_post(core.clone(), post_name.clone(), req)),
            ),
        );

        self.mount(
            client_path(&client.name),
            Route {
                get: Some(get),
                post: Some(post),
            },
        );

        let core = self.core.clone();
        self.mount_get(&alert_path(&client.name), move |_| {
            handlers::alert_get(core.clone(), name.clone())
        });
        self.core.notifier.resource(&client.name);
        Ok(())
    }

    fn mount_datatype(&self, datatype: &str) {
        let core = self.core.clone();
        let name: Arc<str> = Arc::from(datatype);
        self.mount_get(&datatype_path(datatype), move |req| {
            handlers::datatype_get(core.clone(), name.clone(), req)
        });
    }
}
