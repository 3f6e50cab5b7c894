//! Alert notification: per-client observable alert resources
//!
//! Every client owns one `AlertResource`. Observers subscribe to it and get
//! each alert batch pushed as a gzip-compressed JSON list of `{n, t, a}`.
//! Pushing never blocks: each observer has a bounded queue, a full queue
//! drops the batch for that observer and a closed one is unsubscribed.

use crate::error::Result;
use crate::framing::{self, Framing};
use crate::types::Alert;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Observer state of an alert resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// No observers
    Idle,
    /// At least one observer
    Active,
}

#[derive(Default)]
struct Observers {
    next_id: u64,
    senders: HashMap<u64, mpsc::Sender<Bytes>>,
    last_batch: Vec<Alert>,
    last_push: Option<DateTime<Utc>>,
}

/// Observable alert resource of one client
pub struct AlertResource {
    client: String,
    framing: Framing,
    queue: usize,
    observers: Mutex<Observers>,
}

impl AlertResource {
    pub fn new(client: impl Into<String>, framing: Framing, queue: usize) -> Self {
        Self {
            client: client.into(),
            framing,
            queue: queue.max(1),
            observers: Mutex::new(Observers::default()),
        }
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    fn lock(&self) -> MutexGuard<'_, Observers> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ResourceState {
        if self.lock().senders.is_empty() {
            ResourceState::Idle
        } else {
            ResourceState::Active
        }
    }

    pub fn observer_count(&self) -> usize {
        self.lock().senders.len()
    }

    /// Most recent alert batch, empty before any alert
    pub fn last_batch(&self) -> Vec<Alert> {
        self.lock().last_batch.clone()
    }

    /// When a batch was last pushed to at least one observer
    pub fn last_push_time(&self) -> Option<DateTime<Utc>> {
        self.lock().last_push
    }

    /// Register a new observer
    pub fn subscribe(self: &Arc<Self>) -> AlertSubscription {
        let (tx, rx) = mpsc::channel(self.queue);
        let mut observers = self.lock();
        let id = observers.next_id;
        observers.next_id += 1;
        observers.senders.insert(id, tx);

        if observers.senders.len() == 1 {
            tracing::debug!(client = %self.client, "Alert resource active");
        }
        tracing::info!(
            client = %self.client,
            observer = id,
            observers = observers.senders.len(),
            "Alert observer subscribed"
        );

        AlertSubscription {
            id,
            resource: Arc::clone(self),
            stream: ReceiverStream::new(rx),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut observers = self.lock();
        if observers.senders.remove(&id).is_some() {
            tracing::info!(client = %self.client, observer = id, "Alert observer unsubscribed");
            if observers.senders.is_empty() {
                tracing::debug!(client = %self.client, "Alert resource idle");
            }
        }
    }

    /// Record `batch` and push it to every current observer.
    ///
    /// Returns how many observers accepted the batch.
    pub fn publish(&self, batch: Vec<Alert>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let payload = self.framing.encode_json(&batch)?;
        let mut observers = self.lock();
        observers.last_batch = batch;

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in &observers.senders {
            match tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        client = %self.client,
                        observer = id,
                        "Alert observer queue full, dropping batch"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            observers.senders.remove(&id);
            tracing::debug!(client = %self.client, observer = id, "Removed disconnected alert observer");
        }

        if delivered > 0 {
            observers.last_push = Some(Utc::now());
        }
        tracing::debug!(
            client = %self.client,
            alerts = observers.last_batch.len(),
            delivered,
            "Alert batch published"
        );
        Ok(delivered)
    }

    /// Drop every observer; their streams end
    pub fn close(&self) {
        let mut observers = self.lock();
        let count = observers.senders.len();
        observers.senders.clear();
        if count > 0 {
            tracing::debug!(client = %self.client, observers = count, "Alert resource closed");
        }
    }
}

/// Decode a pushed alert payload
pub fn decode_batch(payload: &[u8]) -> Result<Vec<Alert>> {
    let body = framing::decompress(payload)?;
    Ok(serde_json::from_slice(&body)?)
}

/// A live observer registration; dropping it unsubscribes
pub struct AlertSubscription {
    id: u64,
    resource: Arc<AlertResource>,
    stream: ReceiverStream<Bytes>,
}

impl AlertSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next pushed payload, `None` once the resource is closed
    pub async fn next(&mut self) -> Option<Bytes> {
        self.stream.next().await
    }

    /// Next pushed batch, decoded
    pub async fn next_batch(&mut self) -> Option<Result<Vec<Alert>>> {
        let payload = self.next().await?;
        Some(decode_batch(&payload))
    }

    /// A payload already queued, without waiting
    pub fn try_next(&mut self) -> Option<Bytes> {
        self.stream.as_mut().try_recv().ok()
    }

    /// Explicit unsubscribe
    pub fn cancel(self) {}
}

impl Stream for AlertSubscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl Drop for AlertSubscription {
    fn drop(&mut self) {
        self.resource.unsubscribe(self.id);
    }
}

/// Alert resources of every client
pub struct Notifier {
    framing: Framing,
    queue: usize,
    resources: RwLock<HashMap<String, Arc<AlertResource>>>,
}

impl Notifier {
    pub fn new(framing: Framing, queue: usize) -> Self {
        Self {
            framing,
            queue,
            resources: RwLock::new(HashMap::new()),
        }
    }

    /// The resource of `client`, created on first use
    pub fn resource(&self, client: &str) -> Arc<AlertResource> {
        if let Some(resource) = self.get(client) {
            return resource;
        }
        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        resources
            .entry(client.to_string())
            .or_insert_with(|| Arc::new(AlertResource::new(client, self.framing, self.queue)))
            .clone()
    }

    pub fn get(&self, client: &str) -> Option<Arc<AlertResource>> {
        let resources = self.resources.read().unwrap_or_else(PoisonError::into_inner);
        resources.get(client).cloned()
    }

    /// Close all observer channels
    pub fn close_all(&self) {
        let resources = self.resources.read().unwrap_or_else(PoisonError::into_inner);
        for resource in resources.values() {
            resource.close();
        }
    }
}
