//! Composable request middleware
//!
//! Handlers are plain async functions from `Request` to `Response`. Framing
//! and signature checks wrap them at mount time:
//!
//! ```text
//! GET  route: with_framing(handler)
//! POST route: with_auth(key, with_framing(handler))
//! ```
//!
//! so a write's signature is checked over the still-compressed body.
//! Errors raised by a wrapper are answered uncompressed.

use crate::auth::{self, ClientKey};
use crate::error::BrokerError;
use crate::framing::Framing;
use crate::transport::{Request, Response, Status};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// A mounted request handler
pub type Handler = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// Box an async function as a `Handler`
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// Gunzip the request body and gzip the response body
pub fn with_framing(framing: Framing, inner: Handler) -> Handler {
    Arc::new(move |mut req: Request| {
        let inner = inner.clone();
        Box::pin(async move {
            if !req.payload.is_empty() {
                match framing.decompress(&req.payload) {
                    Ok(body) => req.payload = body,
                    Err(e) => {
                        tracing::debug!(path = %req.path, "Rejected request with bad compression");
                        return Response::plain_error(Status::BadRequest, &e.to_string());
                    }
                }
            }

            let mut resp = inner(req).await;
            match framing.compress(&resp.payload) {
                Ok(body) => resp.payload = body,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to compress response");
                    return Response::plain_error(
                        Status::InternalServerError,
                        "Internal Server Error",
                    );
                }
            }
            resp
        })
    })
}

/// Verify the signed envelope against `key` before calling `inner`
pub fn with_auth(client: impl Into<String>, key: ClientKey, inner: Handler) -> Handler {
    let client: Arc<str> = Arc::from(client.into());
    let key = Arc::new(key);
    Arc::new(move |mut req: Request| {
        let inner = inner.clone();
        let key = key.clone();
        let client = client.clone();
        Box::pin(async move {
            match auth::authenticate(&key, &req.payload) {
                Ok(message) => req.payload = message,
                Err(e) => {
                    let status = match e {
                        BrokerError::InvalidSignature => Status::Unauthorized,
                        _ => Status::BadRequest,
                    };
                    tracing::warn!(client = %client, error = %e, "Rejected unauthenticated write");
                    return Response::plain_error(status, &e.to_string());
                }
            }
            inner(req).await
        })
    })
}
