//! Transport-neutral request and response types
//!
//! The broker never speaks a wire protocol itself. A CoAP (or any other)
//! front end turns its messages into `Request`s, hands them to
//! `Broker::handle`, and sends back the `Response`. Status codes follow the
//! CoAP response classes.

use bytes::Bytes;
use std::fmt;

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
        }
    }
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// 2.05
    Content,
    /// 2.04
    Changed,
    /// 4.00
    BadRequest,
    /// 4.01
    Unauthorized,
    /// 4.04
    NotFound,
    /// 4.05
    MethodNotAllowed,
    /// 5.00
    InternalServerError,
}

impl Status {
    /// CoAP code as `(class, detail)`
    pub fn code(&self) -> (u8, u8) {
        match self {
            Status::Content => (2, 5),
            Status::Changed => (2, 4),
            Status::BadRequest => (4, 0),
            Status::Unauthorized => (4, 1),
            Status::NotFound => (4, 4),
            Status::MethodNotAllowed => (4, 5),
            Status::InternalServerError => (5, 0),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code().0 == 2
    }

    pub fn is_client_error(&self) -> bool {
        self.code().0 == 4
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (class, detail) = self.code();
        write!(f, "{}.{:02}", class, detail)
    }
}

/// An inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,

    /// Resource path without leading or trailing slashes, e.g. `client/sensorA`
    pub path: String,

    pub payload: Bytes,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path, Bytes::new())
    }

    pub fn post(path: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(Method::Post, path, payload)
    }

    pub fn new(method: Method, path: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            method,
            path: path.into().trim_matches('/').to_string(),
            payload: payload.into(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// An outbound response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub payload: Bytes,
}

impl Response {
    pub fn new(status: Status, payload: impl Into<Bytes>) -> Self {
        Self {
            status,
            payload: payload.into(),
        }
    }

    /// Uncompressed `{"error": message}` body
    pub fn plain_error(status: Status, message: &str) -> Self {
        let body = serde_json::json!({ "error": message });
        Self::new(status, body.to_string())
    }
}
