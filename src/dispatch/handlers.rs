//! Resource handlers
//!
//! Every handler sees an already decompressed (and, for writes, verified)
//! body and answers with an uncompressed JSON body; the middleware frames it.

use super::query::{self, ReadParams};
use super::Core;
use crate::alert;
use crate::error::BrokerError;
use crate::transport::{Request, Response, Status};
use crate::types::{Alert, DataPoint};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn json_response<T: Serialize + ?Sized>(status: Status, body: &T) -> Response {
    match serde_json::to_vec(body) {
        Ok(payload) => Response::new(status, payload),
        Err(e) => internal_error(&e.into()),
    }
}

fn error_body(message: &str) -> Value {
    json!({ "error": message })
}

fn internal_error(e: &BrokerError) -> Response {
    tracing::error!(error = %e, "Request failed");
    json_response(Status::InternalServerError, &error_body("Internal Server Error"))
}

/// Client errors are reported verbatim, anything else as a generic 5.00
fn error_response(e: &BrokerError) -> Response {
    if e.is_client_error() {
        json_response(Status::BadRequest, &error_body(&e.to_string()))
    } else {
        internal_error(e)
    }
}

/// `list/clients`: name → public attributes, never the key
pub(crate) async fn list_clients(core: Arc<Core>) -> Response {
    let clients = match core.registry.list_clients().await {
        Ok(clients) => clients,
        Err(e) => return error_response(&e),
    };

    let body: Map<String, Value> = clients
        .iter()
        .map(|c| {
            let attrs = json!({
                "id": c.id,
                "registeredAt": c.registered_at.timestamp(),
            });
            (c.name.clone(), attrs)
        })
        .collect();
    json_response(Status::Content, &body)
}

/// `list/datatypes`: name → registered schema
pub(crate) async fn list_datatypes(core: Arc<Core>) -> Response {
    let datatypes = match core.registry.list_datatypes().await {
        Ok(datatypes) => datatypes,
        Err(e) => return error_response(&e),
    };

    let mut body = Map::new();
    for datatype in datatypes {
        let mut schema = match serde_json::to_value(&*datatype) {
            Ok(Value::Object(schema)) => schema,
            Ok(_) => continue,
            Err(e) => return internal_error(&e.into()),
        };
        schema.remove("name");
        body.insert(datatype.name.clone(), Value::Object(schema));
    }
    json_response(Status::Content, &body)
}

/// `client/{name}` GET: `{c, l, d}`
pub(crate) async fn client_get(core: Arc<Core>, client: Arc<str>, req: Request) -> Response {
    let params = match ReadParams::parse(&req.payload) {
        Ok(params) => params,
        Err(e) => return error_response(&e),
    };

    let data = if params.no_data {
        Value::Null
    } else {
        match query::client_data(&core.registry, &client, &params).await {
            Ok(data) => Value::Object(data),
            Err(e) => return error_response(&e),
        }
    };

    json_response(
        Status::Content,
        &json!({
            "c": &*client,
            "l": core.last_received(&client),
            "d": data,
        }),
    )
}

/// `client/{name}` POST: insert a batch, answer per item, then alert
pub(crate) async fn client_post(core: Arc<Core>, client: Arc<str>, req: Request) -> Response {
    let items = match serde_json::from_slice::<Value>(&req.payload) {
        Ok(Value::Array(items)) if !items.is_empty() => items,
        Ok(_) => {
            return json_response(
                Status::BadRequest,
                &error_body("JSON top object not an array"),
            )
        }
        Err(_) => return json_response(Status::BadRequest, &error_body("Bad JSON format")),
    };

    let mut results = Vec::with_capacity(items.len());
    let mut inserted: Vec<DataPoint> = Vec::new();
    for item in &items {
        match core.ingest.insert(&client, item).await {
            Ok(point) => {
                results.push(json!({ "id": point.id }));
                inserted.push(point);
            }
            Err(e) if e.is_client_error() => {
                tracing::debug!(client = %client, error = %e, "Rejected data item");
                results.push(error_body(&e.to_string()));
            }
            Err(e) => {
                tracing::error!(client = %client, error = %e, "Data item insert failed");
                results.push(error_body("Internal Server Error"));
            }
        }
    }

    let status = if inserted.is_empty() {
        Status::BadRequest
    } else {
        core.mark_received(&client);
        Status::Changed
    };
    tracing::debug!(
        client = %client,
        items = items.len(),
        inserted = inserted.len(),
        "Write batch processed"
    );

    let alerts = evaluate_alerts(&core, &inserted).await;
    if !alerts.is_empty() {
        let resource = core.notifier.resource(&client);
        if let Err(e) = resource.publish(alerts) {
            tracing::error!(client = %client, error = %e, "Failed to publish alerts");
        }
    }

    json_response(status, &results)
}

/// Alerts raised by freshly stored points; evaluation failures are logged and skipped
async fn evaluate_alerts(core: &Core, points: &[DataPoint]) -> Vec<Alert> {
    let mut alerts = Vec::new();
    for point in points {
        let datatype = match core.registry.lookup_datatype(&point.datatype).await {
            Ok(datatype) => datatype,
            Err(e) => {
                tracing::error!(datatype = %point.datatype, error = %e, "Alert lookup failed");
                continue;
            }
        };
        if datatype.alert_spec.is_none() {
            continue;
        }

        let history = core.ingest.history_for(point);
        match alert::evaluate(&datatype, point, &history).await {
            Ok(raised) => alerts.extend(raised),
            Err(e) => {
                tracing::error!(
                    client = %point.client,
                    datatype = %point.datatype,
                    error = %e,
                    "Alert evaluation failed"
                );
            }
        }
    }
    alerts
}

/// `datatype/{name}` GET: `{c, d: {client: [...]}}`
pub(crate) async fn datatype_get(core: Arc<Core>, datatype: Arc<str>, req: Request) -> Response {
    let range = match ReadParams::parse_range(&req.payload) {
        Ok(range) => range,
        Err(e) => return error_response(&e),
    };

    match query::datatype_data(&core.registry, &datatype, &range).await {
        Ok(data) => json_response(
            Status::Content,
            &json!({
                "c": &*datatype,
                "d": data,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

/// `alldata` GET: `{client: {datatype: [...]}}`
pub(crate) async fn all_data(core: Arc<Core>, req: Request) -> Response {
    let range = match ReadParams::parse_range(&req.payload) {
        Ok(range) => range,
        Err(e) => return error_response(&e),
    };

    match query::all_data(&core.registry, &range).await {
        Ok(data) => json_response(Status::Content, &data),
        Err(e) => error_response(&e),
    }
}

/// `alert/{client}` GET: the last alert batch, `[]` before any
pub(crate) async fn alert_get(core: Arc<Core>, client: Arc<str>) -> Response {
    let batch = core.notifier.resource(&client).last_batch();
    json_response(Status::Content, &batch)
}
