//! Generated wire types plus the small conversion layer between them and
//! the internal sample representation. The `.proto` schema models only
//! prefix, timestamp, updates, and typed values — not any real telemetry
//! schema, which stays opaque to this crate.

/// Generated from `proto/telemetry.proto`, isolated in its own module so
/// the message names (`Update`, `Path`, ...) don't collide with the
/// hand-written internal types below.
pub mod proto {
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("dialout.telemetry");
}

pub use proto::telemetry_publish_client::TelemetryPublishClient;
/// Re-exported for `core/tests/`'s in-process collector, which stands in
/// for a real collector deployment in end-to-end tests.
pub use proto::telemetry_publish_server::{TelemetryPublish, TelemetryPublishServer};
pub use proto::{Notification, Path, PublishResponse, TypedValue};

/// A single path/value update, decoupled from the generated [`proto::Update`]
/// type so [`crate::datasource::DataSource`] implementations don't need to
/// depend on `prost`-generated code directly.
#[derive(Debug, Clone)]
pub struct Update {
    pub path: Vec<String>,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub enum Value {
    JsonIetf(Vec<u8>),
    Str(String),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Double(f64),
}

/// Builds a wire `Notification` for a session's prefix target, wrapping a
/// timestamp and a set of internal updates into the shape a collector
/// expects.
#[must_use]
pub fn build_notification(target: &str, timestamp_nanos: i64, updates: Vec<Update>) -> Notification {
    Notification {
        timestamp: timestamp_nanos,
        prefix: Some(Path {
            target: target.to_owned(),
            elem: Vec::new(),
        }),
        updates: updates.into_iter().map(to_wire_update).collect(),
        sync_response: false,
    }
}

/// A standalone sync-response marker notification, sent once a `stream`
/// subscription's initial wildcard snapshot has been delivered in full.
#[must_use]
pub fn sync_response_notification(target: &str) -> Notification {
    Notification {
        timestamp: 0,
        prefix: Some(Path {
            target: target.to_owned(),
            elem: Vec::new(),
        }),
        updates: Vec::new(),
        sync_response: true,
    }
}

fn to_wire_update(update: Update) -> proto::Update {
    proto::Update {
        path: Some(Path {
            target: String::new(),
            elem: update.path,
        }),
        value: Some(TypedValue {
            value: Some(match update.value {
                Value::JsonIetf(bytes) => proto::typed_value::Value::JsonIetfVal(bytes),
                Value::Str(s) => proto::typed_value::Value::StringVal(s),
                Value::Int(i) => proto::typed_value::Value::IntVal(i),
                Value::UInt(u) => proto::typed_value::Value::UintVal(u),
                Value::Bool(b) => proto::typed_value::Value::BoolVal(b),
                Value::Double(d) => proto::typed_value::Value::DoubleVal(d),
            }),
        }),
    }
}
