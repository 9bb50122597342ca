//! Error kinds, one per failure-handling policy bucket.
//!
//! Each variant is handled differently by its caller: `ConfigError` is
//! reported and leaves the Registry untouched; `TransportError` and
//! `ProtocolError` are counted and trigger a session restart; `Fatal`
//! unwinds the session loop entirely.

use thiserror::Error;

/// Errors raised while applying a configuration-table row to the Registry.
/// Never mutates the Registry before returning one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("row {row:?} has unrecognized field {field:?}")]
    UnknownField { row: String, field: String },

    #[error("row {row:?} field {field:?} is not a valid number: {value:?}")]
    InvalidNumber {
        row: String,
        field: String,
        value: String,
    },

    #[error("destination group {group:?} has an empty destination in {dst_addr:?}")]
    EmptyDestination { group: String, dst_addr: String },

    #[error("destination group {group:?} is still referenced by {users:?}, cannot delete")]
    GroupInUse { group: String, users: Vec<String> },

    #[error("the Global row cannot be deleted")]
    GlobalRowIsUndeletable,

    #[error("encoding {0:?} is not supported, only JSON_IETF is accepted in this revision")]
    UnsupportedEncoding(String),

    #[error("subscription {name:?} has unsupported report_type {report_type:?}, registered without a session")]
    UnsupportedReportType { name: String, report_type: String },
}

/// Transient transport-layer failure: dial, stream-open, send, or read.
/// Always recoverable by rotating to the next destination and retrying.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial to {destination} timed out after {timeout_secs}s")]
    DialTimeout {
        destination: String,
        timeout_secs: u64,
    },

    #[error("dial to {destination} failed: {source}")]
    DialFailed {
        destination: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("failed to open publish stream to {destination}: {source}")]
    StreamOpenFailed {
        destination: String,
        #[source]
        source: tonic::Status,
    },
}

/// An item handed to the transfer phase could not be converted to a wire
/// notification, or the data source reported a fatal (non-per-sample)
/// failure. Counted; the session restarts.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("data source for subscription {subscription:?} terminated: {reason}")]
    SourceTerminated { subscription: String, reason: String },
}

/// Root-context cancellation observed inside a blocking operation. Not a
/// "failure" in the retry sense — every session exits its loop and returns
/// when it sees this.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("root context canceled")]
pub struct Canceled;

/// Sums the error kinds a single call site can raise. The Config Reflector's
/// row-apply surface is the motivating case: a row can be rejected with a
/// `ConfigError`, or the call can arrive after shutdown has already begun,
/// which is a `Fatal` rather than a rejected row.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("operation aborted: root context already canceled")]
    Fatal,
}

