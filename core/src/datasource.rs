//! Data Source contract: the translation from a subscription's paths to
//! concrete values is deliberately out of scope here. `core` never
//! implements this trait for a real key/value store — that translation
//! layer is an external collaborator.

use async_trait::async_trait;

use crate::error::ProtocolError;
use crate::queue;
use crate::wire::Update;

/// One gathered sample, already shaped as a set of path/value updates
/// sharing a single timestamp — what the one-shot `Get` and the streaming
/// producer both hand back.
#[derive(Debug, Clone)]
pub struct Sample {
    pub timestamp_nanos: i64,
    pub updates: Vec<Update>,
    /// Set by a streaming producer on a trailing, update-free `Sample` once
    /// it has delivered a full initial pass over its subscribed paths. The
    /// session forwards this as a standalone `sync_response` notification
    /// rather than folding it into `build_notification`'s output.
    pub sync_complete: bool,
}

impl Sample {
    #[must_use]
    pub fn new(timestamp_nanos: i64, updates: Vec<Update>) -> Self {
        Self {
            timestamp_nanos,
            updates,
            sync_complete: false,
        }
    }

    /// A sync-response marker: no updates, `sync_complete` set.
    #[must_use]
    pub fn sync_marker(timestamp_nanos: i64) -> Self {
        Self {
            timestamp_nanos,
            updates: Vec::new(),
            sync_complete: true,
        }
    }
}

/// Per-subscription handle to an opaque sample producer. Constructed by the
/// Config Reflector via a `DataSourceFactory` when a Publish Session is
/// created.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// One-shot poll, used by the *periodic* transfer phase. Fails with
    /// `ProtocolError::SourceTerminated` if the underlying source cannot
    /// currently produce a sample.
    async fn get(&self) -> Result<Sample, ProtocolError>;

    /// Starts a continuous, change-driven sequence of samples for the
    /// *stream* transfer phase, writing into `sink` until stopped. Returns
    /// when the underlying change feed ends (a terminal condition, not a
    /// per-sample error) or when `sink` is disposed.
    async fn stream_into(&self, sink: queue::Sender<Sample>) -> Result<(), ProtocolError>;
}

/// Builds a [`DataSource`] for a subscription's paths and prefix target.
/// Kept as a trait (rather than a free function) so tests can supply a
/// fixture-backed factory without touching the real translation layer.
pub trait DataSourceFactory: Send + Sync {
    fn build(
        &self,
        path_target: &str,
        paths: &[String],
    ) -> std::sync::Arc<dyn DataSource>;
}

/// Test doubles, gated behind `test-support` so integration tests in
/// `core/tests/` (compiled as a separate crate, where `cfg(test)` does not
/// apply to this library) can reach them too — enabled for those tests via
/// a self-referencing dev-dependency in `Cargo.toml`.
#[cfg(any(test, feature = "test-support"))]
pub mod testutil {
    use super::*;
    use std::sync::Arc;

    /// Test double that replays a fixed sequence of samples once, then
    /// reports source termination — enough to drive the periodic and
    /// stream transfer-phase tests without a real key/value store.
    pub struct FixtureDataSource {
        samples: parking_lot::Mutex<Vec<Sample>>,
    }

    impl FixtureDataSource {
        pub fn new(samples: Vec<Sample>) -> Self {
            Self {
                samples: parking_lot::Mutex::new(samples),
            }
        }
    }

    #[async_trait]
    impl DataSource for FixtureDataSource {
        async fn get(&self) -> Result<Sample, ProtocolError> {
            let mut samples = self.samples.lock();
            if samples.is_empty() {
                return Err(ProtocolError::SourceTerminated {
                    subscription: "fixture".to_owned(),
                    reason: "exhausted".to_owned(),
                });
            }
            Ok(samples.remove(0))
        }

        async fn stream_into(&self, sink: queue::Sender<Sample>) -> Result<(), ProtocolError> {
            let drained: Vec<Sample> = self.samples.lock().drain(..).collect();
            let last_timestamp = drained.last().map_or(0, |s| s.timestamp_nanos);
            for sample in drained {
                if sink.send(sample).await.is_err() {
                    return Ok(());
                }
            }
            let _ = sink.send(Sample::sync_marker(last_timestamp)).await;
            Ok(())
        }
    }

    pub struct FixtureFactory;

    impl DataSourceFactory for FixtureFactory {
        fn build(&self, _path_target: &str, _paths: &[String]) -> Arc<dyn DataSource> {
            Arc::new(FixtureDataSource::new(Vec::new()))
        }
    }
}
