//! Streaming telemetry dial-out publisher core.
//!
//! Owns configuration reflection, the subscription/destination Registry,
//! Publish Sessions, and the Transport Client, per the component design
//! this crate implements. Consumers embed [`lifecycle::LifecycleCoordinator`]
//! with a [`kvstore::KvStore`] implementation and a
//! [`datasource::DataSourceFactory`]; everything else is internal wiring.

pub mod datasource;
pub mod error;
pub mod kvstore;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod reflector;
pub mod registry;
pub mod session;
pub mod transport;
pub mod wire;

pub use datasource::{DataSource, DataSourceFactory, Sample};
pub use kvstore::KvStore;
pub use lifecycle::LifecycleCoordinator;
pub use model::BootstrapConfig;
pub use registry::Registry;
pub use session::PublishSession;
