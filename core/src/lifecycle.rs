//! Lifecycle Coordinator. Owns the root cancellation context, performs the
//! initial full enumeration, then runs the Reflector's event loop until
//! canceled. Mirrors `binance/src/services/exchange/service.rs`'s
//! task-management shape: spawn workers, fan a single cancellation into
//! all of them, await their join on shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::datasource::DataSourceFactory;
use crate::kvstore::KvStore;
use crate::model::BootstrapConfig;
use crate::reflector::ConfigReflector;
use crate::registry::Registry;

/// Top-level entry point: owns the Registry, the Config Reflector, and the
/// root `CancellationToken` every Publish Session is ultimately derived
/// from.
pub struct LifecycleCoordinator<S: KvStore> {
    reflector: Arc<ConfigReflector<S>>,
    root_cancel: CancellationToken,
}

impl<S: KvStore + 'static> LifecycleCoordinator<S> {
    #[must_use]
    pub fn new(store: Arc<S>, bootstrap: &BootstrapConfig, data_source_factory: Arc<dyn DataSourceFactory>) -> Self {
        let registry = Arc::new(Registry::new());
        let reflector = Arc::new(ConfigReflector::new(
            store,
            registry,
            data_source_factory,
            bootstrap.config_db,
            bootstrap.separator.clone(),
        ));
        Self {
            reflector,
            root_cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<Registry> {
        self.reflector.registry()
    }

    /// Cancels the root context. All derived session tokens observe this
    /// and every session drains within one retry interval.
    pub fn shutdown(&self) {
        self.root_cancel.cancel();
    }

    /// Enumerates and replays every existing configuration row, then enters
    /// the event loop reading keyspace notifications scoped to
    /// `__keyspace@<db>__:TELEMETRY_CLIENT<sep>*`. Returns once the root
    /// context is canceled.
    pub async fn run(&self) -> anyhow::Result<()> {
        if let Err(err) = self.reflector.replay_existing(&self.root_cancel).await {
            warn!(error = %err, "startup replay encountered a rejected row, continuing");
        }
        info!("startup replay complete, entering event loop");

        let events = self.reflector.subscribe().await?;
        self.reflector.run(events, self.root_cancel.clone()).await;
        info!("lifecycle coordinator shut down");
        Ok(())
    }

    #[must_use]
    pub fn root_cancel(&self) -> CancellationToken {
        self.root_cancel.clone()
    }
}
