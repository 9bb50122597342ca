//! Config Reflector. Watches the configuration table, parses rows, and
//! drives the Registry. Mirrors a `GenericProcess` retry-loop shape
//! (startup replay + live event loop, continue-past-error body) and
//! `solana_client::grpc`'s per-row dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::datasource::DataSourceFactory;
use crate::error::{ConfigError, CoreError};
use crate::kvstore::{KeyEvent, KvStore};
use crate::model::{self, Encoding, GlobalSettings, ReportType, Subscription};
use crate::registry::{Registry, SessionHandle};
use crate::session::{PublishSession, SessionConfig};
use crate::transport::TlsConfig;

const PREFIX: &str = "TELEMETRY_CLIENT";

/// Row-kind dispatch target, derived from a key's suffix after `PREFIX` and
/// the configured separator. A key identifies one of three record kinds by
/// its prefix.
enum RowKind<'a> {
    Global,
    DestinationGroup(&'a str),
    Subscription(&'a str),
    Unrecognized,
}

fn classify<'a>(key: &'a str, prefix: &str, sep: &str) -> RowKind<'a> {
    let Some(suffix) = key.strip_prefix(prefix).and_then(|s| s.strip_prefix(sep)) else {
        return RowKind::Unrecognized;
    };
    if suffix == "Global" {
        RowKind::Global
    } else if let Some(name) = suffix.strip_prefix("DestinationGroup_") {
        RowKind::DestinationGroup(name)
    } else if let Some(name) = suffix.strip_prefix("Subscription_") {
        RowKind::Subscription(name)
    } else {
        RowKind::Unrecognized
    }
}

/// Drives a [`Registry`] from a [`KvStore`]'s rows and change events.
/// Holds the process-wide configuration mutex as a `tokio::sync::Mutex`
/// around the global-settings cell, serializing every
/// row application — Registry's own lock only ever guards its maps for the
/// duration of a single synchronous mutation, so this outer mutex is what
/// gives row application its atomicity end to end.
pub struct ConfigReflector<S: KvStore> {
    store: Arc<S>,
    registry: Arc<Registry>,
    data_source_factory: Arc<dyn DataSourceFactory>,
    config_db: u8,
    separator: String,
    fence: tokio::sync::Mutex<GlobalSettings>,
}

impl<S: KvStore + 'static> ConfigReflector<S> {
    #[must_use]
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    #[must_use]
    pub fn config_db(&self) -> u8 {
        self.config_db
    }

    #[must_use]
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Subscribes to keyspace notifications for this Reflector's
    /// configured database and prefix.
    pub async fn subscribe(&self) -> anyhow::Result<tokio::sync::mpsc::Receiver<KeyEvent>> {
        let pattern = format!("{PREFIX}{}*", self.separator);
        self.store.subscribe_keyspace(self.config_db, &pattern).await
    }

    #[must_use]
    pub fn new(
        store: Arc<S>,
        registry: Arc<Registry>,
        data_source_factory: Arc<dyn DataSourceFactory>,
        config_db: u8,
        separator: String,
    ) -> Self {
        Self {
            store,
            registry,
            data_source_factory,
            config_db,
            separator,
            fence: tokio::sync::Mutex::new(GlobalSettings::default()),
        }
    }

    /// Startup behavior: enumerate every existing row and replay it as an
    /// `hset`, then return. Strict ordering of `Global`/`DestinationGroup_*`
    /// rows landing before `Subscription_*` rows that reference them is
    /// *not* required — a subscription referencing a not-yet-seen group
    /// simply starts with an empty destination list snapshot until the
    /// group row is replayed, at which point it gets recreated. To
    /// minimize that churn this replays `Global`, then groups, then
    /// subscriptions.
    ///
    /// A rejected row does not abort the replay: startup replay must stay
    /// behaviorally identical to the live event loop (`run`, below), which
    /// requires every row to get its chance regardless of an earlier row's
    /// error, so this logs and continues rather than short-circuiting on
    /// the first `Err`. The last error seen (if any) is returned to the
    /// caller.
    pub async fn replay_existing(&self, root_cancel: &CancellationToken) -> Result<(), CoreError> {
        if root_cancel.is_cancelled() {
            return Err(CoreError::Fatal);
        }

        let prefix_with_sep = format!("{PREFIX}{}", self.separator);
        let keys = self
            .store
            .scan_keys(self.config_db, &prefix_with_sep)
            .await
            .map_err(|_| ConfigError::UnknownField {
                row: prefix_with_sep.clone(),
                field: "<scan>".to_owned(),
            })?;

        let mut globals = Vec::new();
        let mut groups = Vec::new();
        let mut subs = Vec::new();
        for key in keys {
            match classify(&key, PREFIX, &self.separator) {
                RowKind::Global => globals.push(key),
                RowKind::DestinationGroup(_) => groups.push(key),
                RowKind::Subscription(_) => subs.push(key),
                RowKind::Unrecognized => {}
            }
        }

        let mut last_err = Ok(());
        for key in globals.into_iter().chain(groups).chain(subs) {
            if root_cancel.is_cancelled() {
                return Err(CoreError::Fatal);
            }
            if let Err(err) = self.apply_hset(&key, root_cancel).await {
                warn!(key = %key, error = %err, "startup replay: row rejected, continuing");
                last_err = Err(err);
            }
        }
        Ok(last_err?)
    }

    /// Live event loop: consumes `(key, op)` pairs already filtered by
    /// [`KvStore::subscribe_keyspace`] and applies each under the fencing
    /// mutex, bounded by a 1-second receive timeout so root cancellation
    /// is observed promptly.
    pub async fn run(
        &self,
        mut events: tokio::sync::mpsc::Receiver<KeyEvent>,
        root_cancel: CancellationToken,
    ) {
        loop {
            if root_cancel.is_cancelled() {
                return;
            }

            let event = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
            let event = match event {
                Ok(Some(event)) => event,
                Ok(None) => return,
                Err(_) => continue,
            };

            let result = if event.is_delete() {
                self.apply_delete(event.key(), &root_cancel).await
            } else {
                self.apply_hset(event.key(), &root_cancel).await
            };

            if let Err(err) = result {
                warn!(key = event.key(), error = %err, "configuration row rejected");
            }
        }
    }

    async fn apply_hset(&self, key: &str, root_cancel: &CancellationToken) -> Result<(), ConfigError> {
        let fields = self
            .store
            .hash_get_all(self.config_db, key)
            .await
            .map_err(|_| ConfigError::UnknownField {
                row: key.to_owned(),
                field: "<read>".to_owned(),
            })?;

        match classify(key, PREFIX, &self.separator) {
            RowKind::Global => self.apply_global(&fields, root_cancel).await,
            RowKind::DestinationGroup(name) => {
                self.apply_destination_group(name, &fields, root_cancel).await
            }
            RowKind::Subscription(name) => self.apply_subscription(name, &fields, root_cancel).await,
            RowKind::Unrecognized => Ok(()),
        }
    }

    async fn apply_delete(&self, key: &str, _root_cancel: &CancellationToken) -> Result<(), ConfigError> {
        match classify(key, PREFIX, &self.separator) {
            RowKind::Global => Err(ConfigError::GlobalRowIsUndeletable),
            RowKind::DestinationGroup(name) => self.registry.remove_group(name),
            RowKind::Subscription(name) => {
                if let Some(handle) = self.registry.remove_subscription(name) {
                    handle.close();
                    handle.cancel();
                }
                Ok(())
            }
            RowKind::Unrecognized => Ok(()),
        }
    }

    /// `Global` row: parse, then restart every session in every known
    /// destination group so they pick up the new settings.
    async fn apply_global(
        &self,
        fields: &HashMap<String, String>,
        root_cancel: &CancellationToken,
    ) -> Result<(), ConfigError> {
        let mut guard = self.fence.lock().await;

        if let Some(encoding) = fields.get("encoding")
            && encoding != "JSON_IETF"
        {
            return Err(ConfigError::UnsupportedEncoding(encoding.clone()));
        }

        let retry_interval = match fields.get("retry_interval") {
            Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
                row: "Global".to_owned(),
                field: "retry_interval".to_owned(),
                value: raw.clone(),
            })?,
            None => guard.retry_interval.as_secs(),
        };

        *guard = GlobalSettings {
            src_ip: fields.get("src_ip").cloned(),
            retry_interval: Duration::from_secs(retry_interval),
            encoding: Encoding::JsonIetf,
            unidirectional: true,
        };
        let settings = guard.clone();
        drop(guard);

        info!(retry_interval = settings.retry_interval.as_secs(), "Global settings updated");

        for group in self.registry.group_names() {
            self.restart_group(&group, &settings, root_cancel).await;
        }
        Ok(())
    }

    async fn apply_destination_group(
        &self,
        name: &str,
        fields: &HashMap<String, String>,
        root_cancel: &CancellationToken,
    ) -> Result<(), ConfigError> {
        let guard = self.fence.lock().await;
        let settings = guard.clone();

        let dst_addr = fields.get("dst_addr").cloned().unwrap_or_default();
        let destinations = model::parse_destinations(name, &dst_addr)?;

        self.registry.close_group_sessions(name);
        self.registry.upsert_group(name, destinations);
        drop(guard);

        self.restart_group(name, &settings, root_cancel).await;
        Ok(())
    }

    async fn apply_subscription(
        &self,
        name: &str,
        fields: &HashMap<String, String>,
        root_cancel: &CancellationToken,
    ) -> Result<(), ConfigError> {
        let guard = self.fence.lock().await;
        let settings = guard.clone();
        drop(guard);

        if let Some(handle) = self.registry.remove_session(name) {
            handle.close();
            handle.cancel();
        }

        let report_type = ReportType::parse(fields.get("report_type").map_or("", String::as_str));
        let mut sub = Subscription::new(name);
        sub.path_target = fields.get("path_target").cloned().unwrap_or_default();
        sub.paths = fields
            .get("paths")
            .map(|raw| raw.split(',').map(str::trim).map(str::to_owned).collect())
            .unwrap_or_default();
        sub.dst_group = fields.get("dst_group").filter(|s| !s.is_empty()).cloned();
        sub.report_type = report_type;
        if let Some(raw) = fields.get("report_interval") {
            let millis = raw.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
                row: format!("Subscription_{name}"),
                field: "report_interval".to_owned(),
                value: raw.clone(),
            })?;
            sub.report_interval = Duration::from_millis(millis);
        }

        self.registry.upsert_subscription(sub.clone());

        if !report_type.is_supported() {
            warn!(subscription = name, ?report_type, "unsupported report_type, registered without a session");
            return Err(ConfigError::UnsupportedReportType {
                name: name.to_owned(),
                report_type: format!("{report_type:?}"),
            });
        }

        let Some(group) = sub.dst_group.clone() else {
            return Ok(());
        };
        let Some(destinations) = self.registry.group_destinations(&group) else {
            return Ok(());
        };

        self.spawn_session(sub, destinations, &settings, root_cancel);
        Ok(())
    }

    /// Creates new sessions for all subscriptions using the given group,
    /// used after an in-place group update. Split from
    /// `close_group_sessions` because constructing a session is async.
    async fn restart_group(&self, group: &str, settings: &GlobalSettings, root_cancel: &CancellationToken) {
        let Some(destinations) = self.registry.group_destinations(group) else {
            return;
        };
        if destinations.is_empty() {
            return;
        }
        for sub in self.registry.subscriptions_in_group(group) {
            if !sub.report_type.is_supported() {
                continue;
            }
            if let Some(handle) = self.registry.session(&sub.name) {
                handle.close();
                handle.cancel();
            }
            self.spawn_session(sub, destinations.clone(), settings, root_cancel);
        }
    }

    fn spawn_session(
        &self,
        sub: Subscription,
        destinations: Vec<model::Destination>,
        settings: &GlobalSettings,
        root_cancel: &CancellationToken,
    ) {
        let data_source = self.data_source_factory.build(&sub.path_target, &sub.paths);
        let session_cancel = root_cancel.child_token();
        let session = PublishSession::new(SessionConfig {
            name: sub.name.clone(),
            path_target: sub.path_target,
            destinations,
            report_type: sub.report_type,
            report_interval: sub.report_interval,
            retry_interval: settings.retry_interval,
            src_ip: settings.src_ip.clone(),
            tls: TlsConfig::default(),
            data_source,
        });

        let run_session = session.clone();
        let run_cancel = session_cancel.clone();
        tokio::spawn(async move { run_session.run(run_cancel).await });

        self.registry
            .install_session(&sub.name, SessionHandle::new(session, session_cancel));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::testutil::FixtureFactory;
    use crate::kvstore::testutil::FakeKvStore;

    fn reflector(store: Arc<FakeKvStore>) -> ConfigReflector<FakeKvStore> {
        ConfigReflector::new(
            store,
            Arc::new(Registry::new()),
            Arc::new(FixtureFactory),
            4,
            "|".to_owned(),
        )
    }

    #[tokio::test]
    async fn replay_registers_group_and_subscription() {
        let store = Arc::new(FakeKvStore::new());
        store.seed(4, "TELEMETRY_CLIENT|DestinationGroup_HS", HashMap::from([(
            "dst_addr".to_owned(),
            "127.0.0.1:8080,127.0.0.1:8081".to_owned(),
        )]));
        store.seed(4, "TELEMETRY_CLIENT|Subscription_HS_RDMA", HashMap::from([
            ("dst_group".to_owned(), "HS".to_owned()),
            ("report_type".to_owned(), "stream".to_owned()),
            ("path_target".to_owned(), "COUNTERS_DB".to_owned()),
        ]));

        let reflector = reflector(store);
        reflector.replay_existing(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            reflector.registry.group_destinations("HS"),
            Some(vec!["127.0.0.1:8080".to_owned(), "127.0.0.1:8081".to_owned()])
        );
        assert!(reflector.registry.session("HS_RDMA").is_some());
    }

    #[tokio::test]
    async fn delete_of_in_use_group_is_rejected() {
        let store = Arc::new(FakeKvStore::new());
        store.seed(4, "TELEMETRY_CLIENT|DestinationGroup_HS", HashMap::from([(
            "dst_addr".to_owned(),
            "127.0.0.1:8080".to_owned(),
        )]));
        store.seed(4, "TELEMETRY_CLIENT|Subscription_HS_RDMA", HashMap::from([
            ("dst_group".to_owned(), "HS".to_owned()),
            ("report_type".to_owned(), "stream".to_owned()),
        ]));
        let reflector = reflector(store);
        reflector.replay_existing(&CancellationToken::new()).await.unwrap();

        let err = reflector
            .apply_delete("TELEMETRY_CLIENT|DestinationGroup_HS", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::GroupInUse { .. }));
        assert!(reflector.registry.group_exists("HS"));
    }

    #[tokio::test]
    async fn unsupported_report_type_registers_without_session() {
        let store = Arc::new(FakeKvStore::new());
        store.seed(4, "TELEMETRY_CLIENT|Subscription_LEGACY", HashMap::from([(
            "report_type".to_owned(),
            "once".to_owned(),
        )]));
        let reflector = reflector(store);
        reflector.replay_existing(&CancellationToken::new()).await.ok();

        assert!(reflector.registry.subscription("LEGACY").is_some());
        assert!(reflector.registry.session("LEGACY").is_none());
    }
}
