//! End-to-end scenario tests (S1-S6), run against the in-memory `FakeKvStore`
//! and an in-process `tonic` collector standing in for the real companion
//! server. These exercise `LifecycleCoordinator` the way an embedder actually
//! drives it: seed/hset rows, run the coordinator task, observe what the
//! collector received.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dialout_core::datasource::{DataSource, DataSourceFactory, Sample};
use dialout_core::kvstore::testutil::FakeKvStore;
use dialout_core::model::{BootstrapConfig, KvStoreEndpoint};
use dialout_core::queue;
use dialout_core::wire::{
    Notification, PublishResponse, TelemetryPublish, TelemetryPublishServer, Update, Value,
};
use dialout_core::LifecycleCoordinator;
use futures_util::Stream;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tonic::{Request, Response, Status, Streaming};

/// Collector double: records every notification it receives on an unbounded
/// channel and otherwise replies with nothing, matching the unidirectional
/// contract (inbound messages on the publisher side are read and ignored).
struct CapturingCollector {
    received: mpsc::UnboundedSender<Notification>,
}

type ResponseStream = Pin<Box<dyn Stream<Item = Result<PublishResponse, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl TelemetryPublish for CapturingCollector {
    type PublishStream = ResponseStream;

    async fn publish(
        &self,
        request: Request<Streaming<Notification>>,
    ) -> Result<Response<Self::PublishStream>, Status> {
        use futures_util::StreamExt;

        let mut inbound = request.into_inner();
        let tx = self.received.clone();
        tokio::spawn(async move {
            while let Some(Ok(notification)) = inbound.next().await {
                if tx.send(notification).is_err() {
                    break;
                }
            }
        });

        let empty = futures_util::stream::empty::<Result<PublishResponse, Status>>();
        Ok(Response::new(Box::pin(empty) as ResponseStream))
    }
}

/// Starts an in-process collector on an ephemeral port. Returns its address
/// plus a handle whose `abort()` kills the server task (used by the failover
/// scenario to simulate a collector going away).
async fn spawn_collector() -> (String, mpsc::UnboundedReceiver<Notification>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    let collector = CapturingCollector { received: tx };

    let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
    let handle = tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(TelemetryPublishServer::new(collector))
            .serve_with_incoming(incoming)
            .await;
    });

    (addr, rx, handle)
}

/// A fixed sequence of samples, delivered once through the stream transfer
/// phase, followed automatically by a sync-response marker (mirroring the
/// wildcard-snapshot-then-sync shape the real `DataSource` produces).
struct FixedSampleSource {
    samples: Vec<Sample>,
}

#[async_trait]
impl DataSource for FixedSampleSource {
    async fn get(&self) -> Result<Sample, dialout_core::error::ProtocolError> {
        Ok(self.samples.first().cloned().unwrap_or_else(|| Sample::new(0, Vec::new())))
    }

    async fn stream_into(&self, sink: queue::Sender<Sample>) -> Result<(), dialout_core::error::ProtocolError> {
        let last_ts = self.samples.last().map_or(0, |s| s.timestamp_nanos);
        for sample in self.samples.clone() {
            if sink.send(sample).await.is_err() {
                return Ok(());
            }
        }
        let _ = sink.send(Sample::sync_marker(last_ts)).await;
        // Block "forever" (until the queue is disposed by session close) so
        // the producer doesn't race ahead and exit before the test observes
        // the sync marker having been drained.
        std::future::pending::<()>().await;
        Ok(())
    }
}

struct FixedFactory;

impl DataSourceFactory for FixedFactory {
    fn build(&self, _path_target: &str, _paths: &[String]) -> Arc<dyn DataSource> {
        Arc::new(FixedSampleSource {
            samples: vec![Sample::new(
                1,
                vec![Update {
                    path: vec!["Ethernet0".to_owned(), "SAI_PORT_STAT_PFC_7_RX_PKTS".to_owned()],
                    value: Value::JsonIetf(br#"{"SAI_PORT_STAT_PFC_7_RX_PKTS":"2"}"#.to_vec()),
                }],
            )],
        })
    }
}

fn bootstrap() -> BootstrapConfig {
    BootstrapConfig {
        kv_store: KvStoreEndpoint::Tcp {
            host: "127.0.0.1".to_owned(),
            port: 6379,
        },
        config_db: 4,
        separator: "|".to_owned(),
    }
}

/// Polls `rx` until `n` notifications have been observed or `timeout`
/// elapses, returning whatever was collected.
async fn collect_at_least(rx: &mut mpsc::UnboundedReceiver<Notification>, n: usize, timeout: Duration) -> Vec<Notification> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    while out.len() < n && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Some(notification)) => out.push(notification),
            Ok(None) => break,
            Err(_) => {}
        }
    }
    out
}

/// S1 - single collector, stream subscription: the collector should see an
/// update notification carrying the fixture payload, then a sync-response
/// marker.
#[tokio::test]
async fn s1_single_collector_stream_sync() {
    let (addr, mut rx, _server) = spawn_collector().await;

    let store = Arc::new(FakeKvStore::new());
    store.seed(4, "TELEMETRY_CLIENT|DestinationGroup_HS", HashMap::from([(
        "dst_addr".to_owned(),
        addr,
    )]));
    store.seed(4, "TELEMETRY_CLIENT|Subscription_HS_RDMA", HashMap::from([
        ("dst_group".to_owned(), "HS".to_owned()),
        ("report_type".to_owned(), "stream".to_owned()),
        ("path_target".to_owned(), "COUNTERS_DB".to_owned()),
        ("paths".to_owned(), "COUNTERS/Ethernet*".to_owned()),
    ]));

    let coordinator = Arc::new(LifecycleCoordinator::new(store, &bootstrap(), Arc::new(FixedFactory)));
    let run_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.run().await }
    });

    let notifications = collect_at_least(&mut rx, 2, Duration::from_secs(5)).await;
    assert_eq!(notifications.len(), 2, "expected one update followed by one sync marker");
    assert!(!notifications[0].sync_response);
    assert_eq!(notifications[0].prefix.as_ref().unwrap().target, "COUNTERS_DB");
    assert!(notifications[1].sync_response);

    coordinator.shutdown();
    run_handle.abort();
}

/// S2 - failover: the first collector is stopped right after the initial
/// sync; the session should rotate to the second destination and deliver
/// the same fixture payload there.
#[tokio::test]
async fn s2_failover_to_second_destination() {
    let (addr_a, mut rx_a, server_a) = spawn_collector().await;
    let (addr_b, mut rx_b, _server_b) = spawn_collector().await;

    let store = Arc::new(FakeKvStore::new());
    store.seed(4, "TELEMETRY_CLIENT|Global", HashMap::from([(
        "retry_interval".to_owned(),
        "1".to_owned(),
    )]));
    store.seed(4, "TELEMETRY_CLIENT|DestinationGroup_HS", HashMap::from([(
        "dst_addr".to_owned(),
        format!("{addr_a},{addr_b}"),
    )]));
    store.seed(4, "TELEMETRY_CLIENT|Subscription_HS_RDMA", HashMap::from([
        ("dst_group".to_owned(), "HS".to_owned()),
        ("report_type".to_owned(), "stream".to_owned()),
        ("path_target".to_owned(), "COUNTERS_DB".to_owned()),
    ]));

    let coordinator = Arc::new(LifecycleCoordinator::new(store, &bootstrap(), Arc::new(FixedFactory)));
    let run_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.run().await }
    });

    // Wait for the first collector's initial sync, then take it down.
    let _ = collect_at_least(&mut rx_a, 2, Duration::from_secs(5)).await;
    server_a.abort();

    let notifications = collect_at_least(&mut rx_b, 2, Duration::from_secs(5)).await;
    assert_eq!(notifications.len(), 2, "second collector should receive the same sync sequence");
    assert!(notifications[1].sync_response);

    coordinator.shutdown();
    run_handle.abort();
}

/// S3 - destination-group reconfiguration: rewriting `dst_addr` should close
/// the existing session and open a new one against the first address of the
/// new list.
#[tokio::test]
async fn s3_destination_group_reconfiguration() {
    let (addr_old, _rx_old, _server_old) = spawn_collector().await;
    let (addr_new, mut rx_new, _server_new) = spawn_collector().await;

    let store = Arc::new(FakeKvStore::new());
    store.seed(4, "TELEMETRY_CLIENT|DestinationGroup_G", HashMap::from([(
        "dst_addr".to_owned(),
        addr_old,
    )]));
    store.seed(4, "TELEMETRY_CLIENT|Subscription_X", HashMap::from([
        ("dst_group".to_owned(), "G".to_owned()),
        ("report_type".to_owned(), "stream".to_owned()),
        ("path_target".to_owned(), "COUNTERS_DB".to_owned()),
    ]));

    let coordinator = Arc::new(LifecycleCoordinator::new(store.clone(), &bootstrap(), Arc::new(FixedFactory)));
    let run_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.run().await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;

    store.hset(4, "TELEMETRY_CLIENT|DestinationGroup_G", HashMap::from([(
        "dst_addr".to_owned(),
        addr_new,
    )]));

    let notifications = collect_at_least(&mut rx_new, 1, Duration::from_secs(5)).await;
    assert!(!notifications.is_empty(), "new destination should receive the reopened session's traffic");

    coordinator.shutdown();
    run_handle.abort();
}

/// S4 - deleting an in-use destination group is rejected and leaves the
/// Registry unchanged.
#[tokio::test]
async fn s4_delete_in_use_group_is_rejected() {
    let (addr, _rx, _server) = spawn_collector().await;

    let store = Arc::new(FakeKvStore::new());
    store.seed(4, "TELEMETRY_CLIENT|DestinationGroup_G", HashMap::from([(
        "dst_addr".to_owned(),
        addr,
    )]));
    store.seed(4, "TELEMETRY_CLIENT|Subscription_X", HashMap::from([
        ("dst_group".to_owned(), "G".to_owned()),
        ("report_type".to_owned(), "stream".to_owned()),
    ]));

    let coordinator = Arc::new(LifecycleCoordinator::new(store.clone(), &bootstrap(), Arc::new(FixedFactory)));
    let run_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.run().await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;

    store.del(4, "TELEMETRY_CLIENT|DestinationGroup_G");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(coordinator.registry().group_exists("G"));
    assert!(coordinator.registry().session("X").is_some());

    coordinator.shutdown();
    run_handle.abort();
}

/// S5 - deleting a subscription closes its session and removes it (and its
/// group membership) from the Registry.
#[tokio::test]
async fn s5_subscription_delete_closes_session() {
    let (addr, _rx, _server) = spawn_collector().await;

    let store = Arc::new(FakeKvStore::new());
    store.seed(4, "TELEMETRY_CLIENT|DestinationGroup_G", HashMap::from([(
        "dst_addr".to_owned(),
        addr,
    )]));
    store.seed(4, "TELEMETRY_CLIENT|Subscription_X", HashMap::from([
        ("dst_group".to_owned(), "G".to_owned()),
        ("report_type".to_owned(), "stream".to_owned()),
    ]));

    let coordinator = Arc::new(LifecycleCoordinator::new(store.clone(), &bootstrap(), Arc::new(FixedFactory)));
    let run_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.run().await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(coordinator.registry().session("X").is_some());

    store.del(4, "TELEMETRY_CLIENT|Subscription_X");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(coordinator.registry().subscription("X").is_none());
    assert!(coordinator.registry().group_users("G").is_empty());

    coordinator.shutdown();
    run_handle.abort();
}

/// S6 - cancellation: after root cancellation, every session reaches CLOSED
/// (no open transport) within bounded time.
#[tokio::test]
async fn s6_cancellation_closes_all_sessions() {
    let (addr, _rx, _server) = spawn_collector().await;

    let store = Arc::new(FakeKvStore::new());
    store.seed(4, "TELEMETRY_CLIENT|Global", HashMap::from([(
        "retry_interval".to_owned(),
        "1".to_owned(),
    )]));
    store.seed(4, "TELEMETRY_CLIENT|DestinationGroup_G", HashMap::from([(
        "dst_addr".to_owned(),
        addr,
    )]));
    store.seed(4, "TELEMETRY_CLIENT|Subscription_X", HashMap::from([
        ("dst_group".to_owned(), "G".to_owned()),
        ("report_type".to_owned(), "stream".to_owned()),
    ]));

    let coordinator = Arc::new(LifecycleCoordinator::new(store, &bootstrap(), Arc::new(FixedFactory)));
    let run_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.run().await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let session = coordinator.registry().session("X").unwrap().session();
    assert!(session.is_opened());

    coordinator.shutdown();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!session.is_opened());

    run_handle.abort();
}
