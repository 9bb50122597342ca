//! Publish Session. One per active subscription; owns the
//! dial/open/transfer loop. Mirrors `solana_client::ws_stream`'s reconnect
//! loop (backoff sleep between attempts, per-session `CancellationToken`
//! child, heartbeat-as-producer-task shape), generalized from a single
//! always-on WebSocket to dial-out gRPC with destination rotation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::datasource::{DataSource, Sample};
use crate::error::Canceled;
use crate::metrics::METRICS;
use crate::model::{Destination, ReportType};
use crate::queue;
use crate::transport::{TlsConfig, TransportClient};
use crate::wire::{self, Notification};

/// Everything the session needs at construction time, snapshotted so it
/// never has to read the Registry again — shared resources are read by
/// sessions only through snapshots taken at session creation time.
pub struct SessionConfig {
    pub name: String,
    pub path_target: String,
    pub destinations: Vec<Destination>,
    pub report_type: ReportType,
    pub report_interval: Duration,
    pub retry_interval: Duration,
    pub src_ip: Option<String>,
    pub tls: TlsConfig,
    pub data_source: Arc<dyn DataSource>,
}

/// One active Publish Session. Constructed by the Config Reflector, then
/// driven by its own `run` task until closed.
pub struct PublishSession {
    config: SessionConfig,
    /// Local stop signal; flipped by `close()`. Distinct from the root
    /// cancellation the Reflector holds.
    stop: CancellationToken,
    opened: std::sync::atomic::AtomicBool,
    dest_index: AtomicUsize,
    transport: parking_lot::Mutex<Option<TransportClient>>,
    /// Current transfer phase's sample queue sender, so `close()` can
    /// dispose it and unblock a stuck producer.
    queue_sender: parking_lot::Mutex<Option<queue::Sender<Sample>>>,
}

impl PublishSession {
    #[must_use]
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            stop: CancellationToken::new(),
            opened: std::sync::atomic::AtomicBool::new(false),
            dest_index: AtomicUsize::new(0),
            transport: parking_lot::Mutex::new(None),
            queue_sender: parking_lot::Mutex::new(None),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Idempotent: a no-op if opened is already false. Non-blocking:
    /// signals the stop token, disposes the queue, and closes the installed
    /// transport, all without awaiting — this can be called while the
    /// Registry's lock is held, so it must never block on it.
    pub fn close(&self) {
        if !self.opened.swap(false, Ordering::AcqRel) {
            return;
        }
        self.stop.cancel();
        if let Some(sender) = self.queue_sender.lock().take() {
            queue::dispose(&sender);
        }
        if let Some(transport) = self.transport.lock().take() {
            transport.close();
        }
    }

    /// Main loop: the NEW → DIALING → STREAM_OPENING → RUNNING →
    /// DRAINING → SLEEP_REDIAL → DIALING cycle, until `root_cancel` or
    /// `close()` fires. Intended to be the body of a single `tokio::spawn`
    /// per session.
    pub async fn run(self: Arc<Self>, root_cancel: CancellationToken) {
        self.opened.store(true, Ordering::Release);

        if !self.config.report_type.is_supported() {
            // "once" (not accepted in this revision) and any unrecognized
            // report type are both logged and ignored: no session started.
            warn!(subscription = %self.config.name, "unsupported report type, session not started");
            self.opened.store(false, Ordering::Release);
            return;
        }

        // The transfer phase only watches the local `stop` token (it has no
        // reason to know about root cancellation). Fold the two together so
        // a session blocked mid-RUNNING phase (e.g. on the stream queue)
        // still drains within bounded time when the process shuts down,
        // rather than only noticing root cancellation at the next dial.
        let root_watcher = {
            let session = self.clone();
            let root_cancel = root_cancel.clone();
            tokio::spawn(async move {
                root_cancel.cancelled().await;
                session.close();
            })
        };

        'outer: loop {
            if self.stop.is_cancelled() || root_cancel.is_cancelled() {
                break 'outer;
            }

            let destination = self.next_destination();
            METRICS.inc_attempt(&self.config.name);
            debug!(subscription = %self.config.name, %destination, "dialing");

            let dial = TransportClient::dial(
                destination,
                self.config.retry_interval,
                self.config.src_ip.as_deref(),
                &self.config.tls,
            );
            let mut transport = tokio::select! {
                biased;
                () = self.stop.cancelled() => break 'outer,
                () = root_cancel.cancelled() => break 'outer,
                result = dial => match result {
                    Ok(transport) => transport,
                    Err(err) => {
                        warn!(subscription = %self.config.name, %destination, error = %err, "dial failed");
                        METRICS.inc_error(&self.config.name);
                        continue 'outer;
                    }
                },
            };

            let (outbound_tx, outbound_rx) = mpsc::channel::<Notification>(1);
            let inbound = match transport.open_publish_stream(ReceiverStream::new(outbound_rx)).await {
                Ok(inbound) => inbound,
                Err(err) => {
                    warn!(subscription = %self.config.name, %destination, error = %err, "stream open failed");
                    METRICS.inc_error(&self.config.name);
                    transport.close();
                    continue 'outer;
                }
            };

            {
                let mut installed = self.transport.lock();
                if installed.is_some() {
                    // duplicate session race: the existing client wins.
                    transport.close();
                    break 'outer;
                }
                *installed = Some(transport);
            }
            info!(subscription = %self.config.name, %destination, "publish stream open");

            Self::drain_inbound(self.clone(), inbound);
            self.run_transfer_phase(outbound_tx).await;

            if let Some(transport) = self.transport.lock().take() {
                transport.close();
            }

            if self.stop.is_cancelled() || root_cancel.is_cancelled() {
                break 'outer;
            }
            tokio::select! {
                biased;
                () = self.stop.cancelled() => break 'outer,
                () = root_cancel.cancelled() => break 'outer,
                () = tokio::time::sleep(self.config.retry_interval) => {},
            }
        }

        if let Some(transport) = self.transport.lock().take() {
            transport.close();
        }
        self.opened.store(false, Ordering::Release);
        root_watcher.abort();
    }

    /// Rotating index snapshot at session creation — the destination list
    /// itself never changes for this session's lifetime (a group
    /// reconfiguration recreates the session instead).
    fn next_destination(&self) -> &str {
        let len = self.config.destinations.len();
        let idx = self.dest_index.fetch_add(1, Ordering::AcqRel) % len;
        &self.config.destinations[idx]
    }

    /// Reads (and discards) inbound messages on the stream: any inbound
    /// message is received but otherwise ignored. Runs detached from the
    /// main loop; it ends on its own when the stream closes.
    fn drain_inbound(session: Arc<Self>, mut inbound: tonic::Streaming<wire::PublishResponse>) {
        tokio::spawn(async move {
            use futures_util::StreamExt;
            while let Some(message) = inbound.next().await {
                match message {
                    Ok(_response) => {
                        METRICS.inc_received(&session.config.name);
                        debug!(subscription = %session.config.name, "inbound message received, ignored");
                    }
                    Err(err) => {
                        debug!(subscription = %session.config.name, error = %err, "inbound stream ended");
                        break;
                    }
                }
            }
        });
    }

    async fn run_transfer_phase(&self, outbound: mpsc::Sender<Notification>) {
        match self.config.report_type {
            ReportType::Periodic => self.run_periodic(outbound).await,
            ReportType::Stream => self.run_stream(outbound).await,
            ReportType::Unknown => unreachable!("unsupported report types never reach the transfer phase"),
        }
    }

    /// Periodic transfer phase.
    async fn run_periodic(&self, outbound: mpsc::Sender<Notification>) {
        loop {
            if self.stop.is_cancelled() {
                return;
            }

            let sample = match self.config.data_source.get().await {
                Ok(sample) => sample,
                Err(err) => {
                    warn!(subscription = %self.config.name, error = %err, "data source error, sample dropped");
                    METRICS.inc_error(&self.config.name);
                    return;
                }
            };

            let notification = wire::build_notification(
                &self.config.path_target,
                sample.timestamp_nanos,
                sample.updates,
            );
            if outbound.send(notification).await.is_err() {
                METRICS.inc_error(&self.config.name);
                return;
            }
            METRICS.inc_sent(&self.config.name);

            tokio::select! {
                biased;
                () = self.stop.cancelled() => return,
                () = tokio::time::sleep(self.config.report_interval) => {},
            }
        }
    }

    /// Stream transfer phase: a producer task feeds the session's
    /// single-slot queue; this routine drains it one item at a time.
    async fn run_stream(&self, outbound: mpsc::Sender<Notification>) {
        let (queue_tx, queue_rx) = queue::channel::<Sample>();
        *self.queue_sender.lock() = Some(queue_tx.clone());

        let data_source = self.config.data_source.clone();
        let mut producer = tokio::spawn(async move { data_source.stream_into(queue_tx).await });
        let mut producer_done = false;

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            // `recv` is listed before the producer-join branch so a value
            // already sitting in the slot (e.g. a trailing sync marker) is
            // always drained before the producer's exit is observed — the
            // single-slot queue guarantees the producer's last `send`
            // completed before its task could return.
            let sample = tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                sample = queue_rx.recv() => sample,
                result = &mut producer, if !producer_done => {
                    producer_done = true;
                    // The change feed ending is a terminal condition, not a
                    // per-sample error, and is treated the same as queue
                    // disposal: the transfer phase ends and the session
                    // restarts.
                    if let Ok(Err(err)) = result {
                        warn!(subscription = %self.config.name, error = %err, "data source producer ended with an error");
                        METRICS.inc_error(&self.config.name);
                    }
                    break;
                }
            };

            match sample {
                Ok(sample) if sample.sync_complete => {
                    let notification = wire::sync_response_notification(&self.config.path_target);
                    if outbound.send(notification).await.is_err() {
                        METRICS.inc_error(&self.config.name);
                        break;
                    }
                    METRICS.inc_sent(&self.config.name);
                }
                Ok(sample) => {
                    let notification = wire::build_notification(
                        &self.config.path_target,
                        sample.timestamp_nanos,
                        sample.updates,
                    );
                    if outbound.send(notification).await.is_err() {
                        METRICS.inc_error(&self.config.name);
                        break;
                    }
                    METRICS.inc_sent(&self.config.name);
                }
                Err(Canceled) => break,
            }
        }

        *self.queue_sender.lock() = None;
        if !producer_done {
            producer.abort();
            let _ = producer.await;
        }
    }
}
