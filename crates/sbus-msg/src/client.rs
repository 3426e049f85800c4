//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
//! Process-level façade owning one transport and the dispatch table.
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::archive::{self, ArchiveError};
use crate::envelope::{metadata_keys, Content, Envelope};
use crate::handlers::{Action, HandlerRegistry};
use crate::logging::{log_envelope, BusMetrics, EnvelopeDirection};
use crate::transport::{DeliveryReceipt, InboundFrame, InboundSink, Transport};
use crate::{BusError, Result};

const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// User-visible textual log. Results and errors all land here.
pub trait LogSink: Send + Sync {
    /// Append one entry.
    fn line(&self, text: &str);
}

/// Sink forwarding entries to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn line(&self, text: &str) {
        info!(target: "sbus::log", "{text}");
    }
}

/// Sink recording entries in memory.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogSink {
    /// Empty sink.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of recorded entries.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Whether any entry contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }
}

impl LogSink for MemoryLogSink {
    fn line(&self, text: &str) {
        self.lines.lock().push(text.to_owned());
    }
}

/// Snapshot of client counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    /// Envelopes handed to the transport.
    pub sent: u64,
    /// Inbound frames seen.
    pub received: u64,
    /// Frames that failed to decode and sends that failed.
    pub dropped: u64,
    /// Handler failures and timeouts.
    pub handler_failures: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BusStats {
        BusStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// Shared by the client and the dispatcher so both paths count the same way.
struct Telemetry {
    counters: Counters,
    metrics: Option<BusMetrics>,
    log: Arc<dyn LogSink>,
}

impl Telemetry {
    fn sent(&self) {
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_sent();
        }
    }

    fn received(&self) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_received();
        }
    }

    fn dropped(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_dropped();
        }
    }

    fn handler_failed(&self, action: &str) {
        self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_handler_failure(action);
        }
    }

    fn handler_latency(&self, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_handler_latency(elapsed);
        }
    }
}

/// Builder for [`BusClient`].
pub struct BusClientBuilder {
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    node_name: String,
    log: Arc<dyn LogSink>,
    metrics: Option<BusMetrics>,
    handler_timeout: Duration,
}

impl BusClientBuilder {
    /// Logical address stamped as `origin` on registration envelopes.
    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    /// Destination for results and errors.
    pub fn log_sink(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }

    /// Prometheus handles to update alongside the internal counters.
    pub fn metrics(mut self, metrics: BusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Upper bound on a single handler invocation.
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Wire the dispatcher to the transport.
    pub fn build(self) -> BusClient {
        let telemetry = Arc::new(Telemetry {
            counters: Counters::default(),
            metrics: self.metrics,
            log: self.log,
        });
        let dispatcher = Arc::new(Dispatcher {
            transport: Arc::downgrade(&self.transport),
            registry: self.registry,
            telemetry: Arc::clone(&telemetry),
            handler_timeout: self.handler_timeout,
        });
        BusClient {
            node_name: self.node_name,
            transport: self.transport,
            dispatcher,
            telemetry,
        }
    }
}

/// Glues one [`Transport`] to a [`HandlerRegistry`].
///
/// Switching transport means building a new client.
pub struct BusClient {
    node_name: String,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    telemetry: Arc<Telemetry>,
}

impl BusClient {
    /// Start building a client around `transport` and `registry`.
    pub fn builder(transport: Arc<dyn Transport>, registry: Arc<HandlerRegistry>) -> BusClientBuilder {
        BusClientBuilder {
            transport,
            registry,
            node_name: String::new(),
            log: Arc::new(TracingLogSink),
            metrics: None,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    /// Begin receiving; inbound envelopes are dispatched to the registry.
    pub async fn start(&self) -> Result<()> {
        let sink: Arc<dyn InboundSink> = self.dispatcher.clone();
        self.transport.start(sink).await?;
        info!(transport = self.transport.name(), node = %self.node_name, "bus client started");
        Ok(())
    }

    /// Entry point for locally composed envelopes; sends to the default peer.
    pub async fn on_user_send(&self, envelope: Envelope) -> Result<DeliveryReceipt> {
        let peer = self.transport.default_peer();
        self.send_to(&peer, envelope).await
    }

    /// Stamp the sent timestamp and hand `envelope` to the transport.
    pub async fn send_to(&self, peer: &str, envelope: Envelope) -> Result<DeliveryReceipt> {
        let envelope = envelope.with_timestamp(metadata_keys::SENT);
        log_envelope(EnvelopeDirection::Outbound, self.transport.name(), &envelope);
        match self.transport.send(peer, &envelope).await {
            Ok(receipt) => {
                self.telemetry.sent();
                Ok(receipt)
            }
            Err(err) => {
                self.telemetry.dropped();
                warn!(peer, action = envelope.action(), error = %err, "send failed");
                self.telemetry
                    .log
                    .line(&format!("Failed to send {} to {peer}: {err}", envelope.action()));
                Err(err)
            }
        }
    }

    /// Pack a local service file or directory and send it for registration.
    pub async fn register_service(&self, path: impl AsRef<Path>) -> Result<DeliveryReceipt> {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| ArchiveError::FileNotFound(path.clone()))?;
        let packed_path = path.clone();
        let bytecode = tokio::task::spawn_blocking(move || archive::pack_path(packed_path))
            .await
            .map_err(|err| BusError::Transport(format!("packing task aborted: {err}")))??;

        let envelope = Envelope::new(
            Action::RegisterService.as_str(),
            self.node_name.clone(),
            self.transport.default_peer(),
            Content::new()
                .with("servico", name.clone())
                .with("bytecode", bytecode),
        )?;
        let receipt = self.on_user_send(envelope).await?;
        self.telemetry
            .log
            .line(&format!("Service '{name}' sent for registration on the bus."));
        Ok(receipt)
    }

    /// Stop the transport, letting in-flight handlers finish.
    pub async fn on_shutdown(&self) -> Result<()> {
        self.transport.stop().await?;
        info!(transport = self.transport.name(), "bus client stopped");
        Ok(())
    }

    /// Active transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Logical node address.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BusStats {
        self.telemetry.counters.snapshot()
    }
}

/// Inbound path: decode, stamp, dispatch, reply.
struct Dispatcher {
    transport: Weak<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    telemetry: Arc<Telemetry>,
    handler_timeout: Duration,
}

impl Dispatcher {
    async fn send_reply(&self, reply: Envelope) {
        let Some(transport) = self.transport.upgrade() else {
            warn!(action = reply.action(), "transport gone; reply dropped");
            return;
        };
        let reply = reply.with_timestamp(metadata_keys::SENT);
        let peer = transport.default_peer();
        log_envelope(EnvelopeDirection::Reply, transport.name(), &reply);

        match transport.send(&peer, &reply).await {
            Ok(receipt) => {
                self.telemetry.sent();
                let action = reply.action().to_owned();
                tokio::spawn(async move {
                    match receipt.outcome().await {
                        Ok(delivery) if delivery.is_success() => {}
                        Ok(delivery) => warn!(%action, ?delivery, "reply rejected by peer"),
                        Err(err) => warn!(%action, error = %err, "reply delivery failed"),
                    }
                });
            }
            Err(err) => {
                self.telemetry.dropped();
                warn!(peer = %peer, action = reply.action(), error = %err, "reply send failed");
                self.telemetry
                    .log
                    .line(&format!("Failed to send reply {} to {peer}: {err}", reply.action()));
            }
        }
    }
}

#[async_trait]
impl InboundSink for Dispatcher {
    async fn deliver(&self, frame: InboundFrame) -> Result<()> {
        self.telemetry.received();
        let envelope = match Envelope::from_slice(&frame.payload) {
            Ok(envelope) => envelope.with_timestamp(metadata_keys::RECEIVED),
            Err(err) => {
                self.telemetry.dropped();
                error!(transport = frame.transport, source = %frame.source, error = %err, "discarding inbound payload");
                self.telemetry
                    .log
                    .line(&format!("Discarded message from {}: {err}", frame.source));
                return Err(err);
            }
        };
        log_envelope(EnvelopeDirection::Inbound, frame.transport, &envelope);

        let action = envelope.action().to_owned();
        let handler = self.registry.resolve(&action);
        let started = Instant::now();
        let processed = tokio::time::timeout(self.handler_timeout, handler.process(&envelope)).await;
        self.telemetry.handler_latency(started.elapsed());

        let outcome = match processed {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(source)) => {
                self.telemetry.handler_failed(&action);
                let err = BusError::HandlerFailure { action, source };
                error!(origin = envelope.origin(), error = %err, "handler failed");
                self.telemetry.log.line(&format!("Error: {err}"));
                return Err(err);
            }
            Err(_) => {
                self.telemetry.handler_failed(&action);
                let err = BusError::HandlerTimeout {
                    action,
                    timeout: self.handler_timeout,
                };
                warn!(origin = envelope.origin(), error = %err, retryable = err.is_retryable(), "handler timed out");
                self.telemetry.log.line(&format!("Error: {err}"));
                return Err(err);
            }
        };

        if let Some(reply) = outcome.reply {
            let rendered = reply.to_json().unwrap_or_default();
            self.telemetry.log.line(&format!(
                "Reply generated for {}: {rendered}",
                reply.destination()
            ));
            self.send_reply(reply).await;
        }
        self.telemetry.log.line(&outcome.result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::StubGateway;
    use crate::handlers::{Handler, HandlerError, HandlerOutcome, HandlerSettings};
    use crate::transport::{MemoryHub, MemoryTransport, TransportState};
    use std::path::PathBuf;

    struct Slow;

    #[async_trait]
    impl Handler for Slow {
        async fn process(
            &self,
            _envelope: &Envelope,
        ) -> std::result::Result<HandlerOutcome, HandlerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(HandlerOutcome::text("late"))
        }
    }

    fn registry(dir: &Path) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry::with_builtins(
            HandlerSettings {
                services_dir: dir.join("servicos"),
                models_dir: dir.join("modelos"),
            },
            Arc::new(StubGateway {
                rate: Some(5.0),
                ..StubGateway::default()
            }),
        ))
    }

    fn client(
        transport: MemoryTransport,
        registry: Arc<HandlerRegistry>,
        log: Arc<MemoryLogSink>,
    ) -> BusClient {
        BusClient::builder(Arc::new(transport), registry)
            .node_name("topico/servidor")
            .log_sink(log)
            .handler_timeout(Duration::from_millis(200))
            .build()
    }

    fn frame(payload: &[u8]) -> InboundFrame {
        InboundFrame {
            transport: "memory",
            source: "test".into(),
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn malformed_payload_is_logged_and_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = MemoryLogSink::new();
        let hub = MemoryHub::new();
        let client = client(hub.endpoint("node", "bus"), registry(dir.path()), log.clone());

        let err = client
            .dispatcher
            .deliver(frame(b"{not json"))
            .await
            .expect_err("malformed");
        assert!(matches!(err, BusError::MalformedEnvelope(_)));
        assert!(log.contains("Discarded message from test"));
        assert_eq!(client.stats().dropped, 1);
    }

    #[tokio::test]
    async fn slow_handlers_time_out_as_retryable() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = MemoryLogSink::new();
        let mut registry = HandlerRegistry::with_builtins(
            HandlerSettings {
                services_dir: PathBuf::from(dir.path()),
                models_dir: PathBuf::from(dir.path()),
            },
            Arc::new(StubGateway::default()),
        );
        registry.register("LENTO", Arc::new(Slow));
        let hub = MemoryHub::new();
        let client = client(hub.endpoint("node", "bus"), Arc::new(registry), log.clone());

        let err = client
            .dispatcher
            .deliver(frame(br#"{"action":"LENTO"}"#))
            .await
            .expect_err("timeout");
        assert!(matches!(err, BusError::HandlerTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(client.stats().handler_failures, 1);
    }

    #[tokio::test]
    async fn send_requires_started_transport() {
        let dir = tempfile::tempdir().expect("temp dir");
        let hub = MemoryHub::new();
        let client = client(
            hub.endpoint("node", "bus"),
            registry(dir.path()),
            MemoryLogSink::new(),
        );
        let envelope = Envelope::new("ENVIAR_MENSAGEM", "a", "b", Content::new()).expect("envelope");
        assert!(matches!(
            client.on_user_send(envelope).await,
            Err(BusError::NotRunning { .. })
        ));
        assert_eq!(client.stats().dropped, 1);
    }

    #[tokio::test]
    async fn query_reply_travels_back_to_the_bus() {
        let dir = tempfile::tempdir().expect("temp dir");
        let hub = MemoryHub::new();
        let node_log = MemoryLogSink::new();
        let bus_log = MemoryLogSink::new();
        let node = client(hub.endpoint("node", "bus"), registry(dir.path()), node_log.clone());
        let bus = client(hub.endpoint("bus", "node"), Arc::new(HandlerRegistry::new()), bus_log.clone());
        node.start().await.expect("node start");
        bus.start().await.expect("bus start");

        let query = Envelope::new(
            "CONSULTAR_MOEDA",
            "topico/cliente",
            "topico/servidor",
            Content::new()
                .with("moedaReferencia", "USD")
                .with("moedaDestino", "BRL")
                .with("valorAConverter", 10),
        )
        .expect("envelope");
        bus.on_user_send(query).await.expect("send");

        let replied = async {
            while !bus_log.contains("RESULTADO_CONSULTAR_MOEDA") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), replied)
            .await
            .expect("reply reaches the bus");
        assert!(node_log.contains("Reply generated for topico/cliente"));
        assert!(bus_log.contains("Action RESULTADO_CONSULTAR_MOEDA has no handler defined."));

        node.on_shutdown().await.expect("stop node");
        bus.on_shutdown().await.expect("stop bus");
        assert_eq!(node.transport().state(), TransportState::Stopped);
    }

    #[tokio::test]
    async fn register_service_packs_and_logs() {
        let dir = tempfile::tempdir().expect("temp dir");
        let service = dir.path().join("Calculadora.java");
        std::fs::write(&service, "class Calculadora {}").expect("write");

        let hub = MemoryHub::new();
        let node_log = MemoryLogSink::new();
        let bus_dir = tempfile::tempdir().expect("bus dir");
        let node = client(hub.endpoint("node", "bus"), registry(dir.path()), node_log.clone());
        let bus = client(hub.endpoint("bus", "node"), registry(bus_dir.path()), MemoryLogSink::new());
        node.start().await.expect("node start");
        bus.start().await.expect("bus start");

        node.register_service(&service).await.expect("registered");
        assert!(node_log.contains("Service 'Calculadora' sent for registration on the bus."));

        let stored = bus_dir.path().join("servicos").join("Calculadora");
        let written = async {
            while !stored.is_file() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), written)
            .await
            .expect("bus stores the service");

        let missing = node.register_service(dir.path().join("Nada.java")).await;
        assert!(matches!(
            missing,
            Err(BusError::Archive(ArchiveError::FileNotFound(_)))
        ));

        node.on_shutdown().await.expect("stop node");
        bus.on_shutdown().await.expect("stop bus");
    }
}
