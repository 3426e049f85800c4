//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
//! Wire transports behind a single [`Transport`] trait.
//!
//! Every adapter follows `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//! Sends are only accepted while `Running`. Stopping denies new sends first, then
//! lets in-flight inbound deliveries finish before sockets are released.
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sbus_common::{AppConfig, TransportKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::warn;

use crate::envelope::Envelope;
use crate::{BusError, Result};

pub mod coap;
pub mod memory;
pub mod mqtt;
pub mod reconnect;

pub use coap::CoapTransport;
pub use memory::{MemoryHub, MemoryTransport};
pub use mqtt::MqttTransport;
pub use reconnect::ReconnectPolicy;

/// Lifecycle state of a transport adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Not listening; sends are rejected.
    Stopped,
    /// Acquiring sockets or connections.
    Starting,
    /// Listening and accepting sends.
    Running,
    /// Draining in-flight deliveries.
    Stopping,
}

/// Raw inbound payload handed to the bus client.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Name of the transport that received the payload.
    pub transport: &'static str,
    /// Peer address or topic the payload came from.
    pub source: String,
    /// Undecoded bytes.
    pub payload: Vec<u8>,
}

/// Receiver of inbound frames. Implemented by the bus client's dispatcher.
#[async_trait]
pub trait InboundSink: Send + Sync {
    /// Decode and process one frame. An error means the frame was rejected.
    async fn deliver(&self, frame: InboundFrame) -> Result<()>;
}

/// Final disposition of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to a broker queue; no end-to-end confirmation exists.
    Enqueued,
    /// The peer acknowledged with a success status.
    Acknowledged {
        /// Status code, e.g. `2.04`.
        status: String,
    },
    /// The peer answered with an error status.
    Rejected {
        /// Status code, e.g. `5.00`.
        status: String,
        /// Diagnostic text from the peer, possibly empty.
        reason: String,
    },
}

impl Delivery {
    /// Whether the send reached its target without an error status.
    pub fn is_success(&self) -> bool {
        !matches!(self, Delivery::Rejected { .. })
    }
}

/// Handle to the asynchronous outcome of a send.
///
/// The send call returns once the bytes are handed off locally; awaiting
/// [`DeliveryReceipt::outcome`] waits for the peer.
#[derive(Debug)]
pub struct DeliveryReceipt {
    outcome: oneshot::Receiver<Result<Delivery>>,
}

impl DeliveryReceipt {
    /// Receipt that is already resolved.
    pub fn ready(delivery: Delivery) -> Self {
        let (tx, receipt) = Self::pending();
        let _ = tx.send(Ok(delivery));
        receipt
    }

    /// Unresolved receipt together with the sender that resolves it.
    pub fn pending() -> (oneshot::Sender<Result<Delivery>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { outcome: rx })
    }

    /// Wait for the delivery outcome.
    pub async fn outcome(self) -> Result<Delivery> {
        self.outcome.await.map_err(|_| {
            BusError::Transport("delivery abandoned before completion".to_owned())
        })?
    }
}

/// Envelope send/receive over one concrete wire protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable transport name for logging.
    fn name(&self) -> &'static str;
    /// Current lifecycle state.
    fn state(&self) -> TransportState;
    /// Peer address used for replies and user sends.
    fn default_peer(&self) -> String;
    /// Begin listening; frames go to `sink`.
    async fn start(&self, sink: Arc<dyn InboundSink>) -> Result<()>;
    /// Serialize and transmit `envelope` to `peer`.
    async fn send(&self, peer: &str, envelope: &Envelope) -> Result<DeliveryReceipt>;
    /// Release sockets and connections. Safe to call repeatedly.
    async fn stop(&self) -> Result<()>;
}

/// Instantiate the transport selected by `config.node.transport`.
pub fn build_transport(config: &AppConfig) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match config.node.transport {
        TransportKind::Coap => Arc::new(CoapTransport::new(config.coap.clone())),
        TransportKind::Mqtt => Arc::new(MqttTransport::new(config.mqtt.clone())?),
    };
    Ok(transport)
}

/// Shared state machine guarding adapter transitions.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    transport: &'static str,
    state: Mutex<TransportState>,
}

impl Lifecycle {
    pub(crate) fn new(transport: &'static str) -> Self {
        Self {
            transport,
            state: Mutex::new(TransportState::Stopped),
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub(crate) fn begin_start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != TransportState::Stopped {
            return Err(BusError::AlreadyStarted {
                transport: self.transport,
                state: *state,
            });
        }
        *state = TransportState::Starting;
        Ok(())
    }

    pub(crate) fn mark_running(&self) {
        *self.state.lock() = TransportState::Running;
    }

    /// Move to `Stopping`; returns false when there is nothing to stop.
    pub(crate) fn begin_stop(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            TransportState::Running | TransportState::Starting => {
                *state = TransportState::Stopping;
                true
            }
            TransportState::Stopping | TransportState::Stopped => false,
        }
    }

    pub(crate) fn mark_stopped(&self) {
        *self.state.lock() = TransportState::Stopped;
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        let state = self.state();
        if state != TransportState::Running {
            return Err(BusError::NotRunning {
                transport: self.transport,
                state,
            });
        }
        Ok(())
    }
}

/// Single-worker queue handing frames to a sink one at a time, in arrival order.
///
/// A frame is only delivered after the previous one has been fully processed.
pub(crate) struct OrderedDelivery {
    transport: &'static str,
    queue: mpsc::UnboundedSender<InboundFrame>,
    worker: JoinHandle<()>,
}

impl OrderedDelivery {
    pub(crate) fn spawn(transport: &'static str, sink: Arc<dyn InboundSink>) -> Self {
        let (queue, mut frames) = mpsc::unbounded_channel::<InboundFrame>();
        let worker = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                // Failures are already reported by the sink.
                let _ = sink.deliver(frame).await;
            }
        });
        Self {
            transport,
            queue,
            worker,
        }
    }

    pub(crate) fn push(&self, frame: InboundFrame) {
        if self.queue.send(frame).is_err() {
            warn!(transport = self.transport, "delivery worker gone; frame dropped");
        }
    }

    /// Close the queue and wait until every queued frame has been delivered.
    pub(crate) async fn drain(self) {
        let Self {
            transport,
            queue,
            worker,
        } = self;
        drop(queue);
        log_join_error(transport, worker.await);
    }
}

/// Wait for every tracked delivery to finish.
pub(crate) async fn drain_deliveries(transport: &'static str, tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        log_join_error(transport, joined);
    }
}

pub(crate) fn log_join_error(
    transport: &'static str,
    joined: std::result::Result<(), tokio::task::JoinError>,
) {
    if let Err(err) = joined {
        warn!(transport, error = %err, "inbound delivery task aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_follows_state_machine() {
        let lifecycle = Lifecycle::new("test");
        assert!(matches!(
            lifecycle.ensure_running(),
            Err(BusError::NotRunning {
                state: TransportState::Stopped,
                ..
            })
        ));

        lifecycle.begin_start().expect("start from stopped");
        assert_eq!(lifecycle.state(), TransportState::Starting);
        assert!(matches!(
            lifecycle.begin_start(),
            Err(BusError::AlreadyStarted { .. })
        ));

        lifecycle.mark_running();
        lifecycle.ensure_running().expect("running");

        assert!(lifecycle.begin_stop());
        // Draining adapters refuse sends, including replies from in-flight handlers.
        assert!(matches!(
            lifecycle.ensure_running(),
            Err(BusError::NotRunning {
                state: TransportState::Stopping,
                ..
            })
        ));
        assert!(!lifecycle.begin_stop());
        lifecycle.mark_stopped();
        assert!(!lifecycle.begin_stop());
    }

    #[tokio::test]
    async fn receipts_resolve_once() {
        let receipt = DeliveryReceipt::ready(Delivery::Enqueued);
        assert_eq!(receipt.outcome().await.expect("ready"), Delivery::Enqueued);

        let (tx, receipt) = DeliveryReceipt::pending();
        drop(tx);
        assert!(matches!(
            receipt.outcome().await,
            Err(BusError::Transport(_))
        ));
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InboundSink for Recorder {
        async fn deliver(&self, frame: InboundFrame) -> Result<()> {
            // Earlier frames take longer, so concurrent delivery would reorder them.
            let delay = 40u64.saturating_sub(frame.payload.len() as u64 * 10);
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            self.seen.lock().push(frame.source);
            Ok(())
        }
    }

    #[tokio::test]
    async fn ordered_delivery_keeps_arrival_order_and_drains() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let ordered = OrderedDelivery::spawn("test", recorder.clone());
        for index in 0..4 {
            ordered.push(InboundFrame {
                transport: "test",
                source: format!("frame-{index}"),
                payload: vec![0; index],
            });
        }
        ordered.drain().await;
        assert_eq!(
            *recorder.seen.lock(),
            vec!["frame-0", "frame-1", "frame-2", "frame-3"]
        );
    }

    #[test]
    fn rejected_is_not_success() {
        assert!(Delivery::Enqueued.is_success());
        assert!(!Delivery::Rejected {
            status: "5.00".into(),
            reason: String::new()
        }
        .is_success());
    }
}
