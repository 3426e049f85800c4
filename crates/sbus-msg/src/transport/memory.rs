//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
//! Loopback transport connecting named endpoints inside one process.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{
    Delivery, DeliveryReceipt, InboundFrame, InboundSink, Lifecycle, OrderedDelivery, Transport,
    TransportState,
};
use crate::envelope::Envelope;
use crate::{BusError, Result};

const TRANSPORT: &str = "memory";

/// Registry of running in-memory endpoints.
#[derive(Debug, Default)]
pub struct MemoryHub {
    endpoints: Mutex<HashMap<String, mpsc::UnboundedSender<InboundFrame>>>,
}

impl MemoryHub {
    /// Create a shared hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Endpoint called `name` whose default peer is `default_peer`.
    pub fn endpoint(
        self: &Arc<Self>,
        name: impl Into<String>,
        default_peer: impl Into<String>,
    ) -> MemoryTransport {
        MemoryTransport {
            hub: Arc::clone(self),
            name: name.into(),
            default_peer: default_peer.into(),
            lifecycle: Lifecycle::new(TRANSPORT),
            runtime: Mutex::new(None),
        }
    }

    fn route(&self, peer: &str) -> Option<mpsc::UnboundedSender<InboundFrame>> {
        self.endpoints.lock().get(peer).cloned()
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// In-memory [`Transport`] attached to a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    name: String,
    default_peer: String,
    lifecycle: Lifecycle,
    runtime: Mutex<Option<Running>>,
}

impl MemoryTransport {
    /// Endpoint name peers address this transport by.
    pub fn endpoint_name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        TRANSPORT
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    fn default_peer(&self) -> String {
        self.default_peer.clone()
    }

    async fn start(&self, sink: Arc<dyn InboundSink>) -> Result<()> {
        self.lifecycle.begin_start()?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut endpoints = self.hub.endpoints.lock();
            if endpoints.contains_key(&self.name) {
                self.lifecycle.mark_stopped();
                return Err(BusError::Transport(format!(
                    "memory endpoint {} is already registered",
                    self.name
                )));
            }
            endpoints.insert(self.name.clone(), tx);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(receive_loop(rx, sink, shutdown_rx));
        *self.runtime.lock() = Some(Running { shutdown, task });
        self.lifecycle.mark_running();
        info!(endpoint = %self.name, "memory transport started");
        Ok(())
    }

    async fn send(&self, peer: &str, envelope: &Envelope) -> Result<DeliveryReceipt> {
        self.lifecycle.ensure_running()?;
        let payload = envelope.to_json()?.into_bytes();
        let route = self
            .hub
            .route(peer)
            .ok_or_else(|| BusError::Transport(format!("no memory endpoint named {peer}")))?;
        route
            .send(InboundFrame {
                transport: TRANSPORT,
                source: self.name.clone(),
                payload,
            })
            .map_err(|_| BusError::Transport(format!("memory endpoint {peer} closed")))?;
        debug!(endpoint = %self.name, peer, "memory frame enqueued");
        Ok(DeliveryReceipt::ready(Delivery::Enqueued))
    }

    async fn stop(&self) -> Result<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        self.hub.endpoints.lock().remove(&self.name);
        let running = self.runtime.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(err) = running.task.await {
                debug!(endpoint = %self.name, error = %err, "memory receive loop ended abnormally");
            }
        }
        self.lifecycle.mark_stopped();
        info!(endpoint = %self.name, "memory transport stopped");
        Ok(())
    }
}

async fn receive_loop(
    mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
    sink: Arc<dyn InboundSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ordered = OrderedDelivery::spawn(TRANSPORT, sink);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            frame = inbound.recv() => match frame {
                Some(frame) => ordered.push(frame),
                None => break,
            },
        }
    }
    ordered.drain().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Content;

    struct Collect(mpsc::UnboundedSender<InboundFrame>);

    #[async_trait]
    impl InboundSink for Collect {
        async fn deliver(&self, frame: InboundFrame) -> Result<()> {
            let _ = self.0.send(frame);
            Ok(())
        }
    }

    #[tokio::test]
    async fn frames_reach_named_peer() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a", "b");
        let b = hub.endpoint("b", "a");
        let (tx, mut rx) = mpsc::unbounded_channel();
        a.start(Arc::new(Collect(mpsc::unbounded_channel().0)))
            .await
            .expect("start a");
        b.start(Arc::new(Collect(tx))).await.expect("start b");

        let envelope = Envelope::new("ENVIAR_MENSAGEM", "a", "b", Content::new()).expect("envelope");
        let receipt = a.send(&a.default_peer(), &envelope).await.expect("send");
        assert_eq!(receipt.outcome().await.expect("outcome"), Delivery::Enqueued);

        let frame = rx.recv().await.expect("frame");
        assert_eq!(frame.source, "a");
        assert_eq!(
            Envelope::from_slice(&frame.payload).expect("decode"),
            envelope
        );

        a.stop().await.expect("stop a");
        b.stop().await.expect("stop b");
    }

    struct SlowFirst {
        seen: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl InboundSink for SlowFirst {
        async fn deliver(&self, frame: InboundFrame) -> Result<()> {
            let envelope = Envelope::from_slice(&frame.payload).expect("decode");
            if envelope.action() == "PRIMEIRA" {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            let _ = self.seen.send(envelope.action().to_owned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn frames_are_delivered_in_send_order() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a", "b");
        let b = hub.endpoint("b", "a");
        let (tx, mut rx) = mpsc::unbounded_channel();
        a.start(Arc::new(Collect(mpsc::unbounded_channel().0)))
            .await
            .expect("start a");
        b.start(Arc::new(SlowFirst { seen: tx }))
            .await
            .expect("start b");

        for action in ["PRIMEIRA", "SEGUNDA", "TERCEIRA"] {
            let envelope = Envelope::new(action, "a", "b", Content::new()).expect("envelope");
            a.send("b", &envelope).await.expect("send");
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.expect("delivered"));
        }
        assert_eq!(order, vec!["PRIMEIRA", "SEGUNDA", "TERCEIRA"]);

        a.stop().await.expect("stop a");
        b.stop().await.expect("stop b");
    }

    #[tokio::test]
    async fn send_requires_running_and_known_peer() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a", "nobody");
        let envelope = Envelope::new("X", "a", "nobody", Content::new()).expect("envelope");
        assert!(matches!(
            a.send("nobody", &envelope).await,
            Err(BusError::NotRunning { .. })
        ));

        a.start(Arc::new(Collect(mpsc::unbounded_channel().0)))
            .await
            .expect("start");
        assert!(matches!(
            a.send("nobody", &envelope).await,
            Err(BusError::Transport(_))
        ));

        a.stop().await.expect("stop");
        a.stop().await.expect("second stop is a no-op");
        assert_eq!(a.state(), TransportState::Stopped);
    }

    #[tokio::test]
    async fn duplicate_endpoint_names_are_rejected() {
        let hub = MemoryHub::new();
        let first = hub.endpoint("same", "x");
        let second = hub.endpoint("same", "x");
        first
            .start(Arc::new(Collect(mpsc::unbounded_channel().0)))
            .await
            .expect("first");
        assert!(second
            .start(Arc::new(Collect(mpsc::unbounded_channel().0)))
            .await
            .is_err());
        assert_eq!(second.state(), TransportState::Stopped);
        first.stop().await.expect("stop");
    }
}
