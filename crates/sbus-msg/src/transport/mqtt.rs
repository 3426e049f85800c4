//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
//! MQTT publish/subscribe transport.
//!
//! Publishes and the subscription use QoS 2. The subscription is renewed on every
//! ConnAck so it survives broker reconnects. Connection errors are retried under a
//! [`ReconnectPolicy`]; once the policy is exhausted the adapter stops itself.
//! Each topic has one delivery worker, so messages on a topic are processed in
//! the order the broker delivered them.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use sbus_common::MqttConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::reconnect::ReconnectPolicy;
use super::{
    Delivery, DeliveryReceipt, InboundFrame, InboundSink, Lifecycle, OrderedDelivery, Transport,
    TransportState,
};
use crate::envelope::Envelope;
use crate::{BusError, Result};

const TRANSPORT: &str = "mqtt";
const DEFAULT_PORT: u16 = 1883;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Build client options from a `tcp://` or `mqtt://` broker URL.
pub(crate) fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions> {
    let invalid = |reason: String| {
        BusError::Transport(format!("invalid mqtt broker {}: {reason}", config.broker_url))
    };
    let url = Url::parse(&config.broker_url).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "tcp" | "mqtt") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    let host = url
        .host_str()
        .ok_or_else(|| invalid("missing host".to_owned()))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_owned();

    let mut options = MqttOptions::new(
        config.client_id.clone(),
        host,
        url.port().unwrap_or(DEFAULT_PORT),
    );
    options.set_keep_alive(config.keep_alive.max(MIN_KEEP_ALIVE));
    options.set_clean_session(true);
    if !url.username().is_empty() {
        options.set_credentials(url.username(), url.password().unwrap_or_default());
    }
    Ok(options)
}

struct Running {
    client: AsyncClient,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// MQTT implementation of [`Transport`].
pub struct MqttTransport {
    config: MqttConfig,
    options: MqttOptions,
    lifecycle: Arc<Lifecycle>,
    runtime: Mutex<Option<Running>>,
}

impl MqttTransport {
    /// Validate `config` and prepare the client; nothing connects until `start`.
    pub fn new(config: MqttConfig) -> Result<Self> {
        let options = mqtt_options(&config)?;
        Ok(Self {
            config,
            options,
            lifecycle: Arc::new(Lifecycle::new(TRANSPORT)),
            runtime: Mutex::new(None),
        })
    }

    fn client(&self) -> Option<AsyncClient> {
        self.runtime
            .lock()
            .as_ref()
            .map(|running| running.client.clone())
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn name(&self) -> &'static str {
        TRANSPORT
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    fn default_peer(&self) -> String {
        self.config.publish_topic.clone()
    }

    async fn start(&self, sink: Arc<dyn InboundSink>) -> Result<()> {
        self.lifecycle.begin_start()?;
        let (client, eventloop) =
            AsyncClient::new(self.options.clone(), self.config.channel_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let event_loop = BrokerLoop {
            client: client.clone(),
            eventloop,
            topic: self.config.subscribe_topic.clone(),
            sink,
            policy: ReconnectPolicy::from(&self.config.reconnect),
            lifecycle: Arc::clone(&self.lifecycle),
        };
        let task = tokio::spawn(event_loop.run(shutdown_rx));
        *self.runtime.lock() = Some(Running {
            client,
            shutdown,
            task,
        });
        self.lifecycle.mark_running();
        info!(
            broker = %self.config.broker_url,
            client_id = %self.config.client_id,
            subscribe = %self.config.subscribe_topic,
            publish = %self.config.publish_topic,
            "mqtt transport started"
        );
        Ok(())
    }

    async fn send(&self, peer: &str, envelope: &Envelope) -> Result<DeliveryReceipt> {
        self.lifecycle.ensure_running()?;
        let client = self.client().ok_or(BusError::NotRunning {
            transport: TRANSPORT,
            state: self.lifecycle.state(),
        })?;
        let payload = envelope.to_json()?.into_bytes();
        client
            .publish(peer, QoS::ExactlyOnce, false, payload)
            .await
            .map_err(|err| BusError::Transport(format!("mqtt publish to {peer} failed: {err}")))?;
        debug!(topic = peer, action = envelope.action(), "mqtt publish enqueued");
        Ok(DeliveryReceipt::ready(Delivery::Enqueued))
    }

    async fn stop(&self) -> Result<()> {
        let stopping = self.lifecycle.begin_stop();
        let running = self.runtime.lock().take();
        let Some(running) = running else {
            if stopping {
                self.lifecycle.mark_stopped();
            }
            return Ok(());
        };

        let _ = running.shutdown.send(true);
        if let Err(err) = running.task.await {
            warn!(error = %err, "mqtt event loop ended abnormally");
        }
        self.lifecycle.mark_stopped();
        info!("mqtt transport stopped");
        Ok(())
    }
}

struct BrokerLoop {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
    sink: Arc<dyn InboundSink>,
    policy: ReconnectPolicy,
    lifecycle: Arc<Lifecycle>,
}

enum Exit {
    Requested,
    Exhausted,
}

impl BrokerLoop {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut queues: HashMap<String, OrderedDelivery> = HashMap::new();
        let exit = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Exit::Requested;
                    }
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        self.policy.reset();
                        info!(code = ?ack.code, topic = %self.topic, "mqtt connected; subscribing");
                        if let Err(err) = self.client.try_subscribe(self.topic.clone(), QoS::ExactlyOnce) {
                            warn!(topic = %self.topic, error = %err, "mqtt subscribe request failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let frame = InboundFrame {
                            transport: TRANSPORT,
                            source: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        let sink = &self.sink;
                        queues
                            .entry(publish.topic)
                            .or_insert_with(|| OrderedDelivery::spawn(TRANSPORT, Arc::clone(sink)))
                            .push(frame);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, failures = self.policy.failures() + 1, "mqtt connection lost");
                        match self.policy.next_delay() {
                            Some(delay) => {
                                tokio::select! {
                                    _ = tokio::time::sleep(delay) => {}
                                    _ = shutdown.changed() => break Exit::Requested,
                                }
                            }
                            None => break Exit::Exhausted,
                        }
                    }
                },
            }
        };

        match exit {
            Exit::Requested => {
                self.drain(queues).await;
                self.disconnect().await;
            }
            Exit::Exhausted => {
                error!(
                    attempts = self.policy.failures(),
                    "mqtt reconnect attempts exhausted; stopping transport"
                );
                self.lifecycle.begin_stop();
                drain_queues(queues).await;
                self.lifecycle.mark_stopped();
            }
        }
    }

    /// Finish queued deliveries while keeping the event loop turning, so the
    /// QoS 2 handshakes of messages already received can complete. The adapter
    /// is `Stopping` here, so replies those handlers attempt fail with `NotRunning`.
    async fn drain(&mut self, queues: HashMap<String, OrderedDelivery>) {
        let finished = drain_queues(queues);
        tokio::pin!(finished);
        loop {
            tokio::select! {
                _ = &mut finished => return,
                event = self.eventloop.poll() => {
                    if let Err(err) = event {
                        debug!(error = %err, "mqtt unavailable while draining");
                        finished.await;
                        return;
                    }
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.client.try_disconnect().is_err() {
            return;
        }
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
            debug!("mqtt disconnect not flushed before grace period");
        }
    }
}

async fn drain_queues(queues: HashMap<String, OrderedDelivery>) {
    for queue in queues.into_values() {
        queue.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbus_common::ReconnectConfig;

    struct Discard;

    #[async_trait]
    impl InboundSink for Discard {
        async fn deliver(&self, _frame: InboundFrame) -> Result<()> {
            Ok(())
        }
    }

    fn unreachable_config() -> MqttConfig {
        MqttConfig {
            // Port 1 on loopback refuses connections immediately.
            broker_url: "tcp://127.0.0.1:1".into(),
            reconnect: ReconnectConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
            },
            ..MqttConfig::default()
        }
    }

    #[test]
    fn broker_urls_are_validated() {
        for url in ["tcp://localhost:1883", "mqtt://user:pw@broker", "tcp://[::1]:1884"] {
            let config = MqttConfig {
                broker_url: url.into(),
                ..MqttConfig::default()
            };
            assert!(mqtt_options(&config).is_ok(), "{url} should parse");
        }
        for url in ["ws://broker:80", "not a url"] {
            let config = MqttConfig {
                broker_url: url.into(),
                ..MqttConfig::default()
            };
            assert!(MqttTransport::new(config).is_err(), "{url} should be rejected");
        }
    }

    #[test]
    fn options_carry_broker_address() {
        let options = mqtt_options(&MqttConfig::default()).expect("defaults parse");
        assert_eq!(options.broker_address(), ("localhost".to_owned(), 1883));
        assert_eq!(options.client_id(), "sbus-node");
    }

    #[tokio::test]
    async fn send_before_start_is_rejected() {
        let transport = MqttTransport::new(unreachable_config()).expect("transport");
        let envelope =
            Envelope::new("ENVIAR_MENSAGEM", "a", "b", crate::Content::new()).expect("envelope");
        assert!(matches!(
            transport.send("topico/barramento", &envelope).await,
            Err(BusError::NotRunning {
                state: TransportState::Stopped,
                ..
            })
        ));
        transport.stop().await.expect("stop before start is a no-op");
    }

    #[tokio::test]
    async fn exhausted_reconnects_stop_the_adapter() {
        let transport = MqttTransport::new(unreachable_config()).expect("transport");
        transport.start(Arc::new(Discard)).await.expect("start");
        assert!(matches!(
            transport.start(Arc::new(Discard)).await,
            Err(BusError::AlreadyStarted { .. })
        ));

        let stopped = async {
            while transport.state() != TransportState::Stopped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), stopped)
            .await
            .expect("adapter stops itself");

        transport.stop().await.expect("stop after self-stop");
        transport.stop().await.expect("repeated stop");
        assert_eq!(transport.state(), TransportState::Stopped);
    }
}
