//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
//! CoAP request/response transport over UDP.
//!
//! The server accepts confirmable or non-confirmable POSTs on one resource path
//! and reassembles Block1 uploads up to `max_message_size`. The client sends each
//! envelope as a confirmable POST from an ephemeral socket, splitting it into
//! Block1 blocks when it exceeds `block_size`, retransmitting with exponential
//! backoff, and accepting both piggybacked and separate responses.
//!
//! Dispatch results always travel as separate responses: the server acknowledges
//! a confirmable request as soon as it is complete, so a slow handler never
//! triggers retransmission, and duplicates of a dispatched message id are only
//! re-acknowledged.
use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use coap_lite::{
    CoapOption, ContentFormat, MessageClass, MessageType, Packet, RequestType, ResponseType,
};
use parking_lot::Mutex;
use sbus_common::CoapConfig;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    drain_deliveries, log_join_error, Delivery, DeliveryReceipt, InboundFrame, InboundSink,
    Lifecycle, Transport, TransportState,
};
use crate::envelope::Envelope;
use crate::{BusError, Result};

const TRANSPORT: &str = "coap";
const DEFAULT_PORT: u16 = 5683;
const MAX_DATAGRAM: usize = 65_535;
const EXCHANGE_LIFETIME: Duration = Duration::from_secs(120);

/// Decoded Block1 option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockValue {
    pub(crate) num: u32,
    pub(crate) more: bool,
    pub(crate) szx: u8,
}

impl BlockValue {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let value = (self.num << 4) | (u32::from(self.more) << 3) | u32::from(self.szx & 0x07);
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|byte| **byte == 0).count();
        bytes[skip..].to_vec()
    }

    pub(crate) fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > 3 {
            return None;
        }
        let value = bytes
            .iter()
            .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte));
        let szx = (value & 0x07) as u8;
        if szx == 7 {
            return None;
        }
        Some(Self {
            num: value >> 4,
            more: value & 0x08 != 0,
            szx,
        })
    }
}

fn block_len(szx: u8) -> usize {
    1usize << (szx as usize + 4)
}

fn szx_for(block_size: usize) -> u8 {
    (block_size.max(16).trailing_zeros().saturating_sub(4)).min(6) as u8
}

/// `c.dd` rendering of a message code.
pub(crate) fn status_code(code: MessageClass) -> String {
    let raw = u8::from(code);
    format!("{}.{:02}", raw >> 5, raw & 0x1f)
}

fn is_success(code: MessageClass) -> bool {
    u8::from(code) >> 5 == 2
}

/// Parsed `coap://host:port/path` peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CoapPeer {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) path: Vec<String>,
}

impl CoapPeer {
    pub(crate) fn parse(peer: &str) -> Result<Self> {
        let text = if peer.contains("://") {
            peer.to_owned()
        } else {
            format!("coap://{peer}")
        };
        let invalid = |reason: String| BusError::Transport(format!("invalid coap peer {peer}: {reason}"));
        let url = Url::parse(&text).map_err(|err| invalid(err.to_string()))?;
        if url.scheme() != "coap" {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".to_owned()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let path = url
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|segment| !segment.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            path,
        })
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                BusError::Transport(format!("coap peer {}:{} did not resolve", self.host, self.port))
            })
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// CoAP implementation of [`Transport`].
pub struct CoapTransport {
    config: CoapConfig,
    lifecycle: Lifecycle,
    runtime: Mutex<Option<Running>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl CoapTransport {
    /// Transport configured by `config`; nothing is bound until `start`.
    pub fn new(config: CoapConfig) -> Self {
        Self {
            config,
            lifecycle: Lifecycle::new(TRANSPORT),
            runtime: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Address the server socket is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// POST raw bytes to `peer`. Returns once the first datagram is on the wire.
    pub async fn post_bytes(&self, peer: &str, payload: Vec<u8>) -> Result<DeliveryReceipt> {
        self.lifecycle.ensure_running()?;
        if payload.len() > self.config.max_message_size {
            return Err(BusError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_message_size,
            });
        }
        let shutdown = match self.runtime.lock().as_ref() {
            Some(running) => running.shutdown.subscribe(),
            None => {
                return Err(BusError::NotRunning {
                    transport: TRANSPORT,
                    state: self.lifecycle.state(),
                })
            }
        };

        let peer = CoapPeer::parse(peer)?;
        let target = peer.resolve().await?;
        let bind: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await?;

        let exchange = Exchange {
            socket,
            target,
            path: peer.path,
            token: rand::random::<[u8; 4]>().to_vec(),
            next_message_id: rand::random(),
            szx: szx_for(self.config.block_size),
            ack_timeout: self.config.ack_timeout,
            max_retransmit: self.config.max_retransmit,
        };
        let mut blocks = exchange.blocks(payload);
        let first = blocks.remove(0);
        let first_bytes = exchange.encode(&first)?;
        exchange.socket.send_to(&first_bytes, target).await?;
        debug!(%target, blocks = blocks.len() + 1, "coap request handed off");

        let (tx, receipt) = DeliveryReceipt::pending();
        tokio::spawn(exchange.run(first, first_bytes, blocks, tx, shutdown));
        Ok(receipt)
    }
}

#[async_trait]
impl Transport for CoapTransport {
    fn name(&self) -> &'static str {
        TRANSPORT
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    fn default_peer(&self) -> String {
        self.config.peer.clone()
    }

    async fn start(&self, sink: Arc<dyn InboundSink>) -> Result<()> {
        self.lifecycle.begin_start()?;
        let socket = match UdpSocket::bind(self.config.listen).await {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                self.lifecycle.mark_stopped();
                return Err(err.into());
            }
        };
        let local = match socket.local_addr() {
            Ok(local) => local,
            Err(err) => {
                self.lifecycle.mark_stopped();
                return Err(err.into());
            }
        };
        *self.local_addr.lock() = Some(local);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = Server {
            socket,
            path: normalise_path(&self.config.path),
            max_message_size: self.config.max_message_size,
            sink,
            uploads: HashMap::new(),
            dispatched: HashMap::new(),
        };
        let task = tokio::spawn(server.run(shutdown_rx));
        *self.runtime.lock() = Some(Running { shutdown, task });
        self.lifecycle.mark_running();
        info!(listen = %local, path = %self.config.path, "coap transport started");
        Ok(())
    }

    async fn send(&self, peer: &str, envelope: &Envelope) -> Result<DeliveryReceipt> {
        self.lifecycle.ensure_running()?;
        let payload = envelope.to_json()?.into_bytes();
        self.post_bytes(peer, payload).await
    }

    async fn stop(&self) -> Result<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        let running = self.runtime.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(err) = running.task.await {
                warn!(error = %err, "coap server task ended abnormally");
            }
        }
        *self.local_addr.lock() = None;
        self.lifecycle.mark_stopped();
        info!("coap transport stopped");
        Ok(())
    }
}

fn normalise_path(path: &str) -> String {
    path.trim_matches('/').to_owned()
}

fn request_path(packet: &Packet) -> String {
    packet
        .get_option(CoapOption::UriPath)
        .map(|segments| {
            segments
                .iter()
                .map(|segment| String::from_utf8_lossy(segment).into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

fn block1(packet: &Packet) -> Option<std::result::Result<BlockValue, ()>> {
    packet
        .get_option(CoapOption::Block1)
        .and_then(|values| values.front())
        .map(|value| BlockValue::decode(value).ok_or(()))
}

/// Response matching `request`: piggybacked ACK for CON, fresh NON otherwise.
fn response_for(request: &Packet, status: ResponseType) -> Packet {
    if request.header.get_type() != MessageType::Confirmable {
        return separate_response_for(request, status);
    }
    let mut response = Packet::new();
    response.header.set_type(MessageType::Acknowledgement);
    response.header.message_id = request.header.message_id;
    response.header.code = MessageClass::Response(status);
    response.set_token(request.get_token().to_vec());
    response
}

/// Non-confirmable response correlated to `request` by token only.
fn separate_response_for(request: &Packet, status: ResponseType) -> Packet {
    let mut response = Packet::new();
    response.header.set_type(MessageType::NonConfirmable);
    response.header.message_id = rand::random();
    response.header.code = MessageClass::Response(status);
    response.set_token(request.get_token().to_vec());
    response
}

fn empty_ack(request: &Packet) -> Packet {
    let mut ack = Packet::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.code = MessageClass::Empty;
    ack.header.message_id = request.header.message_id;
    ack
}

struct Upload {
    next: u32,
    body: Vec<u8>,
    touched: Instant,
}

struct Server {
    socket: Arc<UdpSocket>,
    path: String,
    max_message_size: usize,
    sink: Arc<dyn InboundSink>,
    uploads: HashMap<(SocketAddr, Vec<u8>), Upload>,
    dispatched: HashMap<(SocketAddr, u16), Instant>,
}

impl Server {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, source)) => self.on_datagram(&buffer[..len], source, &mut tasks).await,
                    Err(err) => warn!(error = %err, "coap receive failed"),
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join_error(TRANSPORT, joined),
            }
        }
        drain_deliveries(TRANSPORT, &mut tasks).await;
    }

    async fn on_datagram(&mut self, bytes: &[u8], source: SocketAddr, tasks: &mut JoinSet<()>) {
        let request = match Packet::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(%source, error = ?err, "discarding datagram that is not a coap message");
                return;
            }
        };
        let method = match request.header.code {
            MessageClass::Request(method) => method,
            // Stray ACKs, resets and responses are not for the server.
            _ => return,
        };

        let confirmable = request.header.get_type() == MessageType::Confirmable;
        let exchange = (source, request.header.message_id);
        if confirmable && self.dispatched.contains_key(&exchange) {
            // Retransmission of a request already being handled.
            send_packet(&self.socket, empty_ack(&request), source).await;
            return;
        }

        if method != RequestType::Post {
            self.respond(&request, ResponseType::MethodNotAllowed, source, None, b"")
                .await;
            return;
        }
        if request_path(&request) != self.path {
            self.respond(&request, ResponseType::NotFound, source, None, b"")
                .await;
            return;
        }

        let (payload, block) = match block1(&request) {
            None => (request.payload.clone(), None),
            Some(Err(())) => {
                self.respond(&request, ResponseType::BadOption, source, None, b"")
                    .await;
                return;
            }
            Some(Ok(block)) => match self.reassemble(&request, block, source) {
                Reassembly::Complete(payload) => (payload, Some(block)),
                Reassembly::Continue => {
                    self.respond(&request, ResponseType::Continue, source, Some(block), b"")
                        .await;
                    return;
                }
                Reassembly::Failed(status) => {
                    self.respond(&request, status, source, Some(block), b"")
                        .await;
                    return;
                }
            },
        };

        if payload.len() > self.max_message_size {
            self.respond(&request, ResponseType::RequestEntityTooLarge, source, None, b"")
                .await;
            return;
        }

        if confirmable {
            self.dispatched
                .retain(|_, seen| seen.elapsed() < EXCHANGE_LIFETIME);
            self.dispatched.insert(exchange, Instant::now());
            send_packet(&self.socket, empty_ack(&request), source).await;
        }

        let socket = Arc::clone(&self.socket);
        let sink = Arc::clone(&self.sink);
        tasks.spawn(async move {
            let frame = InboundFrame {
                transport: TRANSPORT,
                source: source.to_string(),
                payload,
            };
            let (status, reason) = match sink.deliver(frame).await {
                Ok(()) => (ResponseType::Changed, String::new()),
                Err(err) => (ResponseType::InternalServerError, err.to_string()),
            };
            let mut response = separate_response_for(&request, status);
            if let Some(block) = block {
                response.add_option(CoapOption::Block1, block.encode());
            }
            response.payload = reason.into_bytes();
            send_packet(&socket, response, source).await;
        });
    }

    fn reassemble(&mut self, request: &Packet, block: BlockValue, source: SocketAddr) -> Reassembly {
        let key = (source, request.get_token().to_vec());
        if block.num == 0 {
            self.uploads
                .retain(|_, upload| upload.touched.elapsed() < EXCHANGE_LIFETIME);
            self.uploads.insert(
                key.clone(),
                Upload {
                    next: 0,
                    body: Vec::new(),
                    touched: Instant::now(),
                },
            );
        }

        let Some(upload) = self.uploads.get_mut(&key) else {
            return Reassembly::Failed(ResponseType::RequestEntityIncomplete);
        };
        if block.num + 1 == upload.next && block.more {
            // Retransmitted block whose Continue was lost.
            return Reassembly::Continue;
        }
        if block.num != upload.next {
            self.uploads.remove(&key);
            return Reassembly::Failed(ResponseType::RequestEntityIncomplete);
        }

        upload.body.extend_from_slice(&request.payload);
        upload.next += 1;
        upload.touched = Instant::now();
        if upload.body.len() > self.max_message_size {
            self.uploads.remove(&key);
            return Reassembly::Failed(ResponseType::RequestEntityTooLarge);
        }
        if block.more {
            return Reassembly::Continue;
        }
        match self.uploads.remove(&key) {
            Some(upload) => Reassembly::Complete(upload.body),
            None => Reassembly::Failed(ResponseType::RequestEntityIncomplete),
        }
    }

    async fn respond(
        &self,
        request: &Packet,
        status: ResponseType,
        source: SocketAddr,
        block: Option<BlockValue>,
        reason: &[u8],
    ) {
        let mut response = response_for(request, status);
        if let Some(block) = block {
            response.add_option(CoapOption::Block1, block.encode());
        }
        response.payload = reason.to_vec();
        send_packet(&self.socket, response, source).await;
    }
}

enum Reassembly {
    Complete(Vec<u8>),
    Continue,
    Failed(ResponseType),
}

async fn send_packet(socket: &UdpSocket, response: Packet, target: SocketAddr) {
    let code = status_code(response.header.code);
    match response.to_bytes() {
        Ok(bytes) => {
            if let Err(err) = socket.send_to(&bytes, target).await {
                warn!(%target, status = %code, error = %err, "failed to send coap response");
            } else {
                debug!(%target, status = %code, "coap response sent");
            }
        }
        Err(err) => warn!(%target, status = %code, error = ?err, "failed to encode coap response"),
    }
}

/// Client side of one POST, possibly spanning several blocks.
struct Exchange {
    socket: UdpSocket,
    target: SocketAddr,
    path: Vec<String>,
    token: Vec<u8>,
    next_message_id: u16,
    szx: u8,
    ack_timeout: Duration,
    max_retransmit: u32,
}

impl Exchange {
    fn blocks(&self, payload: Vec<u8>) -> Vec<Packet> {
        let block_size = block_len(self.szx);
        if payload.len() <= block_size {
            return vec![self.packet(0, payload, None)];
        }
        let chunks: Vec<&[u8]> = payload.chunks(block_size).collect();
        let last = chunks.len() - 1;
        chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let block = BlockValue {
                    num: index as u32,
                    more: index < last,
                    szx: self.szx,
                };
                self.packet(index, chunk.to_vec(), Some(block))
            })
            .collect()
    }

    fn packet(&self, index: usize, payload: Vec<u8>, block: Option<BlockValue>) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(RequestType::Post);
        packet.header.message_id = self.next_message_id.wrapping_add(index as u16);
        packet.set_token(self.token.clone());
        for segment in &self.path {
            packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
        packet.set_content_format(ContentFormat::ApplicationJSON);
        if let Some(block) = block {
            packet.add_option(CoapOption::Block1, block.encode());
        }
        packet.payload = payload;
        packet
    }

    fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
        packet
            .to_bytes()
            .map_err(|err| BusError::Transport(format!("failed to encode coap request: {err:?}")))
    }

    async fn run(
        self,
        first: Packet,
        first_bytes: Vec<u8>,
        rest: Vec<Packet>,
        outcome: oneshot::Sender<Result<Delivery>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let result = tokio::select! {
            result = self.transfer(first, first_bytes, rest) => result,
            _ = shutdown.changed() => Err(BusError::Transport(
                "coap transport stopped before the peer answered".to_owned(),
            )),
        };
        match &result {
            Ok(delivery) => debug!(target = %self.target, ?delivery, "coap exchange finished"),
            Err(err) => warn!(target = %self.target, error = %err, "coap exchange failed"),
        }
        let _ = outcome.send(result);
    }

    async fn transfer(&self, first: Packet, first_bytes: Vec<u8>, rest: Vec<Packet>) -> Result<Delivery> {
        let mut response = self.confirm(&first, first_bytes, true).await?;
        for packet in rest {
            if response.header.code != MessageClass::Response(ResponseType::Continue) {
                break;
            }
            let bytes = self.encode(&packet)?;
            response = self.confirm(&packet, bytes, false).await?;
        }

        let status = status_code(response.header.code);
        if is_success(response.header.code) {
            Ok(Delivery::Acknowledged { status })
        } else {
            Ok(Delivery::Rejected {
                status,
                reason: String::from_utf8_lossy(&response.payload).into_owned(),
            })
        }
    }

    /// Send one confirmable packet until its response arrives.
    async fn confirm(&self, request: &Packet, bytes: Vec<u8>, already_sent: bool) -> Result<Packet> {
        let message_id = request.header.message_id;
        let mut timeout = self.ack_timeout;
        let mut retransmissions = 0u32;
        let mut acknowledged = false;
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        if !already_sent {
            self.socket.send_to(&bytes, self.target).await?;
        }

        loop {
            let wait = if acknowledged {
                self.separate_response_wait()
            } else {
                timeout
            };
            let received = match tokio::time::timeout(wait, self.socket.recv_from(&mut buffer)).await {
                Ok(received) => received?,
                Err(_) if acknowledged => {
                    return Err(BusError::Transport(format!(
                        "separate response from {} timed out",
                        self.target
                    )))
                }
                Err(_) => {
                    if retransmissions >= self.max_retransmit {
                        return Err(BusError::Transport(format!(
                            "no acknowledgement from {} after {} attempts",
                            self.target,
                            retransmissions + 1
                        )));
                    }
                    retransmissions += 1;
                    timeout = timeout.saturating_mul(2);
                    debug!(target = %self.target, message_id, retransmissions, "retransmitting coap request");
                    self.socket.send_to(&bytes, self.target).await?;
                    continue;
                }
            };

            let (len, from) = received;
            if from != self.target {
                continue;
            }
            let Ok(packet) = Packet::from_bytes(&buffer[..len]) else {
                continue;
            };

            match packet.header.get_type() {
                MessageType::Acknowledgement if packet.header.message_id == message_id => {
                    if packet.header.code == MessageClass::Empty {
                        acknowledged = true;
                        continue;
                    }
                    return Ok(packet);
                }
                MessageType::Reset if packet.header.message_id == message_id => {
                    return Err(BusError::Transport(format!(
                        "coap peer {} reset the request",
                        self.target
                    )));
                }
                MessageType::Confirmable | MessageType::NonConfirmable
                    if packet.get_token() == self.token.as_slice()
                        && matches!(packet.header.code, MessageClass::Response(_)) =>
                {
                    if packet.header.get_type() == MessageType::Confirmable {
                        self.acknowledge(&packet).await;
                    }
                    return Ok(packet);
                }
                _ => continue,
            }
        }
    }

    fn separate_response_wait(&self) -> Duration {
        self.ack_timeout
            .saturating_mul(2u32.saturating_pow(self.max_retransmit.min(8)))
    }

    async fn acknowledge(&self, response: &Packet) {
        if let Ok(bytes) = empty_ack(response).to_bytes() {
            if let Err(err) = self.socket.send_to(&bytes, self.target).await {
                debug!(target = %self.target, error = %err, "failed to acknowledge separate response");
            }
        }
    }
}
