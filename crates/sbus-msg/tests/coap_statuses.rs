//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
//! Error statuses of the CoAP server, observed over loopback.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use sbus_common::CoapConfig;
use sbus_msg::{BusError, CoapTransport, Delivery, InboundFrame, InboundSink, Transport};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const SERVER_LIMIT: usize = 256;
const CLIENT_LIMIT: usize = 4096;

struct Recorder(mpsc::UnboundedSender<Vec<u8>>);

#[async_trait]
impl InboundSink for Recorder {
    async fn deliver(&self, frame: InboundFrame) -> sbus_msg::Result<()> {
        let _ = self.0.send(frame.payload);
        Ok(())
    }
}

fn config(peer: &str, block_size: usize, max_message_size: usize) -> CoapConfig {
    CoapConfig {
        listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        path: "servidor".to_owned(),
        peer: peer.to_owned(),
        block_size,
        max_message_size,
        ack_timeout: Duration::from_millis(500),
        max_retransmit: 3,
    }
}

/// Server with a small message limit plus a client sending 64-byte blocks.
struct Loopback {
    server: CoapTransport,
    client: CoapTransport,
    delivered: mpsc::UnboundedReceiver<Vec<u8>>,
    server_addr: SocketAddr,
}

impl Loopback {
    async fn start() -> Self {
        let server = CoapTransport::new(config("coap://127.0.0.1:9/servidor", 64, SERVER_LIMIT));
        let (tx, delivered) = mpsc::unbounded_channel();
        server.start(Arc::new(Recorder(tx))).await.expect("server start");
        let server_addr = server.local_addr().expect("server bound");

        let client = CoapTransport::new(config(
            &format!("coap://{server_addr}/servidor"),
            64,
            CLIENT_LIMIT,
        ));
        let (sink, _) = mpsc::unbounded_channel();
        client.start(Arc::new(Recorder(sink))).await.expect("client start");
        Self {
            server,
            client,
            delivered,
            server_addr,
        }
    }

    async fn post(&self, peer: &str, payload: Vec<u8>) -> Delivery {
        let receipt = self.client.post_bytes(peer, payload).await.expect("post");
        tokio::time::timeout(Duration::from_secs(10), receipt.outcome())
            .await
            .expect("outcome within deadline")
            .expect("exchange completed")
    }

    async fn stop(self) {
        self.client.stop().await.expect("client stop");
        self.server.stop().await.expect("server stop");
    }
}

fn request(method: RequestType, message_id: u16, payload: Vec<u8>) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_type(MessageType::Confirmable);
    packet.header.code = MessageClass::Request(method);
    packet.header.message_id = message_id;
    packet.set_token(vec![0xbe, 0xef]);
    packet.add_option(CoapOption::UriPath, b"servidor".to_vec());
    packet.payload = payload;
    packet
}

async fn exchange(socket: &UdpSocket, target: SocketAddr, request: &Packet) -> Packet {
    let bytes = request.to_bytes().expect("encode request");
    socket.send_to(&bytes, target).await.expect("send request");
    let mut buffer = vec![0u8; 2048];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buffer))
        .await
        .expect("response within deadline")
        .expect("receive response");
    Packet::from_bytes(&buffer[..len]).expect("decode response")
}

async fn raw_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.expect("bind raw socket")
}

#[tokio::test]
async fn blockwise_payload_within_limit_is_changed() {
    let mut loopback = Loopback::start().await;
    let peer = loopback.client.default_peer();
    let delivery = loopback.post(&peer, vec![b'x'; 200]).await;
    assert_eq!(
        delivery,
        Delivery::Acknowledged {
            status: "2.04".into()
        }
    );
    let payload = tokio::time::timeout(Duration::from_secs(5), loopback.delivered.recv())
        .await
        .expect("delivered in time")
        .expect("frame");
    assert_eq!(payload.len(), 200);
    loopback.stop().await;
}

#[tokio::test]
async fn blockwise_payload_over_server_limit_is_too_large() {
    let mut loopback = Loopback::start().await;
    let peer = loopback.client.default_peer();
    match loopback.post(&peer, vec![b'x'; 1000]).await {
        Delivery::Rejected { status, .. } => assert_eq!(status, "4.13"),
        other => panic!("expected 4.13, got {other:?}"),
    }
    assert!(loopback.delivered.try_recv().is_err());
    loopback.stop().await;
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let loopback = Loopback::start().await;
    let peer = format!("coap://{}/outro", loopback.server_addr);
    match loopback.post(&peer, b"{}".to_vec()).await {
        Delivery::Rejected { status, .. } => assert_eq!(status, "4.04"),
        other => panic!("expected 4.04, got {other:?}"),
    }
    loopback.stop().await;
}

#[tokio::test]
async fn client_refuses_payload_over_its_own_limit() {
    let loopback = Loopback::start().await;
    let peer = loopback.client.default_peer();
    let err = loopback
        .client
        .post_bytes(&peer, vec![b'x'; CLIENT_LIMIT + 1])
        .await
        .expect_err("over client limit");
    assert!(matches!(
        err,
        BusError::PayloadTooLarge {
            size,
            limit: CLIENT_LIMIT
        } if size == CLIENT_LIMIT + 1
    ));
    loopback.stop().await;
}

#[tokio::test]
async fn get_is_method_not_allowed() {
    let loopback = Loopback::start().await;
    let socket = raw_socket().await;
    let response = exchange(
        &socket,
        loopback.server_addr,
        &request(RequestType::Get, 0x1234, Vec::new()),
    )
    .await;
    assert_eq!(response.header.get_type(), MessageType::Acknowledgement);
    assert_eq!(response.header.message_id, 0x1234);
    assert_eq!(
        response.header.code,
        MessageClass::Response(ResponseType::MethodNotAllowed)
    );
    loopback.stop().await;
}

#[tokio::test]
async fn single_datagram_over_limit_is_too_large() {
    let mut loopback = Loopback::start().await;
    let socket = raw_socket().await;
    let response = exchange(
        &socket,
        loopback.server_addr,
        &request(RequestType::Post, 0x2000, vec![b'x'; SERVER_LIMIT + 44]),
    )
    .await;
    assert_eq!(
        response.header.code,
        MessageClass::Response(ResponseType::RequestEntityTooLarge)
    );
    assert!(loopback.delivered.try_recv().is_err());
    loopback.stop().await;
}

#[tokio::test]
async fn block_gap_is_request_entity_incomplete() {
    let mut loopback = Loopback::start().await;
    let socket = raw_socket().await;

    // Block1 num=0, more, 64-byte blocks.
    let mut first = request(RequestType::Post, 0x3000, vec![b'a'; 64]);
    first.add_option(CoapOption::Block1, vec![0x0a]);
    let response = exchange(&socket, loopback.server_addr, &first).await;
    assert_eq!(
        response.header.code,
        MessageClass::Response(ResponseType::Continue)
    );

    // Block1 num=2, last: block 1 never arrived.
    let mut skipped = request(RequestType::Post, 0x3001, vec![b'c'; 16]);
    skipped.add_option(CoapOption::Block1, vec![0x22]);
    let response = exchange(&socket, loopback.server_addr, &skipped).await;
    assert_eq!(response.header.message_id, 0x3001);
    assert_eq!(
        response.header.code,
        MessageClass::Response(ResponseType::RequestEntityIncomplete)
    );
    assert!(loopback.delivered.try_recv().is_err());
    loopback.stop().await;
}
