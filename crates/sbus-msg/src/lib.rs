//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
//! Messaging core of a bus node.
//!
//! Inbound bytes arrive on a [`Transport`], are decoded into an [`Envelope`] by the
//! [`BusClient`], stamped, and dispatched to the [`Handler`] the
//! [`HandlerRegistry`] resolves for the envelope action.
#![warn(missing_docs)]

use std::time::Duration;

pub mod archive;
pub mod client;
pub mod envelope;
pub mod handlers;
pub mod logging;
pub mod transport;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced by the messaging core.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Inbound text was not a valid envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    /// Archive packing or unpacking failed.
    #[error(transparent)]
    Archive(#[from] archive::ArchiveError),
    /// A transport was used outside the `Running` state.
    #[error("transport {transport} is not running (state: {state:?})")]
    NotRunning {
        /// Transport name.
        transport: &'static str,
        /// State observed when the call was rejected.
        state: transport::TransportState,
    },
    /// `start` was called on a transport that is not stopped.
    #[error("transport {transport} already started (state: {state:?})")]
    AlreadyStarted {
        /// Transport name.
        transport: &'static str,
        /// State observed when the call was rejected.
        state: transport::TransportState,
    },
    /// A handler reported a business-logic failure.
    #[error("handler for action {action} failed: {source}")]
    HandlerFailure {
        /// Action whose handler failed.
        action: String,
        /// Underlying handler error.
        #[source]
        source: handlers::HandlerError,
    },
    /// A handler exceeded its execution bound. Retryable.
    #[error("handler for action {action} exceeded {timeout:?}")]
    HandlerTimeout {
        /// Action whose handler timed out.
        action: String,
        /// Configured bound.
        timeout: Duration,
    },
    /// Connection lost, peer unreachable, publish rejected and similar faults.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Payload exceeds the transport's reassembly limit.
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Serialized size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
    /// Wrapper for IO errors encountered by transports.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for Prometheus registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl BusError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::HandlerTimeout { .. } | BusError::Transport(_) | BusError::Io(_)
        )
    }
}

pub use archive::{
    decode_text, encode_bytes, is_archive, pack_path, unpack, unpack_archive,
    unpack_archive_with_limit, write_file, ArchiveError, Unpacked, MAX_UNPACKED_BYTES,
};
pub use client::{BusClient, BusClientBuilder, BusStats, LogSink, MemoryLogSink, TracingLogSink};
pub use envelope::{metadata_keys, Content, ContentError, Envelope, Metadata};
pub use handlers::{
    Action, ExchangeRate, GatewayError, Handler, HandlerError, HandlerOutcome, HandlerRegistry,
    HandlerSettings, MarketGateway, StockQuote,
};
pub use logging::{log_envelope, BusMetrics, EnvelopeDirection};
pub use transport::{
    build_transport, CoapTransport, Delivery, DeliveryReceipt, InboundFrame, InboundSink,
    MemoryHub, MemoryTransport, MqttTransport, ReconnectPolicy, Transport, TransportState,
};
