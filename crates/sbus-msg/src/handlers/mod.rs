//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
//! Action-keyed dispatch table and the built-in handlers.
//!
//! Resolution never fails: actions without a registered handler fall through to
//! [`DefaultHandler`]. The registry is immutable once built and shared behind an
//! `Arc`, so concurrent dispatch needs no locking.
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sbus_common::HandlerConfig;

use crate::archive::ArchiveError;
use crate::envelope::{ContentError, Envelope};

mod basic;
mod distribution;
mod quote;

pub use basic::{DefaultHandler, EchoHandler};
pub use distribution::{ServiceDistributionHandler, ServiceResultHandler};
pub use quote::{
    CurrencyQuoteHandler, ExchangeRate, GatewayError, MarketGateway, StockQuote,
    StockQuoteHandler,
};

/// Marker shared by every query action name.
pub const QUERY_MARKER: &str = "CONSULTAR";

/// Action vocabulary known to this node. Anything else is carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    /// `ARQUIVOS_BASE`: a bundle of service files to extract.
    DistributeServiceFiles,
    /// `RESULTADO_BUSCA`: a service looked up on the bus.
    ServiceSearchResult,
    /// `REGISTRAR_SERVICO`: a service pushed for registration.
    RegisterService,
    /// `CONSULTAR_ACAO`: stock quote query.
    StockQuote,
    /// `CONSULTAR_MOEDA`: exchange rate query.
    CurrencyQuote,
    /// `ENVIAR_MENSAGEM`: plain message.
    SendMessage,
    /// Any other action tag.
    Unknown(String),
}

impl Action {
    /// Map a wire tag onto the vocabulary. Never fails.
    pub fn parse(tag: &str) -> Self {
        match tag {
            "ARQUIVOS_BASE" => Action::DistributeServiceFiles,
            "RESULTADO_BUSCA" => Action::ServiceSearchResult,
            "REGISTRAR_SERVICO" => Action::RegisterService,
            "CONSULTAR_ACAO" => Action::StockQuote,
            "CONSULTAR_MOEDA" => Action::CurrencyQuote,
            "ENVIAR_MENSAGEM" => Action::SendMessage,
            other => Action::Unknown(other.to_owned()),
        }
    }

    /// Wire tag.
    pub fn as_str(&self) -> &str {
        match self {
            Action::DistributeServiceFiles => "ARQUIVOS_BASE",
            Action::ServiceSearchResult => "RESULTADO_BUSCA",
            Action::RegisterService => "REGISTRAR_SERVICO",
            Action::StockQuote => "CONSULTAR_ACAO",
            Action::CurrencyQuote => "CONSULTAR_MOEDA",
            Action::SendMessage => "ENVIAR_MENSAGEM",
            Action::Unknown(tag) => tag,
        }
    }

    /// Query actions expect a reply envelope.
    pub fn is_query(&self) -> bool {
        self.as_str().starts_with(QUERY_MARKER)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Action {
    fn from(tag: &str) -> Self {
        Action::parse(tag)
    }
}

/// Business-logic failure raised by a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Required content field absent or mistyped.
    #[error(transparent)]
    Content(#[from] ContentError),
    /// Artifact could not be decoded or written.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    /// Market data collaborator failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    /// Blocking work panicked or was cancelled.
    #[error("handler task aborted: {0}")]
    Task(String),
}

/// Result of processing one envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    /// Human-readable result routed to the log sink.
    pub result: String,
    /// Reply to send back over the active transport.
    pub reply: Option<Envelope>,
}

impl HandlerOutcome {
    /// Outcome with no reply.
    pub fn text(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            reply: None,
        }
    }

    /// Outcome carrying a reply envelope.
    pub fn with_reply(result: impl Into<String>, reply: Envelope) -> Self {
        Self {
            result: result.into(),
            reply: Some(reply),
        }
    }
}

/// Processing logic bound to one or more actions.
///
/// Implementations run concurrently with themselves and must not hold
/// unsynchronised mutable state.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process one envelope.
    async fn process(&self, envelope: &Envelope) -> Result<HandlerOutcome, HandlerError>;
}

/// Filesystem locations used by the artifact handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSettings {
    /// Destination for single service files.
    pub services_dir: PathBuf,
    /// Destination for extracted service bundles.
    pub models_dir: PathBuf,
}

impl From<&HandlerConfig> for HandlerSettings {
    fn from(config: &HandlerConfig) -> Self {
        Self {
            services_dir: config.services_dir.clone(),
            models_dir: config.models_dir.clone(),
        }
    }
}

/// Action to handler table with a catch-all fallback.
pub struct HandlerRegistry {
    handlers: HashMap<Action, Arc<dyn Handler>>,
    fallback: Arc<dyn Handler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Registry holding only the default handler.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(DefaultHandler),
        }
    }

    /// Registry with every built-in action wired up.
    pub fn with_builtins(settings: HandlerSettings, gateway: Arc<dyn MarketGateway>) -> Self {
        let mut registry = Self::new();
        let results: Arc<dyn Handler> =
            Arc::new(ServiceResultHandler::new(settings.services_dir.clone()));

        registry.register(
            Action::DistributeServiceFiles,
            Arc::new(ServiceDistributionHandler::new(settings.models_dir)),
        );
        registry.register(Action::ServiceSearchResult, results.clone());
        registry.register(Action::RegisterService, results);
        registry.register(
            Action::StockQuote,
            Arc::new(StockQuoteHandler::new(gateway.clone())),
        );
        registry.register(
            Action::CurrencyQuote,
            Arc::new(CurrencyQuoteHandler::new(gateway)),
        );
        registry.register(Action::SendMessage, Arc::new(EchoHandler));
        registry
    }

    /// Bind `handler` to `action`, returning any handler it replaces.
    pub fn register(
        &mut self,
        action: impl Into<Action>,
        handler: Arc<dyn Handler>,
    ) -> Option<Arc<dyn Handler>> {
        self.handlers.insert(action.into(), handler)
    }

    /// Replace the catch-all handler.
    pub fn set_fallback(&mut self, handler: Arc<dyn Handler>) {
        self.fallback = handler;
    }

    /// Handler for `action`; unknown tags get the fallback.
    pub fn resolve(&self, action: &str) -> Arc<dyn Handler> {
        self.handlers
            .get(&Action::parse(action))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Whether a dedicated handler exists for `action`.
    pub fn is_registered(&self, action: &str) -> bool {
        self.handlers.contains_key(&Action::parse(action))
    }

    /// Registered action tags, sorted.
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<_> = self
            .handlers
            .keys()
            .map(|action| action.as_str().to_owned())
            .collect();
        actions.sort();
        actions
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("actions", &self.actions())
            .finish()
    }
}
