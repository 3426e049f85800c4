//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
//! Financial query handlers and the market-data collaborator they call.
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{info, warn};

use super::{Handler, HandlerError, HandlerOutcome};
use crate::envelope::{metadata_keys, Content, Envelope};

/// Latest daily figures for a stock symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockQuote {
    /// Opening price of the latest session.
    pub price: f64,
    /// Closing price of the latest session.
    pub prev_close: f64,
    /// Session high.
    pub high: f64,
    /// Session low.
    pub low: f64,
    /// Traded volume.
    pub volume: u64,
}

/// Exchange rate between two currencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    /// Reference currency code.
    pub base_code: String,
    /// Reference currency name.
    pub base_name: String,
    /// Target currency code.
    pub quote_code: String,
    /// Target currency name.
    pub quote_name: String,
    /// Units of target per unit of reference.
    pub rate: f64,
}

/// Failure reported by a [`MarketGateway`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The provider answered with an error message.
    #[error("{0}")]
    Provider(String),
    /// The provider answered without the expected data.
    #[error("no {0} data found")]
    NoData(&'static str),
    /// Request could not be completed.
    #[error("request failed: {0}")]
    Request(String),
    /// No API key is configured.
    #[error("market api key is not configured")]
    MissingApiKey,
}

/// Market-data lookups used by the query handlers.
#[async_trait]
pub trait MarketGateway: Send + Sync {
    /// Latest quote for `symbol`.
    async fn fetch_quote(&self, symbol: &str) -> Result<StockQuote, GatewayError>;
    /// Current rate converting `base` into `quote`.
    async fn fetch_exchange_rate(&self, base: &str, quote: &str)
        -> Result<ExchangeRate, GatewayError>;
}

/// The `metadata` object a caller embedded in its content, echoed back in replies.
fn caller_metadata(content: &Content) -> JsonValue {
    match content.get("metadata") {
        Some(JsonValue::Object(map)) => JsonValue::Object(map.clone()),
        _ => JsonValue::Object(Map::new()),
    }
}

fn finish_reply(request: Envelope, body: Content) -> Envelope {
    request
        .reply(body)
        .with_timestamp(metadata_keys::SENT)
}

/// Answers `CONSULTAR_ACAO` with the latest quote for `simboloAcao`.
pub struct StockQuoteHandler {
    gateway: Arc<dyn MarketGateway>,
}

impl StockQuoteHandler {
    /// Handler delegating to `gateway`.
    pub fn new(gateway: Arc<dyn MarketGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Handler for StockQuoteHandler {
    async fn process(&self, envelope: &Envelope) -> Result<HandlerOutcome, HandlerError> {
        let content = envelope.content();
        let symbol = content.str_field("simboloAcao")?.trim().to_uppercase();
        let request = envelope
            .clone()
            .with_timestamp(metadata_keys::PROCESSING_STARTED);

        let body = match self.gateway.fetch_quote(&symbol).await {
            Ok(quote) => Content::new()
                .with("precoAtual", quote.price)
                .with("precoFechamentoAnterior", quote.prev_close)
                .with("maxDia", quote.high)
                .with("minDia", quote.low)
                .with("volume", quote.volume),
            Err(err) => {
                warn!(symbol = %symbol, error = %err, "stock quote lookup failed");
                Content::new().with(
                    "erro",
                    format!("Failed to fetch stock data for {symbol}: {err}"),
                )
            }
        }
        .with("metadata", caller_metadata(content));

        let reply = finish_reply(request, body);
        info!(symbol = %symbol, destination = reply.destination(), "stock quote reply prepared");
        Ok(HandlerOutcome::with_reply(
            format!("Stock quote for {symbol} answered to {}", reply.destination()),
            reply,
        ))
    }
}

/// Answers `CONSULTAR_MOEDA` by converting `valorAConverter` between two currencies.
pub struct CurrencyQuoteHandler {
    gateway: Arc<dyn MarketGateway>,
}

impl CurrencyQuoteHandler {
    /// Handler delegating to `gateway`.
    pub fn new(gateway: Arc<dyn MarketGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Handler for CurrencyQuoteHandler {
    async fn process(&self, envelope: &Envelope) -> Result<HandlerOutcome, HandlerError> {
        let content = envelope.content();
        let base = content.str_field("moedaReferencia")?.trim().to_uppercase();
        let target = content.str_field("moedaDestino")?.trim().to_uppercase();
        let amount = content.f64_field("valorAConverter")?;
        let request = envelope
            .clone()
            .with_timestamp(metadata_keys::PROCESSING_STARTED);

        let body = match self.gateway.fetch_exchange_rate(&base, &target).await {
            Ok(rate) => Content::new()
                .with("moedaReferenciaCodigo", rate.base_code)
                .with("moedaReferenciaNome", rate.base_name)
                .with("moedaDestinoCodigo", rate.quote_code)
                .with("moedaDestinoNome", rate.quote_name)
                .with("taxaDeCambio", rate.rate)
                .with("valorAConverter", amount)
                .with("valorConvertido", amount * rate.rate),
            Err(err) => {
                warn!(base = %base, quote = %target, error = %err, "exchange rate lookup failed");
                Content::new().with(
                    "erro",
                    format!("Failed to fetch exchange rate for {base}/{target}: {err}"),
                )
            }
        }
        .with("metadata", caller_metadata(content));

        let reply = finish_reply(request, body);
        info!(base = %base, quote = %target, destination = reply.destination(), "exchange rate reply prepared");
        Ok(HandlerOutcome::with_reply(
            format!(
                "Exchange rate {base}/{target} answered to {}",
                reply.destination()
            ),
            reply,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::StubGateway;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn currency_reply_converts_amount() {
        let gateway = Arc::new(StubGateway {
            rate: Some(5.0),
            ..StubGateway::default()
        });
        let handler = CurrencyQuoteHandler::new(gateway.clone());
        let request = Envelope::new(
            "CONSULTAR_MOEDA",
            "topico/cliente",
            "topico/servidor",
            Content::new()
                .with("moedaReferencia", "usd")
                .with("moedaDestino", "BRL")
                .with("valorAConverter", 10),
        )
        .expect("envelope")
        .with_metadata(metadata_keys::RECEIVED, 1);

        let outcome = handler.process(&request).await.expect("handled");
        let reply = outcome.reply.expect("query replies");
        assert_eq!(reply.action(), "RESULTADO_CONSULTAR_MOEDA");
        assert_eq!(reply.destination(), "topico/cliente");
        assert_eq!(reply.origin(), "topico/servidor");
        assert_eq!(reply.content().f64_field("taxaDeCambio"), Ok(5.0));
        assert_eq!(reply.content().f64_field("valorConvertido"), Ok(50.0));
        assert_eq!(reply.content().str_field("moedaReferenciaCodigo"), Ok("USD"));
        assert_eq!(reply.content().get("metadata"), Some(&json!({})));

        let metadata = reply.metadata();
        assert_eq!(metadata.timestamp(metadata_keys::RECEIVED), Some(1));
        assert!(metadata.contains_key(metadata_keys::PROCESSING_STARTED));
        assert!(metadata.contains_key(metadata_keys::SENT));
        assert_eq!(gateway.calls.lock().as_slice(), ["USD/BRL"]);
    }

    #[tokio::test]
    async fn stock_reply_echoes_caller_metadata() {
        let handler = StockQuoteHandler::new(Arc::new(StubGateway::default()));
        let request = Envelope::new(
            "CONSULTAR_ACAO",
            "cliente",
            "servidor",
            Content::new()
                .with("simboloAcao", " petr4 ")
                .with("metadata", json!({"trace": "abc"})),
        )
        .expect("envelope");

        let reply = handler
            .process(&request)
            .await
            .expect("handled")
            .reply
            .expect("reply");
        assert_eq!(reply.action(), "RESULTADO_CONSULTAR_ACAO");
        assert_eq!(reply.content().f64_field("precoAtual"), Ok(10.5));
        assert_eq!(reply.content().f64_field("volume"), Ok(1000.0));
        assert_eq!(
            reply.content().get("metadata"),
            Some(&json!({"trace": "abc"}))
        );
    }

    #[tokio::test]
    async fn gateway_failure_becomes_reply_error() {
        let handler = StockQuoteHandler::new(Arc::new(StubGateway {
            failure: Some("Invalid API call".into()),
            ..StubGateway::default()
        }));
        let request = Envelope::new(
            "CONSULTAR_ACAO",
            "cliente",
            "servidor",
            Content::new().with("simboloAcao", "XXXX"),
        )
        .expect("envelope");

        let reply = handler
            .process(&request)
            .await
            .expect("errors are data")
            .reply
            .expect("reply");
        let error = reply.content().str_field("erro").expect("erro field");
        assert!(error.contains("XXXX"));
        assert!(error.contains("Invalid API call"));
        assert!(!reply.content().contains("precoAtual"));
    }

    #[tokio::test]
    async fn missing_query_field_fails() {
        let handler = CurrencyQuoteHandler::new(Arc::new(StubGateway::default()));
        let request = Envelope::new(
            "CONSULTAR_MOEDA",
            "cliente",
            "servidor",
            Content::new().with("moedaReferencia", "USD"),
        )
        .expect("envelope");
        assert!(matches!(
            handler.process(&request).await,
            Err(HandlerError::Content(_))
        ));
    }
}
