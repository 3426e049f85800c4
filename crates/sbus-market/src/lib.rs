//! ---
//! sbus_section: "05-networking-external-interfaces"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Market-data gateway over the Alpha Vantage REST API."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
//! [`MarketGateway`] backed by one REST call per query.
//!
//! Responses are parsed in two branches: a provider error message, or the data
//! object. Anything else is reported as missing data.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use sbus_common::MarketConfig;
use sbus_msg::{ExchangeRate, GatewayError, MarketGateway, StockQuote};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

const ERROR_KEY: &str = "Error Message";
const DAILY_SERIES_KEY: &str = "Time Series (Daily)";
const EXCHANGE_RATE_KEY: &str = "Realtime Currency Exchange Rate";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Alpha Vantage client.
#[derive(Debug, Clone)]
pub struct AlphaVantageGateway {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl AlphaVantageGateway {
    /// Build a gateway from `config`. The API key is resolved once, here.
    pub fn new(config: &MarketConfig) -> Result<Self, GatewayError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|err| GatewayError::Request(format!("invalid market base url: {err}")))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| GatewayError::Request(err.to_string()))?;
        Ok(Self {
            client,
            base_url,
            api_key: config.resolved_api_key(),
        })
    }

    fn query_url(&self, params: &[(&str, &str)]) -> Result<Url, GatewayError> {
        let api_key = self.api_key.as_deref().ok_or(GatewayError::MissingApiKey)?;
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .extend_pairs(params)
            .append_pair("apikey", api_key);
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<Value, GatewayError> {
        debug!(host = url.host_str().unwrap_or_default(), "market data request");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| {
                warn!(error = %err, "market data request failed");
                GatewayError::Request(err.without_url().to_string())
            })?;
        response
            .json::<Value>()
            .await
            .map_err(|err| GatewayError::Request(err.without_url().to_string()))
    }
}

#[async_trait]
impl MarketGateway for AlphaVantageGateway {
    async fn fetch_quote(&self, symbol: &str) -> Result<StockQuote, GatewayError> {
        let symbol = symbol.trim().to_uppercase();
        let url = self.query_url(&[("function", "TIME_SERIES_DAILY"), ("symbol", &symbol)])?;
        parse_quote(&self.get_json(url).await?)
    }

    async fn fetch_exchange_rate(
        &self,
        base: &str,
        quote: &str,
    ) -> Result<ExchangeRate, GatewayError> {
        let base = base.trim().to_uppercase();
        let quote = quote.trim().to_uppercase();
        let url = self.query_url(&[
            ("function", "CURRENCY_EXCHANGE_RATE"),
            ("from_currency", &base),
            ("to_currency", &quote),
        ])?;
        parse_exchange_rate(&self.get_json(url).await?)
    }
}

/// Quote from a `TIME_SERIES_DAILY` response, using the latest trading day.
///
/// `price` is that day's open and `prev_close` its close.
pub fn parse_quote(body: &Value) -> Result<StockQuote, GatewayError> {
    provider_error(body)?;
    let series = body
        .get(DAILY_SERIES_KEY)
        .and_then(Value::as_object)
        .ok_or(GatewayError::NoData("stock"))?;
    // ISO dates order lexicographically.
    let (_, latest) = series
        .iter()
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .ok_or(GatewayError::NoData("stock"))?;
    let latest = latest.as_object().ok_or(GatewayError::NoData("stock"))?;

    Ok(StockQuote {
        price: number(latest, "1. open")?,
        prev_close: number(latest, "4. close")?,
        high: number(latest, "2. high")?,
        low: number(latest, "3. low")?,
        volume: number(latest, "5. volume")? as u64,
    })
}

/// Rate from a `CURRENCY_EXCHANGE_RATE` response.
pub fn parse_exchange_rate(body: &Value) -> Result<ExchangeRate, GatewayError> {
    provider_error(body)?;
    let data = body
        .get(EXCHANGE_RATE_KEY)
        .and_then(Value::as_object)
        .ok_or(GatewayError::NoData("exchange rate"))?;

    Ok(ExchangeRate {
        base_code: text(data, "1. From_Currency Code")?,
        base_name: text(data, "2. From_Currency Name")?,
        quote_code: text(data, "3. To_Currency Code")?,
        quote_name: text(data, "4. To_Currency Name")?,
        rate: number(data, "5. Exchange Rate")?,
    })
}

fn provider_error(body: &Value) -> Result<(), GatewayError> {
    match body.get(ERROR_KEY) {
        Some(Value::String(message)) => Err(GatewayError::Provider(message.clone())),
        Some(other) => Err(GatewayError::Provider(other.to_string())),
        None => Ok(()),
    }
}

fn text(data: &Map<String, Value>, key: &str) -> Result<String, GatewayError> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| GatewayError::Provider(format!("response field '{key}' is missing")))
}

/// Provider numbers arrive as strings; plain JSON numbers are accepted too.
fn number(data: &Map<String, Value>, key: &str) -> Result<f64, GatewayError> {
    let parsed = match data.get(key) {
        Some(Value::String(raw)) => raw.trim().parse::<f64>().ok(),
        Some(Value::Number(value)) => value.as_f64(),
        _ => None,
    };
    parsed.ok_or_else(|| GatewayError::Provider(format!("response field '{key}' is not a number")))
}
