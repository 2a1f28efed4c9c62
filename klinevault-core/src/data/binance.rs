//! Binance USDⓈ-M futures venue.
//!
//! Uses two public endpoints: `/fapi/v1/exchangeInfo` for the instrument
//! listing and `/fapi/v1/klines` for paginated candles. Status handling feeds
//! the shared circuit breaker: 418/403 trip it, 429 counts toward it.

use super::circuit_breaker::CircuitBreaker;
use super::venue::{Venue, VenueError};
use crate::domain::{Candle, Interval, Symbol};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const FUTURES_BASE_URL: &str = "https://fapi.binance.com";

/// Largest page the klines endpoint serves.
pub const MAX_KLINE_LIMIT: usize = 1500;

/// Binance error code for an unknown symbol.
const INVALID_SYMBOL_CODE: i64 = -1121;

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    base_asset: String,
    #[serde(default)]
    quote_asset: String,
    #[serde(default)]
    contract_type: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

pub struct BinanceFutures {
    client: reqwest::blocking::Client,
    base_url: String,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl BinanceFutures {
    /// Build a client with the given per-request timeout.
    pub fn new(circuit_breaker: Arc<CircuitBreaker>, timeout: Duration) -> Result<Self, VenueError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("klinevault/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VenueError::NetworkUnreachable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: FUTURES_BASE_URL.to_string(),
            circuit_breaker,
        })
    }

    /// Point the client at another host (testnet, proxy, local mock).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Issue one GET and return the body of a successful response.
    fn get(&self, path: &str, query: &[(&str, String)], symbol: Option<&str>) -> Result<String, VenueError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(VenueError::CircuitBreakerOpen);
        }

        let url = format!("{}{path}", self.base_url);
        debug!(%url, ?query, "venue request");

        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .map_err(transport_error)?;
        let status = resp.status();

        if status == reqwest::StatusCode::IM_A_TEAPOT || status == reqwest::StatusCode::FORBIDDEN {
            self.circuit_breaker.trip();
            return Err(VenueError::Banned {
                status: status.as_u16(),
            });
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            self.circuit_breaker.record_failure();
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(VenueError::RateLimited { retry_after_secs });
        }

        let body = resp.text().map_err(transport_error)?;

        if status.is_server_error() {
            return Err(VenueError::ServerError {
                status: status.as_u16(),
                message: truncate(&body),
            });
        }

        if !status.is_success() {
            return Err(client_error(status.as_u16(), &body, symbol));
        }

        self.circuit_breaker.record_success();
        Ok(body)
    }
}

impl Venue for BinanceFutures {
    fn name(&self) -> &str {
        "binance_usdm_futures"
    }

    fn exchange_info(&self) -> Result<Vec<Symbol>, VenueError> {
        let body = self.get("/fapi/v1/exchangeInfo", &[], None)?;
        parse_exchange_info(&body)
    }

    fn klines(
        &self,
        symbol: &str,
        interval: Interval,
        since: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        let query = [
            ("symbol", symbol.to_string()),
            ("interval", interval.code().to_string()),
            ("startTime", since.timestamp_millis().to_string()),
            ("endTime", end.timestamp_millis().to_string()),
            ("limit", limit.clamp(1, MAX_KLINE_LIMIT).to_string()),
        ];
        let body = self.get("/fapi/v1/klines", &query, Some(symbol))?;
        parse_klines(&body)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

pub(crate) fn transport_error(e: reqwest::Error) -> VenueError {
    if e.is_timeout() {
        VenueError::Timeout(e.to_string())
    } else {
        VenueError::NetworkUnreachable(e.to_string())
    }
}

fn client_error(status: u16, body: &str, symbol: Option<&str>) -> VenueError {
    match serde_json::from_str::<ApiError>(body) {
        Ok(api) if api.code == INVALID_SYMBOL_CODE => VenueError::SymbolNotFound {
            symbol: symbol.unwrap_or_default().to_string(),
        },
        Ok(api) => VenueError::InvalidRequest {
            status,
            message: format!("{} ({})", api.msg, api.code),
        },
        Err(_) => VenueError::InvalidRequest {
            status,
            message: truncate(body),
        },
    }
}

pub(crate) fn truncate(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// Parse the `exchangeInfo` payload into instruments.
pub fn parse_exchange_info(body: &str) -> Result<Vec<Symbol>, VenueError> {
    let info: ExchangeInfo = serde_json::from_str(body)
        .map_err(|e| VenueError::ResponseFormatChanged(format!("exchangeInfo: {e}")))?;

    Ok(info
        .symbols
        .into_iter()
        .map(|s| Symbol {
            name: s.symbol,
            base_asset: s.base_asset,
            quote_asset: s.quote_asset,
            contract_type: s.contract_type,
            status: s.status,
        })
        .collect())
}

/// Parse a klines payload: `[[open_time, "o", "h", "l", "c", "v", close_time, ...], ...]`.
pub fn parse_klines(body: &str) -> Result<Vec<Candle>, VenueError> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)
        .map_err(|e| VenueError::ResponseFormatChanged(format!("klines: {e}")))?;

    rows.iter()
        .enumerate()
        .map(|(i, row)| parse_kline_row(row).map_err(|reason| {
            VenueError::ResponseFormatChanged(format!("kline row {i}: {reason}"))
        }))
        .collect()
}

fn parse_kline_row(row: &[Value]) -> Result<Candle, String> {
    if row.len() < 6 {
        return Err(format!("expected at least 6 fields, got {}", row.len()));
    }
    let open_ms = row[0]
        .as_i64()
        .ok_or_else(|| format!("open time is not an integer: {}", row[0]))?;
    let open_time = DateTime::from_timestamp_millis(open_ms)
        .ok_or_else(|| format!("open time out of range: {open_ms}"))?;

    Ok(Candle {
        open_time,
        open: number(&row[1], "open")?,
        high: number(&row[2], "high")?,
        low: number(&row[3], "low")?,
        close: number(&row[4], "close")?,
        volume: number(&row[5], "volume")?,
    })
}

fn number(value: &Value, field: &str) -> Result<f64, String> {
    match value {
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|e| format!("{field} '{s}' is not a number: {e}")),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("{field} is not representable as f64")),
        other => Err(format!("{field} has unexpected type: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_exchange_info_symbols() {
        let body = r#"{
            "timezone": "UTC",
            "symbols": [
                {"symbol": "BTCUSDT", "pair": "BTCUSDT", "contractType": "PERPETUAL",
                 "status": "TRADING", "baseAsset": "BTC", "quoteAsset": "USDT"},
                {"symbol": "ETHUSDT_250328", "pair": "ETHUSDT", "contractType": "CURRENT_QUARTER",
                 "status": "TRADING", "baseAsset": "ETH", "quoteAsset": "USDT"},
                {"symbol": "OLDUSDT", "contractType": "PERPETUAL",
                 "status": "SETTLING", "baseAsset": "OLD", "quoteAsset": "USDT"}
            ]
        }"#;
        let symbols = parse_exchange_info(body).unwrap();
        assert_eq!(symbols.len(), 3);
        assert_eq!(symbols[0].name, "BTCUSDT");
        assert_eq!(symbols[0].contract_type, "PERPETUAL");
        assert!(symbols[0].is_tradable());
        assert!(!symbols[2].is_tradable());
    }

    #[test]
    fn malformed_exchange_info_is_format_error() {
        let err = parse_exchange_info(r#"{"rateLimits": []}"#).unwrap_err();
        assert!(matches!(err, VenueError::ResponseFormatChanged(_)));
    }

    #[test]
    fn parses_kline_rows_with_string_prices() {
        let body = r#"[
            [1735689600000, "93576.00", "93610.90", "93537.50", "93591.20", "104.337", 1735689659999, "9764.8", 1570, "57.2", "5353.3", "0"],
            [1735689660000, "93591.10", "93599.00", "93550.00", "93560.10", "61.1", 1735689719999, "5718.1", 900, "30.0", "2807.7", "0"]
        ]"#;
        let candles = parse_klines(body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(
            candles[0].open_time,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(candles[0].open, 93576.0);
        assert_eq!(candles[0].volume, 104.337);
        assert_eq!(candles[1].close, 93560.1);
    }

    #[test]
    fn short_kline_row_is_format_error() {
        let err = parse_klines(r#"[[1735689600000, "1.0", "2.0"]]"#).unwrap_err();
        match err {
            VenueError::ResponseFormatChanged(msg) => assert!(msg.contains("row 0")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_kline_page_is_ok() {
        assert!(parse_klines("[]").unwrap().is_empty());
    }

    #[test]
    fn invalid_symbol_code_maps_to_symbol_not_found() {
        let err = client_error(400, r#"{"code":-1121,"msg":"Invalid symbol."}"#, Some("NOPEUSDT"));
        assert!(matches!(err, VenueError::SymbolNotFound { ref symbol } if symbol == "NOPEUSDT"));

        let err = client_error(400, r#"{"code":-1100,"msg":"Illegal characters"}"#, None);
        assert!(matches!(err, VenueError::InvalidRequest { status: 400, .. }));
    }

    #[test]
    fn open_breaker_blocks_requests_without_network() {
        let cb = Arc::new(CircuitBreaker::new(Duration::from_secs(60), 1));
        cb.trip();
        let venue = BinanceFutures::new(cb, Duration::from_secs(1))
            .unwrap()
            .with_base_url("http://127.0.0.1:9");
        assert!(!venue.is_available());
        assert!(matches!(
            venue.exchange_info(),
            Err(VenueError::CircuitBreakerOpen)
        ));
    }
}
