use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{AssetBalance, ExchangeClient, SymbolTradingRules};
use crate::error::{BotError, BotResult};
use crate::types::{Candle, Fill, OrderRequest, OrderResult, OrderStatus, Side, TimeFrame};

const BINANCE_API: &str = "https://api.binance.com";
const BINANCE_TESTNET: &str = "https://testnet.binance.vision";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct BinanceClient {
    client: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

impl BinanceClient {
    pub fn new(api_key: String, secret_key: String, use_testnet: bool) -> Self {
        let base_url = if use_testnet {
            BINANCE_TESTNET.to_string()
        } else {
            BINANCE_API.to_string()
        };

        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_key,
            secret_key,
            base_url,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn build_signed_query(&self, params: &HashMap<&str, String>) -> String {
        let timestamp = Utc::now().timestamp_millis();
        let mut query_parts: Vec<String> =
            params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        query_parts.push(format!("timestamp={}", timestamp));
        query_parts.push("recvWindow=5000".to_string());
        let query = query_parts.join("&");
        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    /// Map a non-2xx response body to the error taxonomy. Binance reports
    /// `{"code": -1003, "msg": "..."}`; unknown bodies are fatal.
    async fn error_from_response(resp: reqwest::Response) -> BotError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if let Ok(api_err) = serde_json::from_str::<ApiError>(&body) {
            return BotError::transient_from_code(api_err.code, api_err.msg);
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return BotError::TransientExchange {
                code: None,
                message: format!("HTTP {}: {}", status, body),
            };
        }
        BotError::FatalExchange {
            code: None,
            message: format!("HTTP {}: {}", status, body),
        }
    }

    fn parse_klines(raw: Vec<Vec<serde_json::Value>>) -> BotResult<Vec<Candle>> {
        raw.into_iter()
            .map(|k| {
                let open_time = k.first().and_then(|v| v.as_i64()).unwrap_or(0);
                let open = k.get(1).and_then(|v| v.as_str()).unwrap_or("0");
                let high = k.get(2).and_then(|v| v.as_str()).unwrap_or("0");
                let low = k.get(3).and_then(|v| v.as_str()).unwrap_or("0");
                let close = k.get(4).and_then(|v| v.as_str()).unwrap_or("0");
                let volume = k.get(5).and_then(|v| v.as_str()).unwrap_or("0");
                let close_time = k.get(6).and_then(|v| v.as_i64()).unwrap_or(0);

                Ok(Candle {
                    open_time: Utc
                        .timestamp_millis_opt(open_time)
                        .single()
                        .ok_or_else(|| BotError::InvalidInput("bad kline open time".into()))?,
                    close_time: Utc
                        .timestamp_millis_opt(close_time)
                        .single()
                        .ok_or_else(|| BotError::InvalidInput("bad kline close time".into()))?,
                    open: parse_decimal(open)?,
                    high: parse_decimal(high)?,
                    low: parse_decimal(low)?,
                    close: parse_decimal(close)?,
                    volume: parse_decimal(volume)?,
                    is_closed: true,
                })
            })
            .collect()
    }

    fn convert_order_response(resp: OrderResponse) -> BotResult<OrderResult> {
        let fills = resp
            .fills
            .unwrap_or_default()
            .into_iter()
            .map(|f| {
                Ok(Fill {
                    price: parse_decimal(&f.price)?,
                    qty: parse_decimal(&f.qty)?,
                    commission: parse_decimal(&f.commission)?,
                    commission_asset: f.commission_asset,
                    trade_id: f.trade_id,
                })
            })
            .collect::<BotResult<Vec<Fill>>>()?;

        let side = match resp.side.as_str() {
            "BUY" => Side::Buy,
            _ => Side::Sell,
        };

        Ok(OrderResult {
            order_id: resp.order_id,
            client_order_id: resp.client_order_id,
            symbol: resp.symbol,
            side,
            status: OrderStatus::from_exchange(&resp.status),
            executed_qty: parse_decimal(&resp.executed_qty)?,
            cummulative_quote_qty: parse_decimal(
                resp.cummulative_quote_qty.as_deref().unwrap_or("0"),
            )?,
            fills,
            transact_time: Utc
                .timestamp_millis_opt(resp.transact_time.unwrap_or(0))
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn ping(&self) -> BotResult<()> {
        let url = format!("{}/api/v3/ping", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }
        Ok(())
    }

    async fn get_exchange_info(&self) -> BotResult<Vec<SymbolTradingRules>> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }
        let info: ExchangeInfoResponse = resp
            .json()
            .await
            .map_err(|e| BotError::FatalExchange {
                code: None,
                message: format!("malformed exchangeInfo: {}", e),
            })?;

        let rules = info
            .symbols
            .into_iter()
            .map(SymbolTradingRules::from_symbol_info)
            .collect::<BotResult<Vec<_>>>()?;
        debug!("Fetched trading rules for {} symbols", rules.len());
        Ok(rules)
    }

    async fn create_order(&self, request: &OrderRequest) -> BotResult<OrderResult> {
        let url = format!("{}/api/v3/order", self.base_url);

        let mut params: HashMap<&str, String> = HashMap::new();
        params.insert("symbol", request.symbol.clone());
        params.insert("side", request.side.as_str().to_string());
        params.insert("type", "LIMIT".to_string());
        params.insert("timeInForce", "IOC".to_string());
        params.insert("quantity", request.quantity.to_string());
        params.insert("price", request.price.to_string());
        params.insert("newClientOrderId", request.client_order_id.clone());
        // FULL returns the fills array needed for fee accounting
        params.insert("newOrderRespType", "FULL".to_string());

        let query = self.build_signed_query(&params);
        let full_url = format!("{}?{}", url, query);

        debug!(
            "Placing {} IOC order: qty={} price={} id={}",
            request.side, request.quantity, request.price, request.client_order_id
        );

        let resp = self
            .client
            .post(&full_url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }

        let order_resp: OrderResponse = resp.json().await.map_err(|e| BotError::FatalExchange {
            code: None,
            message: format!("malformed order response: {}", e),
        })?;
        Self::convert_order_response(order_resp)
    }

    async fn get_order(
        &self,
        symbol: &str,
        order_id: Option<u64>,
        client_order_id: Option<String>,
    ) -> BotResult<OrderResult> {
        let url = format!("{}/api/v3/order", self.base_url);

        let mut params: HashMap<&str, String> = HashMap::new();
        params.insert("symbol", symbol.to_string());
        if let Some(id) = order_id {
            params.insert("orderId", id.to_string());
        } else if let Some(id) = client_order_id {
            params.insert("origClientOrderId", id);
        } else {
            return Err(BotError::InvalidInput(
                "get_order needs an order id or a client order id".to_string(),
            ));
        }

        let query = self.build_signed_query(&params);
        let full_url = format!("{}?{}", url, query);

        let resp = self
            .client
            .get(&full_url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }

        let order_resp: OrderResponse = resp.json().await.map_err(|e| BotError::FatalExchange {
            code: None,
            message: format!("malformed order response: {}", e),
        })?;
        Self::convert_order_response(order_resp)
    }

    async fn get_balance(&self, asset: &str) -> BotResult<AssetBalance> {
        let url = format!("{}/api/v3/account", self.base_url);

        let params: HashMap<&str, String> = HashMap::new();
        let query = self.build_signed_query(&params);
        let full_url = format!("{}?{}", url, query);

        let resp = self
            .client
            .get(&full_url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }

        let account: AccountResponse = resp.json().await.map_err(|e| BotError::FatalExchange {
            code: None,
            message: format!("malformed account response: {}", e),
        })?;

        for balance in account.balances {
            if balance.asset == asset {
                return Ok(AssetBalance {
                    free: parse_decimal(&balance.free)?,
                    locked: parse_decimal(&balance.locked)?,
                });
            }
        }

        Ok(AssetBalance::default())
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        limit: u32,
    ) -> BotResult<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            timeframe.as_str(),
            limit
        );

        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }
        let raw: Vec<Vec<serde_json::Value>> =
            resp.json().await.map_err(|e| BotError::FatalExchange {
                code: None,
                message: format!("malformed klines: {}", e),
            })?;
        Self::parse_klines(raw)
    }

    async fn get_candles_since(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        start: DateTime<Utc>,
    ) -> BotResult<Vec<Candle>> {
        let mut all_candles: Vec<Candle> = Vec::new();
        let mut current_start = start.timestamp_millis() + 1;

        info!("Fetching candles for {} since {}", symbol, start);

        loop {
            let url = format!(
                "{}/api/v3/klines?symbol={}&interval={}&startTime={}&limit=1000",
                self.base_url,
                symbol,
                timeframe.as_str(),
                current_start
            );

            let resp = self.client.get(&url).send().await?;
            if !resp.status().is_success() {
                return Err(Self::error_from_response(resp).await);
            }
            let raw: Vec<Vec<serde_json::Value>> =
                resp.json().await.map_err(|e| BotError::FatalExchange {
                    code: None,
                    message: format!("malformed klines: {}", e),
                })?;

            if raw.is_empty() {
                break;
            }

            let batch_len = raw.len();
            let batch = Self::parse_klines(raw)?;

            // The last kline in a page may still be open; drop it and stop.
            let now = Utc::now();
            let closed: Vec<Candle> = batch
                .into_iter()
                .filter(|c| c.close_time <= now)
                .collect();

            if let Some(last) = closed.last() {
                current_start = last.close_time.timestamp_millis() + 1;
            }
            let closed_len = closed.len();
            all_candles.extend(closed);

            if batch_len < 1000 || closed_len < batch_len {
                break;
            }

            // Stay under the venue's request weight limits
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("Fetched {} closed candles for {}", all_candles.len(), symbol);
        Ok(all_candles)
    }
}

fn parse_decimal(s: &str) -> BotResult<Decimal> {
    Decimal::from_str(s)
        .map_err(|_| BotError::InvalidInput(format!("not a decimal: {}", s)))
}

// API Response Types
#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfoResponse>,
}

#[derive(Debug, Deserialize)]
pub(super) struct SymbolInfoResponse {
    pub symbol: String,
    pub status: String,
    #[serde(rename = "baseAsset")]
    pub base_asset: String,
    #[serde(rename = "baseAssetPrecision")]
    pub base_asset_precision: u32,
    #[serde(rename = "quoteAsset")]
    pub quote_asset: String,
    #[serde(rename = "quotePrecision", alias = "quoteAssetPrecision")]
    pub quote_precision: u32,
    #[serde(rename = "orderTypes")]
    pub order_types: Vec<String>,
    pub filters: Vec<FilterResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
pub(super) enum FilterResponse {
    #[serde(rename = "PRICE_FILTER")]
    Price {
        #[serde(rename = "minPrice")]
        min_price: String,
        #[serde(rename = "maxPrice")]
        max_price: String,
        #[serde(rename = "tickSize")]
        tick_size: String,
    },
    #[serde(rename = "LOT_SIZE")]
    LotSize {
        #[serde(rename = "minQty")]
        min_qty: String,
        #[serde(rename = "maxQty")]
        max_qty: String,
        #[serde(rename = "stepSize")]
        step_size: String,
    },
    #[serde(rename = "NOTIONAL")]
    Notional {
        #[serde(rename = "minNotional")]
        min_notional: String,
    },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional {
        #[serde(rename = "minNotional")]
        min_notional: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    symbol: String,
    #[serde(rename = "orderId")]
    order_id: u64,
    #[serde(rename = "clientOrderId")]
    client_order_id: String,
    status: String,
    side: String,
    #[serde(rename = "executedQty")]
    executed_qty: String,
    #[serde(rename = "cummulativeQuoteQty")]
    cummulative_quote_qty: Option<String>,
    #[serde(rename = "transactTime")]
    transact_time: Option<i64>,
    fills: Option<Vec<FillResponse>>,
}

#[derive(Debug, Deserialize)]
struct FillResponse {
    price: String,
    qty: String,
    commission: String,
    #[serde(rename = "commissionAsset")]
    commission_asset: String,
    #[serde(rename = "tradeId")]
    trade_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<BalanceResponse>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    asset: String,
    free: String,
    locked: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_response_conversion() {
        let resp: OrderResponse = serde_json::from_str(
            r#"{
                "symbol": "BTCUSDT",
                "orderId": 12345,
                "clientOrderId": "BUY_1700000000000_123456",
                "status": "FILLED",
                "side": "BUY",
                "executedQty": "0.00205000",
                "cummulativeQuoteQty": "99.72327500",
                "transactTime": 1700000000123,
                "fills": [
                    {"price": "48645.50", "qty": "0.00205", "commission": "0.00000205", "commissionAsset": "BTC", "tradeId": 99}
                ]
            }"#,
        )
        .unwrap();

        let result = BinanceClient::convert_order_response(resp).unwrap();
        assert_eq!(result.order_id, 12345);
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.executed_qty, dec!(0.00205));
        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fee_breakdown().btc, dec!(0.00000205));
    }

    #[test]
    fn test_order_response_without_fills() {
        let resp: OrderResponse = serde_json::from_str(
            r#"{
                "symbol": "BTCUSDT",
                "orderId": 7,
                "clientOrderId": "SELL_1700000000000_654321",
                "status": "EXPIRED",
                "side": "SELL",
                "executedQty": "0.00000000",
                "cummulativeQuoteQty": "0.00000000"
            }"#,
        )
        .unwrap();

        let result = BinanceClient::convert_order_response(resp).unwrap();
        assert!(!result.is_filled());
        assert_eq!(result.avg_price(), Decimal::ZERO);
    }

    #[test]
    fn test_kline_parsing() {
        let raw: Vec<Vec<serde_json::Value>> = serde_json::from_str(
            r#"[[1700000000000, "48000.1", "48500.9", "47900.0", "48400.5", "123.45", 1700003599999, "0", 0, "0", "0", "0"]]"#,
        )
        .unwrap();
        let candles = BinanceClient::parse_klines(raw).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].high, dec!(48500.9));
        assert!(candles[0].is_closed);
    }

    #[test]
    fn test_signature_is_deterministic() {
        let client = BinanceClient::new("key".to_string(), "secret".to_string(), true);
        let a = client.sign("symbol=BTCUSDT&timestamp=1");
        let b = client.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
