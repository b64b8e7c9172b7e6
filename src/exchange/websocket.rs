use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::error::{BotError, BotResult};
use crate::types::{Candle, TimeFrame};

const BINANCE_WS: &str = "wss://stream.binance.com:9443/ws";

#[derive(Debug, Clone)]
pub enum CandleEvent {
    /// A kline update; `candle.is_closed` marks the final tick of the bar.
    Candle(Candle),
    Disconnected,
    Error(String),
}

/// Source of candle events for the orchestrator. Implemented by the Binance
/// kline websocket; mocked in tests with a plain channel.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn subscribe(&self) -> BotResult<mpsc::Receiver<CandleEvent>>;
}

pub struct BinanceKlineStream {
    symbol: String,
    timeframe: TimeFrame,
}

impl BinanceKlineStream {
    pub fn new(symbol: impl Into<String>, timeframe: TimeFrame) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/{}@kline_{}",
            BINANCE_WS,
            self.symbol.to_lowercase(),
            self.timeframe.as_str()
        )
    }

    async fn run_connection(url: &str, tx: mpsc::Sender<CandleEvent>) -> BotResult<()> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| BotError::TransientExchange {
                code: None,
                message: format!("websocket connect failed: {}", e),
            })?;
        let (_, mut read) = ws_stream.split();

        info!("Kline websocket connected");

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(event) = Self::parse_message(&text) {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Message::Ping(_)) => {
                    // tungstenite answers pings automatically
                    debug!("Received ping");
                }
                Ok(Message::Close(_)) => {
                    info!("Websocket closed by server");
                    break;
                }
                Err(e) => {
                    error!("Websocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn parse_message(text: &str) -> Option<CandleEvent> {
        let msg: WsKlineMessage = serde_json::from_str(text).ok()?;
        if msg.event_type != "kline" {
            return None;
        }
        let k = &msg.kline;

        Some(CandleEvent::Candle(Candle {
            open_time: Utc.timestamp_millis_opt(k.start_time).single()?,
            close_time: Utc.timestamp_millis_opt(k.close_time).single()?,
            open: Decimal::from_str(&k.open).ok()?,
            high: Decimal::from_str(&k.high).ok()?,
            low: Decimal::from_str(&k.low).ok()?,
            close: Decimal::from_str(&k.close).ok()?,
            volume: Decimal::from_str(&k.volume).ok()?,
            is_closed: k.is_closed,
        }))
    }
}

#[async_trait]
impl CandleSource for BinanceKlineStream {
    async fn subscribe(&self) -> BotResult<mpsc::Receiver<CandleEvent>> {
        let (tx, rx) = mpsc::channel(1000);
        let url = self.stream_url();

        info!("Subscribing to kline stream: {}", url);

        tokio::spawn(async move {
            loop {
                match Self::run_connection(&url, tx.clone()).await {
                    Ok(_) => {
                        warn!("Websocket connection closed, reconnecting...");
                    }
                    Err(e) => {
                        error!("Websocket error: {}, reconnecting...", e);
                        if tx.send(CandleEvent::Error(e.to_string())).await.is_err() {
                            break;
                        }
                    }
                }

                if tx.send(CandleEvent::Disconnected).await.is_err() {
                    break;
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        Ok(rx)
    }
}

// WebSocket Message Types
#[derive(Debug, Deserialize)]
struct WsKlineMessage {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "k")]
    kline: WsKlineData,
}

#[derive(Debug, Deserialize)]
struct WsKlineData {
    #[serde(rename = "t")]
    start_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_closed_kline() {
        let text = r#"{
            "e": "kline", "E": 1700003600001, "s": "BTCUSDT",
            "k": {
                "t": 1700000000000, "T": 1700003599999, "s": "BTCUSDT", "i": "1h",
                "o": "48000.10", "c": "48400.50", "h": "48500.90", "l": "47900.00",
                "v": "123.45", "x": true
            }
        }"#;

        match BinanceKlineStream::parse_message(text) {
            Some(CandleEvent::Candle(c)) => {
                assert!(c.is_closed);
                assert_eq!(c.close, dec!(48400.50));
                assert_eq!(c.high, dec!(48500.90));
            }
            other => panic!("expected candle, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ignores_other_events() {
        let text = r#"{"e": "aggTrade", "k": {"t": 0, "T": 0, "o": "0", "c": "0", "h": "0", "l": "0", "v": "0", "x": false}}"#;
        assert!(BinanceKlineStream::parse_message(text).is_none());
    }

    #[test]
    fn test_stream_url_shape() {
        let stream = BinanceKlineStream::new("BTCUSDT", TimeFrame::H1);
        assert!(stream.stream_url().ends_with("btcusdt@kline_1h"));
    }
}
