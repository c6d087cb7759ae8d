use super::{BarsRequest, MarketDataApi, RawBarPage};
use crate::{
    candle::{Timeframe, is_always_on_symbol},
    config::UpstreamConfig,
    error::DataError,
    http::RateLimitedHttpClient,
};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;
use url::Url;

/// Rate-limit key shared by every historical bars request.
pub const BARS_REQUEST_KEY: &str = "bars";

/// Rate-limit key for the session clock.
pub const CLOCK_REQUEST_KEY: &str = "clock";

const KEY_ID_HEADER: &str = "APCA-API-KEY-ID";
const SECRET_KEY_HEADER: &str = "APCA-API-SECRET-KEY";

/// Historical bars response.
///
/// Session-gated instruments return a flat list, always-on instruments a map keyed by symbol.
/// `bars` is `null` when the window holds no data.
#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Option<BarsPayload>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BarsPayload {
    List(Vec<serde_json::Value>),
    BySymbol(HashMap<String, Vec<serde_json::Value>>),
}

#[derive(Debug, Deserialize)]
struct ClockResponse {
    is_open: bool,
}

/// Decode a historical bars response body into a [`RawBarPage`] for `symbol`.
pub fn decode_bars_response(body: &str, symbol: &str) -> Result<RawBarPage, DataError> {
    let response = serde_json::from_str::<BarsResponse>(body)?;

    let bars = match response.bars {
        None => Vec::new(),
        Some(BarsPayload::List(bars)) => bars,
        Some(BarsPayload::BySymbol(mut by_symbol)) => by_symbol.remove(symbol).unwrap_or_default(),
    };

    Ok(RawBarPage {
        bars,
        next_page_token: response.next_page_token.filter(|token| !token.is_empty()),
    })
}

fn upstream_timeframe(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::M1 => "1Min",
        Timeframe::M5 => "5Min",
        Timeframe::M15 => "15Min",
        Timeframe::H1 => "1Hour",
        Timeframe::H4 => "4Hour",
        Timeframe::D1 => "1Day",
    }
}

/// [`MarketDataApi`] implementation over the upstream REST API.
#[derive(Debug, Clone)]
pub struct RestMarketDataApi {
    client: Arc<RateLimitedHttpClient>,
    config: UpstreamConfig,
}

impl RestMarketDataApi {
    pub fn new(client: Arc<RateLimitedHttpClient>, config: UpstreamConfig) -> Self {
        Self { client, config }
    }

    /// Build the bars URL for a request, routing always-on symbols to the crypto endpoint.
    pub fn bars_url(&self, request: &BarsRequest) -> Result<Url, DataError> {
        let base = self.config.rest_url.trim_end_matches('/');
        let always_on = is_always_on_symbol(&request.symbol);

        let mut url = if always_on {
            Url::parse(&format!("{base}/v1beta3/crypto/us/bars"))
        } else {
            Url::parse(&format!("{base}/v2/stocks/{}/bars", request.symbol))
        }
        .map_err(|error| DataError::Http(format!("invalid bars url: {error}")))?;

        {
            let mut query = url.query_pairs_mut();
            if always_on {
                query.append_pair("symbols", &request.symbol);
            }
            query
                .append_pair("timeframe", upstream_timeframe(request.timeframe))
                .append_pair(
                    "start",
                    &request.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                )
                .append_pair("end", &request.end.to_rfc3339_opts(SecondsFormat::Secs, true))
                .append_pair("limit", &request.limit.to_string())
                .append_pair("sort", "asc");
            if let Some(token) = &request.page_token {
                query.append_pair("page_token", token);
            }
        }

        Ok(url)
    }

    async fn get(&self, request_key: &str, url: Url) -> Result<String, DataError> {
        let request = self
            .client
            .http()
            .get(url)
            .header(KEY_ID_HEADER, &self.config.credentials.key_id)
            .header(SECRET_KEY_HEADER, &self.config.credentials.secret_key)
            .build()?;

        let response = self.client.execute(request_key, request).await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(DataError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }
}

#[async_trait]
impl MarketDataApi for RestMarketDataApi {
    async fn fetch_bars(&self, request: &BarsRequest) -> Result<RawBarPage, DataError> {
        let url = self.bars_url(request)?;
        debug!(symbol = %request.symbol, %url, "fetching bars page");

        let body = self.get(BARS_REQUEST_KEY, url).await?;
        decode_bars_response(&body, &request.symbol)
    }

    async fn is_session_open(&self) -> Result<bool, DataError> {
        let base = self.config.clock_url.trim_end_matches('/');
        let url = Url::parse(&format!("{base}/v2/clock"))
            .map_err(|error| DataError::Http(format!("invalid clock url: {error}")))?;

        let body = self.get(CLOCK_REQUEST_KEY, url).await?;
        let clock = serde_json::from_str::<ClockResponse>(&body)?;
        Ok(clock.is_open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use chrono::{TimeZone, Utc};
    use smol_str::SmolStr;

    fn api() -> RestMarketDataApi {
        RestMarketDataApi::new(
            Arc::new(RateLimitedHttpClient::with_client(
                reqwest::Client::new(),
                RateLimitConfig::default(),
            )),
            UpstreamConfig::default().with_rest_url("https://data.example.com/"),
        )
    }

    fn request(symbol: &str, page_token: Option<&str>) -> BarsRequest {
        BarsRequest {
            symbol: SmolStr::new(symbol),
            timeframe: Timeframe::M1,
            start: Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 12, 0, 0, 0).unwrap(),
            limit: 10_000,
            page_token: page_token.map(str::to_string),
        }
    }

    #[test]
    fn test_bars_url_session_gated() {
        let url = api().bars_url(&request("AAPL", Some("abc"))).unwrap();
        assert_eq!(url.path(), "/v2/stocks/AAPL/bars");

        let query = url.query_pairs().into_owned().collect::<HashMap<_, _>>();
        assert_eq!(query["timeframe"], "1Min");
        assert_eq!(query["start"], "2024-03-11T00:00:00Z");
        assert_eq!(query["end"], "2024-03-12T00:00:00Z");
        assert_eq!(query["limit"], "10000");
        assert_eq!(query["page_token"], "abc");
        assert!(!query.contains_key("symbols"));
    }

    #[test]
    fn test_bars_url_always_on() {
        let url = api().bars_url(&request("BTC/USD", None)).unwrap();
        assert_eq!(url.path(), "/v1beta3/crypto/us/bars");

        let query = url.query_pairs().into_owned().collect::<HashMap<_, _>>();
        assert_eq!(query["symbols"], "BTC/USD");
        assert!(!query.contains_key("page_token"));
    }

    #[test]
    fn test_decode_bars_response() {
        struct TestCase {
            input: &'static str,
            symbol: &'static str,
            expected_bars: usize,
            expected_token: Option<&'static str>,
        }

        let tests = vec![
            TestCase {
                // TC0: session-gated list with continuation
                input: r#"{"bars":[{"t":"2024-03-11T14:31:00Z","o":1,"h":1,"l":1,"c":1,"v":1}],"symbol":"AAPL","next_page_token":"QUFQTA=="}"#,
                symbol: "AAPL",
                expected_bars: 1,
                expected_token: Some("QUFQTA=="),
            },
            TestCase {
                // TC1: always-on map keyed by symbol, last page
                input: r#"{"bars":{"BTC/USD":[{"t":"2024-03-11T14:31:00Z","o":1,"h":1,"l":1,"c":1,"v":0.5},{"t":"2024-03-11T14:32:00Z","o":1,"h":1,"l":1,"c":1,"v":0.5}]},"next_page_token":null}"#,
                symbol: "BTC/USD",
                expected_bars: 2,
                expected_token: None,
            },
            TestCase {
                // TC2: null bars
                input: r#"{"bars":null,"symbol":"AAPL","next_page_token":null}"#,
                symbol: "AAPL",
                expected_bars: 0,
                expected_token: None,
            },
            TestCase {
                // TC3: empty token treated as last page
                input: r#"{"bars":[],"next_page_token":""}"#,
                symbol: "AAPL",
                expected_bars: 0,
                expected_token: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = decode_bars_response(test.input, test.symbol).unwrap();
            assert_eq!(actual.bars.len(), test.expected_bars, "TC{} failed", index);
            assert_eq!(
                actual.next_page_token.as_deref(),
                test.expected_token,
                "TC{} failed",
                index
            );
        }
    }

    #[test]
    fn test_decode_bars_response_rejects_garbage() {
        assert!(matches!(
            decode_bars_response("<html>", "AAPL"),
            Err(DataError::Decode(_))
        ));
    }
}
