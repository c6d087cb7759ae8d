use crate::{error::DataError, upstream::BarRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::warn;

/// Outbound streaming control message.
///
/// ### Raw Payload Examples
/// ```json
/// {"action": "auth", "key": "AKXXXX", "secret": "XXXX"}
/// {"action": "subscribe", "bars": ["AAPL", "MSFT"]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum FeedRequest<'a> {
    Auth { key: &'a str, secret: &'a str },
    Subscribe { bars: &'a [SmolStr] },
}

/// Inbound streaming event. Every frame is a JSON array of these, tagged by `"T"`.
///
/// ### Raw Payload Examples
/// ```json
/// [{"T": "success", "msg": "connected"}]
/// [{"T": "success", "msg": "authenticated"}]
/// [{"T": "error", "code": 402, "msg": "auth failed"}]
/// [{"T": "subscription", "trades": [], "quotes": [], "bars": ["AAPL"]}]
/// [{"T": "b", "S": "AAPL", "o": 172.1, "h": 172.4, "l": 171.9, "c": 172.3, "v": 10234, "t": "2024-03-11T14:31:00Z"}]
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "T")]
pub enum FeedEvent {
    #[serde(rename = "success")]
    Success { msg: String },

    #[serde(rename = "error")]
    Error { code: i64, msg: String },

    #[serde(rename = "subscription")]
    SubscriptionAck {
        #[serde(default)]
        bars: Vec<SmolStr>,
    },

    #[serde(rename = "b")]
    Bar(StreamBar),

    #[serde(other)]
    Unknown,
}

impl FeedEvent {
    pub const MSG_CONNECTED: &'static str = "connected";
    pub const MSG_AUTHENTICATED: &'static str = "authenticated";

    pub fn is_authenticated(&self) -> bool {
        matches!(self, FeedEvent::Success { msg } if msg == Self::MSG_AUTHENTICATED)
    }
}

/// Live 1-minute bar pushed by the streaming feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamBar {
    #[serde(rename = "S")]
    pub symbol: SmolStr,
    #[serde(rename = "t")]
    pub time: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
}

impl From<StreamBar> for BarRecord {
    fn from(bar: StreamBar) -> Self {
        Self {
            time: bar.time,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }
}

/// Decode one inbound text frame into its events.
///
/// The frame itself must be a JSON array. An element that fails to decode is logged and skipped;
/// the rest of the frame is kept.
pub fn decode_frame(text: &str) -> Result<Vec<FeedEvent>, DataError> {
    let elements = serde_json::from_str::<Vec<serde_json::Value>>(text)?;

    Ok(elements
        .into_iter()
        .filter_map(|element| match serde_json::from_value::<FeedEvent>(element) {
            Ok(event) => Some(event),
            Err(error) => {
                warn!(%error, "skipping malformed streaming event");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_frame() {
        struct TestCase {
            input: &'static str,
            expected: Result<Vec<FeedEvent>, ()>,
        }

        let tests = vec![
            TestCase {
                // TC0: connected + authenticated in one frame
                input: r#"[{"T":"success","msg":"connected"},{"T":"success","msg":"authenticated"}]"#,
                expected: Ok(vec![
                    FeedEvent::Success {
                        msg: "connected".to_string(),
                    },
                    FeedEvent::Success {
                        msg: "authenticated".to_string(),
                    },
                ]),
            },
            TestCase {
                // TC1: auth failure
                input: r#"[{"T":"error","code":402,"msg":"auth failed"}]"#,
                expected: Ok(vec![FeedEvent::Error {
                    code: 402,
                    msg: "auth failed".to_string(),
                }]),
            },
            TestCase {
                // TC2: subscription ack ignores other channels
                input: r#"[{"T":"subscription","trades":[],"quotes":[],"bars":["AAPL","MSFT"]}]"#,
                expected: Ok(vec![FeedEvent::SubscriptionAck {
                    bars: vec![SmolStr::new("AAPL"), SmolStr::new("MSFT")],
                }]),
            },
            TestCase {
                // TC3: bar with integer volume
                input: r#"[{"T":"b","S":"BTC/USD","o":61000.5,"h":61010,"l":60990,"c":61005.25,"v":3,"t":"2024-03-11T14:31:00Z","n":12,"vw":61001.1}]"#,
                expected: Ok(vec![FeedEvent::Bar(StreamBar {
                    symbol: SmolStr::new("BTC/USD"),
                    time: Utc.with_ymd_and_hms(2024, 3, 11, 14, 31, 0).unwrap(),
                    open: 61000.5,
                    high: 61010.0,
                    low: 60990.0,
                    close: 61005.25,
                    volume: 3.0,
                })]),
            },
            TestCase {
                // TC4: unknown event types are tolerated
                input: r#"[{"T":"t","S":"AAPL","p":1.0},{"T":"success","msg":"connected"}]"#,
                expected: Ok(vec![
                    FeedEvent::Unknown,
                    FeedEvent::Success {
                        msg: "connected".to_string(),
                    },
                ]),
            },
            TestCase {
                // TC5: malformed bar is skipped, the rest of the frame is kept
                input: r#"[{"T":"b","S":"AAPL","o":1,"h":2,"l":0.5,"c":1.5,"v":10,"t":"2024-03-11T14:31:00Z"},{"T":"b","S":"MSFT","o":"x","h":2,"l":1,"c":1,"v":1,"t":"2024-03-11T14:31:00Z"},{"T":"success","msg":"authenticated"}]"#,
                expected: Ok(vec![
                    FeedEvent::Bar(StreamBar {
                        symbol: SmolStr::new("AAPL"),
                        time: Utc.with_ymd_and_hms(2024, 3, 11, 14, 31, 0).unwrap(),
                        open: 1.0,
                        high: 2.0,
                        low: 0.5,
                        close: 1.5,
                        volume: 10.0,
                    }),
                    FeedEvent::Success {
                        msg: "authenticated".to_string(),
                    },
                ]),
            },
            TestCase {
                // TC6: frame must be an array
                input: r#"{"T":"success","msg":"connected"}"#,
                expected: Err(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = decode_frame(test.input).map_err(|_| ());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_encode_requests() {
        let auth = serde_json::to_string(&FeedRequest::Auth {
            key: "key",
            secret: "secret",
        })
        .unwrap();
        assert_eq!(auth, r#"{"action":"auth","key":"key","secret":"secret"}"#);

        let symbols = [SmolStr::new("AAPL"), SmolStr::new("MSFT")];
        let subscribe = serde_json::to_string(&FeedRequest::Subscribe { bars: &symbols }).unwrap();
        assert_eq!(subscribe, r#"{"action":"subscribe","bars":["AAPL","MSFT"]}"#);
    }
}
