//! Frame layouts, header-string codec and matching rules.
//!
//! Layouts per exchange (each frame is a byte vector; topic and header
//! frames are UTF-8):
//!
//! | Exchange | Frames |
//! |----------|--------|
//! | DIRECT   | `[topic][body]` |
//! | TOPIC    | `[routing_key:topic][body]` |
//! | FANOUT   | `[""][topic][body]` |
//! | HEADERS  | `[header_string][topic][body]`, header_string = `k1=v1;k2=v2;` |
//!
//! Decoding infers the exchange from the frame shape: two frames are DIRECT
//! (TOPIC when the first frame contains `:`), three frames are FANOUT when
//! the first is empty, HEADERS otherwise.

use std::collections::BTreeMap;

use crate::BusError;

/// Exchange disciplines supported by the fabric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    Direct,
    Topic,
    Fanout,
    Headers,
}

/// A message as handed to [`Publisher::publish`][crate::Publisher::publish].
#[derive(Clone, Debug)]
pub struct Message {
    pub topic: String,
    pub body: Vec<u8>,
    /// Only meaningful for TOPIC messages.
    pub routing_key: String,
    /// Only meaningful for HEADERS messages. Ordered so the header string
    /// is deterministic.
    pub headers: BTreeMap<String, String>,
    pub exchange: ExchangeType,
}

impl Message {
    pub fn direct(topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            routing_key: String::new(),
            headers: BTreeMap::new(),
            exchange: ExchangeType::Direct,
        }
    }

    pub fn topic(
        routing_key: impl Into<String>,
        topic: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            routing_key: routing_key.into(),
            headers: BTreeMap::new(),
            exchange: ExchangeType::Topic,
        }
    }

    pub fn fanout(topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            routing_key: String::new(),
            headers: BTreeMap::new(),
            exchange: ExchangeType::Fanout,
        }
    }

    pub fn headers(
        topic: impl Into<String>,
        body: impl Into<Vec<u8>>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            routing_key: String::new(),
            headers,
            exchange: ExchangeType::Headers,
        }
    }
}

/// Serialize a message into its wire frames.
pub fn encode_frames(msg: &Message) -> Vec<Vec<u8>> {
    match msg.exchange {
        ExchangeType::Direct => vec![msg.topic.clone().into_bytes(), msg.body.clone()],
        ExchangeType::Topic => {
            let composite = if msg.routing_key.is_empty() {
                msg.topic.clone()
            } else {
                format!("{}:{}", msg.routing_key, msg.topic)
            };
            vec![composite.into_bytes(), msg.body.clone()]
        }
        ExchangeType::Fanout => vec![
            Vec::new(),
            msg.topic.clone().into_bytes(),
            msg.body.clone(),
        ],
        ExchangeType::Headers => vec![
            format_headers(&msg.headers).into_bytes(),
            msg.topic.clone().into_bytes(),
            msg.body.clone(),
        ],
    }
}

/// A frame sequence decoded back into (exchange, topic, headers, body).
#[derive(Clone, Debug)]
pub struct DecodedFrames {
    pub exchange: ExchangeType,
    pub topic: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// Infer the layout of a received frame sequence.
pub fn decode_frames(frames: &[Vec<u8>]) -> Result<DecodedFrames, BusError> {
    match frames.len() {
        2 => {
            let first = String::from_utf8_lossy(&frames[0]).into_owned();
            let exchange = if first.contains(':') {
                ExchangeType::Topic
            } else {
                ExchangeType::Direct
            };
            Ok(DecodedFrames {
                exchange,
                topic: first,
                headers: BTreeMap::new(),
                body: frames[1].clone(),
            })
        }
        3 => {
            if frames[0].is_empty() {
                Ok(DecodedFrames {
                    exchange: ExchangeType::Fanout,
                    topic: String::from_utf8_lossy(&frames[1]).into_owned(),
                    headers: BTreeMap::new(),
                    body: frames[2].clone(),
                })
            } else {
                let header_str = String::from_utf8_lossy(&frames[0]).into_owned();
                Ok(DecodedFrames {
                    exchange: ExchangeType::Headers,
                    topic: String::from_utf8_lossy(&frames[1]).into_owned(),
                    headers: parse_headers(&header_str),
                    body: frames[2].clone(),
                })
            }
        }
        n => Err(BusError::BadFrame(format!("unexpected frame count {n}"))),
    }
}

/// `k1=v1;k2=v2;` — trailing separator included, keys in map order.
pub fn format_headers(headers: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in headers {
        out.push_str(k);
        out.push('=');
        out.push_str(v);
        out.push(';');
    }
    out
}

/// Inverse of [`format_headers`]. Malformed tails are ignored.
pub fn parse_headers(s: &str) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    let mut pos = 0;
    while pos < s.len() {
        let Some(eq) = s[pos..].find('=').map(|i| pos + i) else {
            break;
        };
        let end = s[eq..].find(';').map(|i| eq + i).unwrap_or(s.len());
        headers.insert(s[pos..eq].to_string(), s[eq + 1..end].to_string());
        pos = end + 1;
    }
    headers
}

/// HEADERS delivery rule: the topic must match when a filter topic is set,
/// and every filter key must be present with a matching value. A filter
/// value containing commas matches if any comma-separated element equals
/// the message value (surrounding spaces ignored).
pub fn headers_match(
    filter: &BTreeMap<String, String>,
    filter_topic: Option<&str>,
    msg_topic: &str,
    msg_headers: &BTreeMap<String, String>,
) -> bool {
    if let Some(ft) = filter_topic {
        if !ft.is_empty() && msg_topic != ft {
            return false;
        }
    }

    for (key, filter_value) in filter {
        let Some(msg_value) = msg_headers.get(key) else {
            return false;
        };
        if filter_value.contains(',') {
            let any = filter_value
                .split(',')
                .map(str::trim)
                .any(|candidate| candidate == msg_value);
            if !any {
                return false;
            }
        } else if msg_value != filter_value {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// FrameHeader — binary envelope for dead-letter age detection
// ---------------------------------------------------------------------------

/// Length of the packed [`FrameHeader`].
pub const FRAME_HEADER_LEN: usize = 16;

/// Fixed binary envelope optionally prepended to a body so passive
/// observers can age-check a frame without understanding its payload.
/// Layout (little endian): i64 timestamp_ms, i32 msg_id, i16 version,
/// 2 reserved bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub timestamp_ms: i64,
    pub msg_id: i32,
    pub version: i16,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        out[0..8].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        out[8..12].copy_from_slice(&self.msg_id.to_le_bytes());
        out[12..14].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    /// Split a body into (header, payload). `None` when the body is too
    /// short to carry a header — such frames never participate in
    /// dead-letter detection.
    pub fn decode(body: &[u8]) -> Option<(Self, &[u8])> {
        if body.len() < FRAME_HEADER_LEN {
            return None;
        }
        let timestamp_ms = i64::from_le_bytes(body[0..8].try_into().ok()?);
        let msg_id = i32::from_le_bytes(body[8..12].try_into().ok()?);
        let version = i16::from_le_bytes(body[12..14].try_into().ok()?);
        Some((
            Self {
                timestamp_ms,
                msg_id,
                version,
            },
            &body[FRAME_HEADER_LEN..],
        ))
    }

    /// Prepend this header to a payload.
    pub fn wrap(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        out.extend_from_slice(&self.encode());
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn direct_round_trip() {
        let msg = Message::direct("order_log_task", b"{}".to_vec());
        let frames = encode_frames(&msg);
        assert_eq!(frames.len(), 2);

        let decoded = decode_frames(&frames).unwrap();
        assert_eq!(decoded.exchange, ExchangeType::Direct);
        assert_eq!(decoded.topic, "order_log_task");
        assert_eq!(decoded.body, b"{}");
    }

    #[test]
    fn topic_composite_first_frame() {
        let msg = Message::topic("cn.east", "orders", b"x".to_vec());
        let frames = encode_frames(&msg);
        assert_eq!(frames[0], b"cn.east:orders".to_vec());

        let decoded = decode_frames(&frames).unwrap();
        assert_eq!(decoded.exchange, ExchangeType::Topic);
        assert_eq!(decoded.topic, "cn.east:orders");
    }

    #[test]
    fn fanout_empty_lead_frame() {
        let msg = Message::fanout("heartbeat", b"x".to_vec());
        let frames = encode_frames(&msg);
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_empty());

        let decoded = decode_frames(&frames).unwrap();
        assert_eq!(decoded.exchange, ExchangeType::Fanout);
        assert_eq!(decoded.topic, "heartbeat");
    }

    #[test]
    fn headers_round_trip() {
        let msg = Message::headers(
            "vehicle_orders",
            b"{}".to_vec(),
            hdrs(&[("channel", "vehicle_orders"), ("type", "701")]),
        );
        let frames = encode_frames(&msg);
        assert_eq!(frames[0], b"channel=vehicle_orders;type=701;".to_vec());

        let decoded = decode_frames(&frames).unwrap();
        assert_eq!(decoded.exchange, ExchangeType::Headers);
        assert_eq!(decoded.headers.get("type").unwrap(), "701");
    }

    #[test]
    fn one_frame_is_rejected() {
        assert!(decode_frames(&[b"x".to_vec()]).is_err());
        assert!(decode_frames(&vec![b"a".to_vec(); 4]).is_err());
    }

    #[test]
    fn header_string_parse_ignores_malformed_tail() {
        let parsed = parse_headers("a=1;b=2;garbage");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["a"], "1");
        assert_eq!(parsed["b"], "2");
    }

    #[test]
    fn headers_match_requires_every_filter_key() {
        let msg = hdrs(&[("type", "701"), ("channel", "vehicle_orders")]);
        assert!(headers_match(&hdrs(&[("type", "701")]), None, "t", &msg));
        assert!(!headers_match(
            &hdrs(&[("type", "701"), ("region", "east")]),
            None,
            "t",
            &msg
        ));
        assert!(!headers_match(&hdrs(&[("type", "101")]), None, "t", &msg));
    }

    #[test]
    fn headers_match_comma_list_matches_any_element() {
        let msg = hdrs(&[("type", "701")]);
        assert!(headers_match(&hdrs(&[("type", "101, 701")]), None, "t", &msg));
        assert!(!headers_match(&hdrs(&[("type", "101,201")]), None, "t", &msg));
    }

    #[test]
    fn headers_match_topic_filter() {
        let msg = hdrs(&[("type", "701")]);
        let filter = hdrs(&[("type", "701")]);
        assert!(headers_match(&filter, Some("vehicle_orders"), "vehicle_orders", &msg));
        assert!(!headers_match(&filter, Some("vehicle_orders"), "order_retry", &msg));
        // Empty filter topic means "any topic".
        assert!(headers_match(&filter, Some(""), "order_retry", &msg));
    }

    #[test]
    fn frame_header_round_trip_and_short_body() {
        let header = FrameHeader {
            timestamp_ms: 1_700_000_000_000,
            msg_id: 42,
            version: 1,
        };
        let body = header.wrap(b"payload");
        let (decoded, rest) = FrameHeader::decode(&body).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(rest, b"payload");

        assert!(FrameHeader::decode(b"short").is_none());
    }
}
