//! JSON bodies that cross the bus.
//!
//! The candidate payload keeps the upstream field names (they are part of
//! the wire contract consumed by the merchant console), so the struct
//! fields carry serde renames rather than transliterations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding a bus body.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("unparsable payload: {0}")]
    Parse(#[from] serde_json::Error),
    /// Parsed fine but the shape is not what the topic promises.
    #[error("bad payload shape: {0}")]
    Shape(String),
}

// ---------------------------------------------------------------------------
// Candidate payload (dispatch → vehicle clients)
// ---------------------------------------------------------------------------

/// One order summary as published on `vehicle_orders` and `order_retry`.
///
/// The full body is a JSON object keyed by the stringified order id:
/// `{"1001": { "订单编号": ..., ... }}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CandidateSummary {
    #[serde(rename = "订单编号")]
    pub order_no: String,
    #[serde(rename = "订单类型")]
    pub order_type: String,
    #[serde(rename = "取货地点")]
    pub pickup_address: String,
    #[serde(rename = "送货地点")]
    pub delivery_address: String,
    /// `YYYY-MM-DD HH:MM:SS`.
    #[serde(rename = "发布时间")]
    pub published_at: String,
    #[serde(rename = "奖励金额")]
    pub reward: f64,
    #[serde(rename = "配送距离")]
    pub distance: i32,
    /// Remaining-time text, `"{n}秒"`.
    #[serde(rename = "剩余时间")]
    pub ttl_text: String,
}

/// Encode a batch of candidates into the keyed-object wire form.
pub fn encode_candidates(batch: &BTreeMap<String, CandidateSummary>) -> Result<String, PayloadError> {
    Ok(serde_json::to_string(batch)?)
}

/// Decode a candidate body into (order_id, raw summary JSON) pairs.
///
/// The cache stores the raw per-order JSON verbatim, so this returns
/// unparsed values rather than [`CandidateSummary`] structs.
pub fn decode_candidates(body: &str) -> Result<BTreeMap<String, serde_json::Value>, PayloadError> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    let obj = value
        .as_object()
        .ok_or_else(|| PayloadError::Shape("candidate body must be a JSON object".into()))?;
    Ok(obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

// ---------------------------------------------------------------------------
// Finalization payload (claim winner → order_log_task)
// ---------------------------------------------------------------------------

/// Body of the DIRECT `order_log_task` message that drives finalization.
///
/// `order_id` travels as a decimal string; everything else is numeric.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FinalizePayload {
    pub order_id: String,
    pub uv_id: i64,
    pub response_time_ms: i64,
    pub order_type_code: i64,
    pub order_reward: f64,
}

impl FinalizePayload {
    pub fn encode(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(body: &str) -> Result<Self, PayloadError> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn order_id_num(&self) -> Result<i64, PayloadError> {
        self.order_id
            .parse()
            .map_err(|_| PayloadError::Shape(format!("order_id not numeric: {}", self.order_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> CandidateSummary {
        CandidateSummary {
            order_no: "ORD-1700000000000-1234".into(),
            order_type: "四轮车,鲜花,鲜花配送车,保温箱".into(),
            pickup_address: "北京市朝阳区".into(),
            delivery_address: "上海市浦东新区".into(),
            published_at: "2025-06-01 12:00:00".into(),
            reward: 88.5,
            distance: 12,
            ttl_text: "600秒".into(),
        }
    }

    #[test]
    fn candidate_wire_keys_are_exact() {
        let mut batch = BTreeMap::new();
        batch.insert("1001".to_string(), summary());
        let body = encode_candidates(&batch).unwrap();

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        let entry = &value["1001"];
        for key in [
            "订单编号", "订单类型", "取货地点", "送货地点",
            "发布时间", "奖励金额", "配送距离", "剩余时间",
        ] {
            assert!(entry.get(key).is_some(), "missing wire key {key}");
        }
    }

    #[test]
    fn decode_candidates_returns_per_order_values() {
        let mut batch = BTreeMap::new();
        batch.insert("1001".to_string(), summary());
        batch.insert("1002".to_string(), summary());
        let body = encode_candidates(&batch).unwrap();

        let decoded = decode_candidates(&body).unwrap();
        assert_eq!(decoded.len(), 2);
        let one: CandidateSummary = serde_json::from_value(decoded["1001"].clone()).unwrap();
        assert_eq!(one, summary());
    }

    #[test]
    fn decode_rejects_non_object_body() {
        assert!(matches!(
            decode_candidates("[1, 2, 3]"),
            Err(PayloadError::Shape(_))
        ));
        assert!(matches!(decode_candidates("not json"), Err(PayloadError::Parse(_))));
    }

    #[test]
    fn finalize_payload_round_trips_with_string_order_id() {
        let payload = FinalizePayload {
            order_id: "1003".into(),
            uv_id: 50,
            response_time_ms: 17,
            order_type_code: 101,
            order_reward: 42.42,
        };
        let body = payload.encode().unwrap();
        assert!(body.contains("\"order_id\":\"1003\""), "{body}");

        let back = FinalizePayload::decode(&body).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.order_id_num().unwrap(), 1003);
    }
}
