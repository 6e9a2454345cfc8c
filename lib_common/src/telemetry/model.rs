//! # Telemetry Model
//!
//! Typed schema for the miner feed. Every telemetry attribute the feed may or
//! may not send is an `Option`, and payloads are validated once, at the parse
//! boundary, instead of being probed field by field at each use site.
//!
//! Wire format of one inbound message:
//!
//! ```json
//! { "miners": [{ "ip": "10.0.0.1", "status": "fulfilled", "data": { "summary": { "hashrateAvg": 1000000 } } }],
//!   "timestamp": "2024-05-01T12:00:00Z", "cycleId": "42", "error": null }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::{normalize_address, now_rfc3339};

/// Error text recorded for a rejected device whose payload carries no reason.
pub const CONNECT_FAILURE_MESSAGE: &str = "No se pudo conectar";

/// Outcome of the most recent upstream fetch for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    /// The device answered the poll.
    Fulfilled,
    /// The device could not be polled.
    Rejected,
}

/// Hashrate and share counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Summary {
    /// Instantaneous hashrate in H/s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashrate: Option<f64>,
    /// Averaged hashrate in H/s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashrate_avg: Option<f64>,
    /// Five minute average in H/s.
    #[serde(rename = "hashrate5m", skip_serializing_if = "Option::is_none")]
    pub hashrate_5m: Option<f64>,
    /// Seconds since the mining process started.
    #[serde(alias = "uptime", skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    /// Accepted shares.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted: Option<u64>,
    /// Rejected shares.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<u64>,
}

/// Temperature readings in degrees Celsius.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Temperatures {
    /// Device (board controller) temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<f64>,
    /// One reading per hashboard / module.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub boards: Vec<f64>,
    /// Hottest chip reported by the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chip_max: Option<f64>,
}

/// Fan speeds in RPM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Fans {
    /// Intake fan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intake: Option<f64>,
    /// Exhaust fan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exhaust: Option<f64>,
    /// Raw per-fan readings when the device reports more than two fans.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub speeds: Vec<f64>,
}

/// Pool connection and worker identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolInfo {
    /// Stratum URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Worker name, usually `account.rig`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Pool state as reported by the device ("Alive", "Dead", ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// The nested telemetry payload of one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MinerData {
    /// Hashrate figures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    /// Temperature readings.
    #[serde(alias = "temperatures", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Temperatures>,
    /// Fan speeds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fans: Option<Fans>,
    /// Power draw in watts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    /// Pool and worker identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolInfo>,
    /// Upstream error for this device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Fields this schema does not know about, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MinerData {
    /// Decodes a `data` object, keeping whatever fits the schema.
    ///
    /// A field of the wrong type is logged and left out instead of failing
    /// the whole payload. A non-string `error` is rendered as text, or
    /// dropped when it carries nothing (`false`, `0`, `{}`).
    pub fn from_value_lossy(value: Value) -> Option<MinerData> {
        let mut fields = match value {
            Value::Object(fields) => fields,
            Value::Null => return None,
            other => {
                log::warn!("Ignoring miner data that is not an object: {}", other);
                return None;
            }
        };
        if let Some(error) = fields.remove("error") {
            if let Some(text) = error_text(&error) {
                fields.insert("error".to_string(), Value::String(text));
            }
        }

        let whole = Value::Object(fields.clone());
        if let Ok(data) = serde_json::from_value(whole) {
            return Some(data);
        }

        let mut kept = Map::new();
        for (key, field) in fields {
            let mut single = Map::new();
            single.insert(key.clone(), field);
            match serde_json::from_value::<MinerData>(Value::Object(single.clone())) {
                Ok(_) => kept.extend(single),
                Err(e) => log::warn!("Ignoring miner data field `{}`: {}", key, e),
            }
        }
        match serde_json::from_value(Value::Object(kept)) {
            Ok(data) => Some(data),
            Err(e) => {
                log::warn!("Ignoring miner data: {}", e);
                None
            }
        }
    }
}

/// Text of an `error` value, or `None` when it does not signal an error.
///
/// `null`, `false`, `0`, `""` and empty containers mean "no error". A
/// non-empty string is taken as is; anything else is rendered as JSON.
pub fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(text) if text.trim().is_empty() => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(fields) if fields.is_empty() => None,
        other => Some(other.to_string()),
    }
}

/// One per-device result inside an [`UpdateBatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    /// Network address as sent by the feed; may be missing.
    pub ip: Option<String>,
    /// Fetch outcome.
    pub status: FetchStatus,
    /// Telemetry payload.
    pub data: Option<MinerData>,
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(default)]
    ip: Option<String>,
    status: FetchStatus,
    #[serde(default)]
    data: Value,
}

impl BatchEntry {
    /// Decodes one element of `miners`. Only `ip` and `status` are strict;
    /// the telemetry payload goes through [`MinerData::from_value_lossy`].
    pub fn from_value(value: Value) -> Result<BatchEntry, serde_json::Error> {
        let raw: RawEntry = serde_json::from_value(value)?;
        Ok(BatchEntry {
            ip: raw.ip,
            status: raw.status,
            data: MinerData::from_value_lossy(raw.data),
        })
    }

    /// Normalized address, or `None` when the feed sent none (or only whitespace).
    pub fn address(&self) -> Option<String> {
        self.ip
            .as_deref()
            .map(normalize_address)
            .filter(|ip| !ip.is_empty())
    }
}

/// One message from the live feed: the results of a polling cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateBatch {
    /// Per-device results, in feed order.
    pub entries: Vec<BatchEntry>,
    /// Batch timestamp as sent by the feed.
    pub timestamp: Option<String>,
    /// Polling cycle identifier as sent by the feed.
    pub cycle_id: Option<String>,
}

/// Result of parsing a raw feed message.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    /// A well-formed batch.
    Batch(UpdateBatch),
    /// The server reported an error instead of data.
    ServerError(String),
    /// The message does not have the batch shape.
    Malformed(String),
}

impl UpdateBatch {
    /// Parses one text frame from the feed.
    ///
    /// Shape failures of the message as a whole yield [`ParsedMessage::Malformed`].
    /// An entry without a valid `status` (or with a non-string `ip`) is dropped
    /// on its own and the rest of the batch is kept; a badly typed telemetry
    /// field only loses that field.
    pub fn parse(text: &str) -> ParsedMessage {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => return ParsedMessage::Malformed(format!("invalid JSON: {}", e)),
        };
        let Some(object) = value.as_object() else {
            return ParsedMessage::Malformed("message is not a JSON object".to_string());
        };

        if let Some(message) = object.get("error").and_then(error_text) {
            return ParsedMessage::ServerError(message);
        }

        let Some(miners) = object.get("miners").and_then(Value::as_array) else {
            return ParsedMessage::Malformed("`miners` is missing or not a sequence".to_string());
        };

        let mut entries = Vec::with_capacity(miners.len());
        for (index, raw) in miners.iter().enumerate() {
            match BatchEntry::from_value(raw.clone()) {
                Ok(entry) => entries.push(entry),
                Err(e) => log::warn!("Dropping feed entry #{}: {}", index, e),
            }
        }

        ParsedMessage::Batch(UpdateBatch {
            entries,
            timestamp: object.get("timestamp").and_then(scalar_to_string),
            cycle_id: object.get("cycleId").and_then(scalar_to_string),
        })
    }

    /// Timestamp to record for this batch: the feed's own, else the current time.
    pub fn stamp(&self) -> String {
        self.timestamp.clone().unwrap_or_else(now_rfc3339)
    }

    /// True when the batch carries no device entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Most recently known state of one physical device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    /// Normalized network address; the map key.
    pub ip: String,
    /// Outcome of the most recent fetch.
    pub status: FetchStatus,
    /// Last telemetry payload received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<MinerData>,
    /// Present only while `status` is `Rejected`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// RFC 3339 time of the last merge that touched this device.
    pub last_updated: String,
}

impl DeviceSnapshot {
    /// Builds the record that results from applying `entry` over `previous`.
    ///
    /// Shallow overwrite: the status is always replaced, the payload only when
    /// the entry carries one. The error follows the status.
    pub fn merged(previous: Option<&DeviceSnapshot>, address: String, entry: &BatchEntry, stamp: &str) -> Self {
        let data = entry
            .data
            .clone()
            .or_else(|| previous.and_then(|p| p.data.clone()));

        let error = match entry.status {
            FetchStatus::Rejected => Some(
                entry
                    .data
                    .as_ref()
                    .and_then(|d| d.error.clone())
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| CONNECT_FAILURE_MESSAGE.to_string()),
            ),
            FetchStatus::Fulfilled => None,
        };

        Self {
            ip: address,
            status: entry.status,
            data,
            error,
            last_updated: stamp.to_string(),
        }
    }

    /// True when the last fetch succeeded.
    pub fn is_online(&self) -> bool {
        self.status == FetchStatus::Fulfilled
    }

    /// Best available hashrate: the average when reported, else the instantaneous figure.
    pub fn hashrate(&self) -> Option<f64> {
        let summary = self.data.as_ref()?.summary.as_ref()?;
        summary.hashrate_avg.or(summary.hashrate)
    }

    /// Hottest reading across device, boards and chips.
    pub fn max_temperature(&self) -> Option<f64> {
        let temps = self.data.as_ref()?.temperature.as_ref()?;
        temps
            .device
            .into_iter()
            .chain(temps.boards.iter().copied())
            .chain(temps.chip_max)
            .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))))
    }

    /// Worker identity reported by the pool section.
    pub fn worker(&self) -> Option<&str> {
        self.data.as_ref()?.pool.as_ref()?.worker.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(text: &str) -> UpdateBatch {
        match UpdateBatch::parse(text) {
            ParsedMessage::Batch(b) => b,
            other => panic!("expected a batch, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_full_batch() {
        let text = json!({
            "miners": [{
                "ip": "10.0.0.1",
                "status": "fulfilled",
                "data": {
                    "summary": { "hashrate": 98000000.0, "hashrateAvg": 100000000.0, "uptime": 3600 },
                    "temperature": { "device": 61.5, "boards": [70.0, 72.5], "chipMax": 80.0 },
                    "fans": { "intake": 4200, "exhaust": 4300 },
                    "power": 3250.0,
                    "pool": { "url": "stratum+tcp://pool:3333", "worker": "acct.rig1" },
                    "firmware": "2024.1"
                }
            }],
            "timestamp": "2024-05-01T12:00:00Z",
            "cycleId": 42
        })
        .to_string();

        let b = batch(&text);
        assert_eq!(b.entries.len(), 1);
        assert_eq!(b.timestamp.as_deref(), Some("2024-05-01T12:00:00Z"));
        assert_eq!(b.cycle_id.as_deref(), Some("42"));

        let data = b.entries[0].data.as_ref().unwrap();
        let summary = data.summary.as_ref().unwrap();
        assert_eq!(summary.hashrate_avg, Some(100000000.0));
        assert_eq!(summary.uptime_secs, Some(3600));
        assert_eq!(data.temperature.as_ref().unwrap().boards, vec![70.0, 72.5]);
        assert_eq!(data.fans.as_ref().unwrap().exhaust, Some(4300.0));
        assert_eq!(data.pool.as_ref().unwrap().worker.as_deref(), Some("acct.rig1"));
        assert_eq!(data.extra.get("firmware"), Some(&json!("2024.1")));
    }

    #[test]
    fn test_parse_server_error() {
        let parsed = UpdateBatch::parse(r#"{"error":"poller crashed","miners":[]}"#);
        assert_eq!(parsed, ParsedMessage::ServerError("poller crashed".to_string()));
    }

    #[test]
    fn test_parse_empty_error_is_not_an_error() {
        let b = batch(r#"{"error":"","miners":[]}"#);
        assert!(b.is_empty());
    }

    #[test]
    fn test_parse_malformed_shapes() {
        assert!(matches!(UpdateBatch::parse("not json"), ParsedMessage::Malformed(_)));
        assert!(matches!(UpdateBatch::parse("[1,2,3]"), ParsedMessage::Malformed(_)));
        assert!(matches!(UpdateBatch::parse(r#"{"miners":{"ip":"x"}}"#), ParsedMessage::Malformed(_)));
        assert!(matches!(UpdateBatch::parse(r#"{"timestamp":"T1"}"#), ParsedMessage::Malformed(_)));
    }

    #[test]
    fn test_parse_drops_only_bad_entries() {
        let b = batch(
            r#"{"miners":[
                {"ip":"10.0.0.1","status":"fulfilled","data":{}},
                {"ip":"10.0.0.2","status":"exploded"},
                {"ip":"10.0.0.3","status":"rejected","data":{"summary":{"hashrate":"fast"},"power":3000}},
                {"ip":"10.0.0.4","status":"rejected"},
                {"ip":5,"status":"fulfilled"}
            ]}"#,
        );
        let ips: Vec<_> = b.entries.iter().filter_map(BatchEntry::address).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.3", "10.0.0.4"]);

        let data = b.entries[1].data.as_ref().unwrap();
        assert_eq!(data.summary, None);
        assert_eq!(data.power, Some(3000.0));
    }

    #[test]
    fn test_falsy_error_values_are_not_server_errors() {
        for error in ["false", "0", "0.0", "null", r#""""#, "[]", "{}"] {
            let text = format!(
                r#"{{"error":{},"miners":[{{"ip":"10.0.0.1","status":"fulfilled"}}],"timestamp":"T1"}}"#,
                error
            );
            let b = batch(&text);
            assert_eq!(b.entries.len(), 1, "error={}", error);
        }
    }

    #[test]
    fn test_truthy_error_values_are_server_errors() {
        assert_eq!(UpdateBatch::parse(r#"{"error":true}"#), ParsedMessage::ServerError("true".into()));
        assert_eq!(UpdateBatch::parse(r#"{"error":503}"#), ParsedMessage::ServerError("503".into()));
        assert_eq!(
            UpdateBatch::parse(r#"{"error":{"code":"EPOLL"},"miners":[]}"#),
            ParsedMessage::ServerError(r#"{"code":"EPOLL"}"#.into())
        );
    }

    #[test]
    fn test_structured_device_error_is_kept_as_text() {
        let b = batch(
            r#"{"miners":[{"ip":"10.0.0.1","status":"rejected","data":{"error":{"code":"ECONNREFUSED"}}}],"timestamp":"T1"}"#,
        );
        assert_eq!(b.entries.len(), 1);
        let entry = &b.entries[0];
        assert_eq!(entry.status, FetchStatus::Rejected);
        assert_eq!(
            entry.data.as_ref().and_then(|d| d.error.as_deref()),
            Some(r#"{"code":"ECONNREFUSED"}"#)
        );

        let snap = DeviceSnapshot::merged(None, "10.0.0.1".into(), entry, "T1");
        assert_eq!(snap.error.as_deref(), Some(r#"{"code":"ECONNREFUSED"}"#));
    }

    #[test]
    fn test_mistyped_reading_keeps_the_entry() {
        let b = batch(
            r#"{"miners":[{"ip":"10.0.0.1","status":"fulfilled","data":{"temperature":65,"summary":{"hashrateAvg":5.0}}}]}"#,
        );
        assert_eq!(b.entries.len(), 1);
        let data = b.entries[0].data.as_ref().unwrap();
        assert_eq!(data.temperature, None);
        assert_eq!(data.summary.as_ref().and_then(|s| s.hashrate_avg), Some(5.0));
        assert!(data.extra.is_empty());
    }

    #[test]
    fn test_false_device_error_falls_back_to_default_message() {
        let b = batch(r#"{"miners":[{"ip":"10.0.0.1","status":"rejected","data":{"error":false}}]}"#);
        let snap = DeviceSnapshot::merged(None, "10.0.0.1".into(), &b.entries[0], "T1");
        assert_eq!(snap.error.as_deref(), Some(CONNECT_FAILURE_MESSAGE));
    }

    #[test]
    fn test_non_object_data_is_dropped() {
        assert_eq!(MinerData::from_value_lossy(json!(42)), None);
        assert_eq!(MinerData::from_value_lossy(Value::Null), None);
    }

    #[test]
    fn test_entry_address_missing_or_blank() {
        let b = batch(r#"{"miners":[{"status":"fulfilled"},{"ip":"  ","status":"fulfilled"},{"ip":" A.B ","status":"fulfilled"}]}"#);
        assert_eq!(b.entries[0].address(), None);
        assert_eq!(b.entries[1].address(), None);
        assert_eq!(b.entries[2].address().as_deref(), Some("a.b"));
    }

    #[test]
    fn test_merged_rejected_uses_payload_error_or_fallback() {
        let entry = BatchEntry { ip: Some("10.0.0.9".into()), status: FetchStatus::Rejected, data: None };
        let snap = DeviceSnapshot::merged(None, "10.0.0.9".into(), &entry, "T1");
        assert_eq!(snap.error.as_deref(), Some(CONNECT_FAILURE_MESSAGE));

        let entry = BatchEntry {
            ip: Some("10.0.0.9".into()),
            status: FetchStatus::Rejected,
            data: Some(MinerData { error: Some("timeout".into()), ..Default::default() }),
        };
        let snap = DeviceSnapshot::merged(None, "10.0.0.9".into(), &entry, "T1");
        assert_eq!(snap.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_merged_keeps_previous_payload_when_absent() {
        let first = BatchEntry {
            ip: Some("10.0.0.1".into()),
            status: FetchStatus::Fulfilled,
            data: Some(MinerData {
                power: Some(3100.0),
                ..Default::default()
            }),
        };
        let before = DeviceSnapshot::merged(None, "10.0.0.1".into(), &first, "T1");

        let second = BatchEntry { ip: Some("10.0.0.1".into()), status: FetchStatus::Rejected, data: None };
        let after = DeviceSnapshot::merged(Some(&before), "10.0.0.1".into(), &second, "T2");
        assert_eq!(after.status, FetchStatus::Rejected);
        assert_eq!(after.data.as_ref().and_then(|d| d.power), Some(3100.0));
        assert_eq!(after.last_updated, "T2");

        let third = BatchEntry { ip: Some("10.0.0.1".into()), status: FetchStatus::Fulfilled, data: None };
        let recovered = DeviceSnapshot::merged(Some(&after), "10.0.0.1".into(), &third, "T3");
        assert_eq!(recovered.error, None);
    }

    #[test]
    fn test_snapshot_derived_readings() {
        let snap: DeviceSnapshot = serde_json::from_value(json!({
            "ip": "10.0.0.1",
            "status": "fulfilled",
            "data": {
                "summary": { "hashrate": 90.0 },
                "temperature": { "device": 55.0, "boards": [71.0, 69.0] },
                "pool": { "worker": "acct.rig7" }
            },
            "lastUpdated": "T1"
        }))
        .unwrap();
        assert!(snap.is_online());
        assert_eq!(snap.hashrate(), Some(90.0));
        assert_eq!(snap.max_temperature(), Some(71.0));
        assert_eq!(snap.worker(), Some("acct.rig7"));
    }
}
