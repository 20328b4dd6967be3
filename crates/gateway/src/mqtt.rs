use async_trait::async_trait;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::error::DecodeError;
use crate::session::{SecureSession, SessionEventHandler, SessionRole};
use crate::state::{SensorReading, SensorWriter};

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Ingest payload as published by the field node. Absent fields read as 0.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct SensorPayload {
    #[serde(default)]
    pub(crate) volume_l: f64,
    #[serde(default)]
    pub(crate) soil_moisture_pct: f64,
}

/// Actuator command. Serialises to exactly `{"motor":true}` / `{"motor":false}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorCommand {
    pub motor: bool,
}

impl MotorCommand {
    pub fn to_payload(self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self)
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Millilitres on the wire, litres in the cache.
const ML_PER_LITRE: f64 = 1000.0;

/// UTF-8, then a JSON object, then range checks. The node reports volume in ml.
pub(crate) fn decode_sensor_payload(
    payload: &[u8],
    observed_at: OffsetDateTime,
) -> Result<SensorReading, DecodeError> {
    let text = std::str::from_utf8(payload)?;

    // Derived structs also accept a positional array; only key/value maps count.
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject {
            found: json_kind(&value),
        });
    }
    let msg = SensorPayload::deserialize(value)?;

    if !msg.volume_l.is_finite() || msg.volume_l < 0.0 {
        return Err(DecodeError::OutOfRange {
            field: "volume_l",
            value: msg.volume_l,
            expected: "a finite, non-negative number",
        });
    }
    if !msg.soil_moisture_pct.is_finite() {
        return Err(DecodeError::OutOfRange {
            field: "soil_moisture_pct",
            value: msg.soil_moisture_pct,
            expected: "a finite number",
        });
    }

    Ok(SensorReading {
        water_flow_liters: msg.volume_l / ML_PER_LITRE,
        soil_moisture_pct: msg.soil_moisture_pct,
        observed_at,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Session event handlers
// ---------------------------------------------------------------------------

/// Ingest side: subscribes on every connect and feeds the sensor cache.
/// Holds the cache's only writer.
pub struct IngestHandler {
    topic: String,
    writer: SensorWriter,
}

impl IngestHandler {
    pub fn new(topic: &str, writer: SensorWriter) -> Self {
        Self {
            topic: topic.to_string(),
            writer,
        }
    }
}

#[async_trait]
impl SessionEventHandler for IngestHandler {
    async fn on_connected(&self, session: &SecureSession) {
        // Clean sessions drop subscriptions, so subscribe on every connect.
        match session.subscribe(&self.topic, QoS::AtLeastOnce) {
            Ok(()) => info!(topic = %self.topic, "subscribed to sensor topic"),
            Err(e) => error!(topic = %self.topic, error = %e, "subscribe failed"),
        }
    }

    async fn on_disconnected(&self, role: SessionRole) {
        warn!(%role, "sensor stream interrupted");
    }

    async fn on_message(&self, topic: &str, payload: &[u8]) {
        if topic != self.topic {
            debug!(topic, "ignoring message on unexpected topic");
            return;
        }
        debug!(topic, payload = %String::from_utf8_lossy(payload), "sensor payload");

        match decode_sensor_payload(payload, OffsetDateTime::now_utc()) {
            Ok(reading) => {
                self.writer.update(reading).await;
                debug!(
                    water_flow_liters = reading.water_flow_liters,
                    soil_moisture_pct = reading.soil_moisture_pct,
                    "sensor cache updated"
                );
            }
            Err(e) => warn!(topic, error = %e, "dropping malformed sensor payload"),
        }
    }
}

/// Command side: publish-only, so it only reports link changes.
pub struct CommandHandler {
    topic: String,
}

impl CommandHandler {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
        }
    }
}

#[async_trait]
impl SessionEventHandler for CommandHandler {
    async fn on_connected(&self, session: &SecureSession) {
        info!(role = %session.role(), topic = %self.topic, "command channel ready");
    }

    async fn on_disconnected(&self, role: SessionRole) {
        warn!(%role, "command channel down; decisions will not be delivered");
    }

    async fn on_message(&self, topic: &str, _payload: &[u8]) {
        debug!(topic, "unexpected message on command session");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SensorCache;

    const TOPIC: &str = "irrigation/field-1/sensors";

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
    }

    // -- decode_sensor_payload ----------------------------------------------

    #[test]
    fn decode_scales_volume_to_liters() {
        let r = decode_sensor_payload(br#"{"volume_l":2500,"soil_moisture_pct":12.5}"#, now())
            .unwrap();
        assert_eq!(r.water_flow_liters, 2.5);
        assert_eq!(r.soil_moisture_pct, 12.5);
        assert_eq!(r.observed_at, now());
    }

    #[test]
    fn decode_missing_fields_default_to_zero() {
        let r = decode_sensor_payload(b"{}", now()).unwrap();
        assert_eq!(r.water_flow_liters, 0.0);
        assert_eq!(r.soil_moisture_pct, 0.0);

        let r = decode_sensor_payload(br#"{"soil_moisture_pct":30}"#, now()).unwrap();
        assert_eq!(r.water_flow_liters, 0.0);
        assert_eq!(r.soil_moisture_pct, 30.0);
    }

    #[test]
    fn decode_extra_fields_ignored() {
        let r = decode_sensor_payload(br#"{"volume_l":1000,"battery":3.7}"#, now()).unwrap();
        assert_eq!(r.water_flow_liters, 1.0);
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        assert!(matches!(
            decode_sensor_payload(&[0xff, 0xfe, 0x00], now()),
            Err(DecodeError::Utf8(_))
        ));
    }

    #[test]
    fn decode_rejects_non_json() {
        assert!(matches!(
            decode_sensor_payload(b"volume=12", now()),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn decode_rejects_positional_array() {
        match decode_sensor_payload(b"[5000, 40]", now()) {
            Err(DecodeError::NotAnObject { found }) => assert_eq!(found, "array"),
            other => panic!("expected NotAnObject, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_bare_scalars() {
        for payload in [&b"42"[..], b"null", br#""volume""#, b"true"] {
            assert!(
                matches!(
                    decode_sensor_payload(payload, now()),
                    Err(DecodeError::NotAnObject { .. })
                ),
                "{}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn out_of_range_message_names_the_field_constraint() {
        let err = decode_sensor_payload(br#"{"volume_l":-5}"#, now()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "volume_l must be a finite, non-negative number (got -5)"
        );
    }

    #[tokio::test]
    async fn positional_array_leaves_cache_unchanged() {
        let (writer, cache) = SensorCache::new();
        let handler = IngestHandler::new(TOPIC, writer);

        handler
            .on_message(TOPIC, br#"{"volume_l":500,"soil_moisture_pct":40}"#)
            .await;
        let before = cache.read().await;

        handler.on_message(TOPIC, b"[5000, 40]").await;
        assert_eq!(cache.read().await, before);
    }

    #[test]
    fn decode_rejects_wrongly_typed_field() {
        assert!(matches!(
            decode_sensor_payload(br#"{"volume_l":"lots"}"#, now()),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn decode_rejects_negative_flow() {
        assert!(matches!(
            decode_sensor_payload(br#"{"volume_l":-5}"#, now()),
            Err(DecodeError::OutOfRange { field: "volume_l", .. })
        ));
    }

    // -- MotorCommand -------------------------------------------------------

    #[test]
    fn motor_command_wire_format() {
        assert_eq!(
            MotorCommand { motor: true }.to_payload().unwrap(),
            br#"{"motor":true}"#
        );
        assert_eq!(
            MotorCommand { motor: false }.to_payload().unwrap(),
            br#"{"motor":false}"#
        );
    }

    // -- IngestHandler ------------------------------------------------------

    #[tokio::test]
    async fn ingest_updates_cache_on_valid_payload() {
        let (writer, cache) = SensorCache::new();
        let handler = IngestHandler::new(TOPIC, writer);

        handler
            .on_message(TOPIC, br#"{"volume_l":2000,"soil_moisture_pct":10}"#)
            .await;

        let r = cache.read().await.unwrap();
        assert_eq!(r.water_flow_liters, 2.0);
        assert_eq!(r.soil_moisture_pct, 10.0);
    }

    #[tokio::test]
    async fn malformed_payload_leaves_cache_unchanged_and_stream_continues() {
        let (writer, cache) = SensorCache::new();
        let handler = IngestHandler::new(TOPIC, writer);

        handler
            .on_message(TOPIC, br#"{"volume_l":500,"soil_moisture_pct":40}"#)
            .await;
        let before = cache.read().await;

        handler.on_message(TOPIC, b"\x00\x01 not json").await;
        assert_eq!(cache.read().await, before);

        handler
            .on_message(TOPIC, br#"{"volume_l":750,"soil_moisture_pct":41}"#)
            .await;
        let after = cache.read().await.unwrap();
        assert_eq!(after.water_flow_liters, 0.75);
        assert_eq!(after.soil_moisture_pct, 41.0);
    }

    #[tokio::test]
    async fn ingest_ignores_other_topics() {
        let (writer, cache) = SensorCache::new();
        let handler = IngestHandler::new(TOPIC, writer);

        handler
            .on_message("irrigation/field-2/sensors", br#"{"volume_l":1}"#)
            .await;
        assert_eq!(cache.read().await, None);
    }
}
