use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One decoded sensor reading, exactly as it arrived on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    #[serde(rename = "sensorType")]
    pub domain: String,
    pub sensor_id: String,
    pub location: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReading {
    #[serde(alias = "sensorType")]
    domain: String,
    sensor_id: String,
    #[serde(default)]
    location: String,
    value: f64,
    timestamp: String,
}

/// Decodes a bus payload. The buffer is used as scratch space by the JSON parser.
pub fn decode(payload: &mut [u8]) -> Result<SensorReading, DecodeError> {
    let wire: WireReading = simd_json::serde::from_slice(payload)?;

    let timestamp = DateTime::parse_from_rfc3339(wire.timestamp.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| DecodeError::Timestamp {
            raw: wire.timestamp.clone(),
            source,
        })?;

    Ok(SensorReading {
        domain: wire.domain,
        sensor_id: wire.sensor_id,
        location: wire.location,
        value: wire.value,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn decode_accepts_sensor_type_alias() {
        let mut payload = br#"{
            "sensorId":"temp_001",
            "sensorType":"temperature",
            "location":"Living Room",
            "value":21.37,
            "unit":"C",
            "timestamp":"2026-01-11T08:30:00.250000Z"
        }"#
        .to_vec();
        let reading = decode(&mut payload).expect("decoded");
        assert_eq!(reading.domain, "temperature");
        assert_eq!(reading.sensor_id, "temp_001");
        assert_eq!(reading.location, "Living Room");
        assert_eq!(reading.value, 21.37);
        assert_eq!(
            reading.timestamp,
            Utc.with_ymd_and_hms(2026, 1, 11, 8, 30, 0).unwrap()
                + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn decode_accepts_domain_field_and_integer_value() {
        let mut payload =
            br#"{"domain":"humidity","sensorId":"hum_002","location":"Kitchen","value":55,"timestamp":"2026-01-11T08:30:00+02:00"}"#
                .to_vec();
        let reading = decode(&mut payload).expect("decoded");
        assert_eq!(reading.domain, "humidity");
        assert_eq!(reading.value, 55.0);
        assert_eq!(
            reading.timestamp,
            Utc.with_ymd_and_hms(2026, 1, 11, 6, 30, 0).unwrap()
        );
    }

    #[test]
    fn decode_defaults_missing_location() {
        let mut payload =
            br#"{"sensorType":"electricity","sensorId":"elec_001","value":1.5,"timestamp":"2026-01-11T08:30:00Z"}"#
                .to_vec();
        let reading = decode(&mut payload).expect("decoded");
        assert_eq!(reading.location, "");
    }

    #[test]
    fn decode_rejects_missing_value() {
        let mut payload =
            br#"{"sensorType":"temperature","sensorId":"s1","location":"room1","timestamp":"2026-01-11T08:30:00Z"}"#
                .to_vec();
        assert!(matches!(decode(&mut payload), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_missing_timestamp() {
        let mut payload =
            br#"{"sensorType":"temperature","sensorId":"s1","location":"room1","value":1.0}"#.to_vec();
        assert!(matches!(decode(&mut payload), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_malformed_timestamp() {
        let mut payload =
            br#"{"sensorType":"temperature","sensorId":"s1","location":"room1","value":1.0,"timestamp":"yesterday"}"#
                .to_vec();
        match decode(&mut payload) {
            Err(DecodeError::Timestamp { raw, .. }) => assert_eq!(raw, "yesterday"),
            other => panic!("expected timestamp error, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_non_json() {
        let mut payload = b"temperature=21.5".to_vec();
        assert!(decode(&mut payload).is_err());
        let mut empty = Vec::new();
        assert!(decode(&mut empty).is_err());
    }

    #[test]
    fn reading_serializes_in_bus_contract() {
        let reading = SensorReading {
            domain: "temperature".to_string(),
            sensor_id: "s1".to_string(),
            location: "room1".to_string(),
            value: 35.0,
            timestamp: Utc.with_ymd_and_hms(2026, 1, 11, 8, 30, 0).unwrap(),
        };
        let mut encoded = serde_json::to_vec(&reading).unwrap();
        let decoded = decode(&mut encoded).expect("decoded");
        assert_eq!(decoded, reading);
    }
}
