//! Message normalization.
//!
//! Turns raw bus payloads into a [`NormalizedMessage`] for the configured
//! [`ReadingShape`]. Only structural problems (invalid JSON, a non-object
//! payload) reject a message. Individual fields that are missing or fail
//! numeric coercion are treated as absent.

use serde_json::{Map, Value};

use crate::error::{ParseError, ParseResult};
use crate::types::{
    DeviceUpsert, NarrowReading, NormalizedMessage, ReadingSet, ReadingShape, UNKNOWN_DEVICE_ID,
    WideReading,
};

/// Normalizer bound to one reading shape.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    shape: ReadingShape,
}

impl Normalizer {
    /// Create a normalizer for the given shape.
    pub fn new(shape: ReadingShape) -> Self {
        Self { shape }
    }

    /// The shape this normalizer produces.
    pub fn shape(&self) -> ReadingShape {
        self.shape
    }

    /// Normalize a raw payload.
    pub fn normalize(&self, payload: &[u8]) -> ParseResult<NormalizedMessage> {
        normalize(payload, self.shape)
    }
}

/// Normalize a raw payload into the given shape.
///
/// # Examples
///
/// ```
/// use fieldnode_types::{normalize, ReadingSet, ReadingShape};
///
/// let msg = normalize(br#"{"device_id":"d1","air_temp":21.5}"#, ReadingShape::Wide)?;
/// assert_eq!(msg.device.device_id, "d1");
/// match msg.readings {
///     ReadingSet::Wide(w) => assert_eq!(w.air_temp, Some(21.5)),
///     ReadingSet::Narrow(_) => unreachable!(),
/// }
/// # Ok::<(), fieldnode_types::ParseError>(())
/// ```
pub fn normalize(payload: &[u8], shape: ReadingShape) -> ParseResult<NormalizedMessage> {
    let value: Value = serde_json::from_slice(payload)?;
    let obj = match value {
        Value::Object(obj) => obj,
        other => return Err(ParseError::NotAnObject(json_kind(&other))),
    };

    let readings = match shape {
        ReadingShape::Wide => ReadingSet::Wide(wide_reading(&obj)),
        ReadingShape::Narrow => ReadingSet::Narrow(narrow_readings(&obj)),
    };

    Ok(NormalizedMessage {
        device: device_upsert(&obj),
        readings,
    })
}

fn device_upsert(obj: &Map<String, Value>) -> DeviceUpsert {
    let device_id = obj
        .get("device_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_DEVICE_ID);

    DeviceUpsert {
        device_id: device_id.to_string(),
        device_name: string_field(obj, "device_name"),
        location: string_field(obj, "location"),
        sensor_config: obj.get("sensors").filter(|v| !v.is_null()).cloned(),
    }
}

fn wide_reading(obj: &Map<String, Value>) -> WideReading {
    let num = |key: &str| obj.get(key).and_then(coerce_f64);

    WideReading {
        air_temp: num("air_temp"),
        humidity: num("humidity"),
        soil_temp_10cm: num("soil_temp_10cm"),
        soil_temp_30cm: num("soil_temp_30cm"),
        ph: num("ph"),
        air_quality: num("air_quality").map(|v| v.trunc() as i64),
        water_temp: num("water_temp"),
        water_ph: num("water_ph"),
        water_turbidity: num("water_turbidity"),
        water_tds: num("water_tds"),
    }
}

fn narrow_readings(obj: &Map<String, Value>) -> Vec<NarrowReading> {
    let Some(Value::Object(entries)) = obj.get("readings") else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|(sensor_type, entry)| {
            let (value, units) = match entry {
                Value::Object(fields) => (
                    fields.get("value").and_then(coerce_f64)?,
                    string_field(fields, "units"),
                ),
                bare => (coerce_f64(bare)?, None),
            };
            Some(NarrowReading {
                sensor_type: sensor_type.clone(),
                value,
                units,
            })
        })
        .collect()
}

/// Coerce a JSON value to a finite `f64`.
///
/// Numbers and numeric strings are accepted; anything else is absent.
fn coerce_f64(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide(payload: &str) -> (DeviceUpsert, WideReading) {
        let msg = normalize(payload.as_bytes(), ReadingShape::Wide).unwrap();
        match msg.readings {
            ReadingSet::Wide(w) => (msg.device, w),
            ReadingSet::Narrow(_) => panic!("expected wide readings"),
        }
    }

    fn narrow(payload: &str) -> (DeviceUpsert, Vec<NarrowReading>) {
        let msg = normalize(payload.as_bytes(), ReadingShape::Narrow).unwrap();
        match msg.readings {
            ReadingSet::Narrow(n) => (msg.device, n),
            ReadingSet::Wide(_) => panic!("expected narrow readings"),
        }
    }

    // ==================== Wide shape ====================

    #[test]
    fn test_wide_full_message() {
        let (device, reading) = wide(
            r#"{"device_id":"d1","air_temp":21.5,"humidity":55,"soil_temp_10cm":14.2,
                "soil_temp_30cm":12.9,"ph":6.8,"air_quality":42}"#,
        );
        assert_eq!(device.device_id, "d1");
        assert_eq!(reading.air_temp, Some(21.5));
        assert_eq!(reading.humidity, Some(55.0));
        assert_eq!(reading.soil_temp_10cm, Some(14.2));
        assert_eq!(reading.soil_temp_30cm, Some(12.9));
        assert_eq!(reading.ph, Some(6.8));
        assert_eq!(reading.air_quality, Some(42));
        assert_eq!(reading.water_temp, None);
    }

    #[test]
    fn test_wide_missing_columns_are_absent() {
        let (_, reading) = wide(r#"{"device_id":"d1","air_temp":20}"#);
        assert_eq!(reading.air_temp, Some(20.0));
        assert_eq!(reading.humidity, None);
        assert_eq!(reading.ph, None);
        assert_eq!(reading.air_quality, None);
    }

    #[test]
    fn test_wide_water_extension() {
        let (_, reading) = wide(
            r#"{"device_id":"pond","water_temp":17.1,"water_ph":7.4,
                "water_turbidity":3.2,"water_tds":120}"#,
        );
        assert_eq!(reading.water_temp, Some(17.1));
        assert_eq!(reading.water_ph, Some(7.4));
        assert_eq!(reading.water_turbidity, Some(3.2));
        assert_eq!(reading.water_tds, Some(120.0));
    }

    #[test]
    fn test_wide_uncoercible_field_is_absent_not_fatal() {
        let (_, reading) = wide(r#"{"device_id":"d1","air_temp":"warm","humidity":48.5}"#);
        assert_eq!(reading.air_temp, None);
        assert_eq!(reading.humidity, Some(48.5));
    }

    #[test]
    fn test_wide_numeric_string_is_coerced() {
        let (_, reading) = wide(r#"{"device_id":"d1","air_temp":" 21.5 "}"#);
        assert_eq!(reading.air_temp, Some(21.5));
    }

    #[test]
    fn test_wide_air_quality_truncates() {
        let (_, reading) = wide(r#"{"air_quality":41.9}"#);
        assert_eq!(reading.air_quality, Some(41));
    }

    #[test]
    fn test_wide_null_and_bool_are_absent() {
        let (_, reading) = wide(r#"{"air_temp":null,"humidity":true}"#);
        assert!(reading.is_empty());
    }

    // ==================== Narrow shape ====================

    #[test]
    fn test_narrow_expands_one_row_per_entry() {
        let (device, readings) = narrow(
            r#"{"device_id":"d2","sensors":{"temp":"DS18B20"},
                "readings":{"temp":{"value":20,"units":"C"},"humidity":{"value":50}}}"#,
        );
        assert_eq!(device.device_id, "d2");
        assert_eq!(readings.len(), 2);

        let humidity = readings.iter().find(|r| r.sensor_type == "humidity").unwrap();
        assert_eq!(humidity.value, 50.0);
        assert_eq!(humidity.units, None);

        let temp = readings.iter().find(|r| r.sensor_type == "temp").unwrap();
        assert_eq!(temp.value, 20.0);
        assert_eq!(temp.units.as_deref(), Some("C"));
    }

    #[test]
    fn test_narrow_sensor_config_is_kept_opaque() {
        let (device, _) = narrow(r#"{"device_id":"d2","sensors":{"temp":{"pin":4}},"readings":{}}"#);
        assert_eq!(
            device.sensor_config,
            Some(serde_json::json!({"temp": {"pin": 4}}))
        );
    }

    #[test]
    fn test_narrow_missing_readings_yields_zero_rows() {
        let (_, readings) = narrow(r#"{"device_id":"d2"}"#);
        assert!(readings.is_empty());

        let (_, readings) = narrow(r#"{"device_id":"d2","readings":[1,2]}"#);
        assert!(readings.is_empty());
    }

    #[test]
    fn test_narrow_skips_entries_without_numeric_value() {
        let (_, readings) = narrow(
            r#"{"readings":{"temp":{"value":"n/a"},"ph":{"units":"pH"},"co2":{"value":"415"}}}"#,
        );
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].sensor_type, "co2");
        assert_eq!(readings[0].value, 415.0);
    }

    #[test]
    fn test_narrow_accepts_bare_numbers() {
        let (_, readings) = narrow(r#"{"readings":{"temp":19.5}}"#);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 19.5);
    }

    // ==================== Device fields ====================

    #[test]
    fn test_missing_device_id_defaults_to_unknown() {
        let (device, _) = wide(r#"{"air_temp":20}"#);
        assert_eq!(device.device_id, UNKNOWN_DEVICE_ID);
        assert!(device.is_anonymous());
    }

    #[test]
    fn test_non_string_or_blank_device_id_defaults_to_unknown() {
        let (device, _) = wide(r#"{"device_id":17}"#);
        assert_eq!(device.device_id, UNKNOWN_DEVICE_ID);

        let (device, _) = wide(r#"{"device_id":"  "}"#);
        assert_eq!(device.device_id, UNKNOWN_DEVICE_ID);
    }

    #[test]
    fn test_device_name_and_location() {
        let (device, _) = wide(r#"{"device_id":"d1","device_name":"North bed","location":"plot 4"}"#);
        assert_eq!(device.device_name.as_deref(), Some("North bed"));
        assert_eq!(device.location.as_deref(), Some("plot 4"));
        assert_eq!(device.sensor_config, None);
    }

    // ==================== Rejections ====================

    #[test]
    fn test_invalid_json_is_rejected() {
        let err = normalize(b"not json at all", ReadingShape::Wide).unwrap_err();
        assert!(matches!(err, ParseError::InvalidJson(_)));
    }

    #[test]
    fn test_non_object_is_rejected() {
        let err = normalize(b"[1,2,3]", ReadingShape::Narrow).unwrap_err();
        assert!(matches!(err, ParseError::NotAnObject("an array")));
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        assert!(normalize(&[0xff, 0xfe, 0x7b], ReadingShape::Wide).is_err());
    }

    #[test]
    fn test_normalizer_uses_configured_shape() {
        let normalizer = Normalizer::new(ReadingShape::Narrow);
        assert_eq!(normalizer.shape(), ReadingShape::Narrow);

        // A wide-looking payload still normalizes as narrow: no sniffing.
        let msg = normalizer
            .normalize(br#"{"device_id":"d1","air_temp":21.5}"#)
            .unwrap();
        assert_eq!(msg.readings, ReadingSet::Narrow(Vec::new()));
    }
}
