use serde_json::{Map, Value};
use tracing::debug;

use crate::types::*;
use crate::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.myuplink.com/v2";

pub fn points_path(device_id: &str) -> String {
    format!("/devices/{device_id}/points")
}

pub fn device_path(device_id: &str) -> String {
    format!("/devices/{device_id}")
}

pub const SYSTEMS_PATH: &str = "/systems/me";

pub fn parameters_query(ids: &[ParameterId]) -> String {
    ids.iter()
        .map(ParameterId::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// PATCH body: `{"<id>": value}`. Integral values go out as JSON integers.
pub fn write_body(values: &PointValues) -> Value {
    let map: Map<String, Value> = values
        .iter()
        .map(|(id, v)| (id.to_string(), number_value(*v)))
        .collect();
    Value::Object(map)
}

fn number_value(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Value::from(v as i64)
    } else {
        Value::from(v)
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_point(entry: &Value) -> Option<DevicePoint> {
    let id = entry
        .get("parameterId")
        .and_then(as_number)
        .filter(|n| *n >= 0.0 && n.fract() == 0.0)
        .map(|n| ParameterId(n as u32))?;
    let value = entry.get("value").and_then(as_number)?;
    let writable = entry.get("writable").and_then(|v| v.as_bool()).unwrap_or(false);
    let display_value = entry
        .get("strVal")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let enum_values = match entry.get("enumValues") {
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(|e| {
                Some(EnumValue {
                    value: e.get("value").and_then(as_text)?,
                    text: e.get("text").and_then(as_text).unwrap_or_default(),
                })
            })
            .collect(),
        _ => Vec::new(),
    };
    Some(DevicePoint {
        id,
        value,
        writable,
        display_value,
        enum_values,
    })
}

pub fn parse_points_response(body: &str) -> Result<Vec<DevicePoint>> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| Error::Protocol(format!("points response is not JSON: {e}")))?;
    let Value::Array(entries) = parsed else {
        return Err(Error::Protocol(format!(
            "expected an array of points, got: {}",
            truncate(body, 300)
        )));
    };
    Ok(entries
        .iter()
        .filter_map(|entry| {
            let point = parse_point(entry);
            if point.is_none() {
                debug!(entry = %entry, "skipping malformed point");
            }
            point
        })
        .collect())
}

pub fn parse_firmware_version(body: &str) -> Result<String> {
    let parsed: Value = serde_json::from_str(body)?;
    parsed
        .pointer("/firmware/currentFwVersion")
        .and_then(as_text)
        .ok_or_else(|| Error::Protocol("device info has no firmware version".to_string()))
}

pub fn parse_systems_response(body: &str) -> Result<Vec<PairedDevice>> {
    let parsed: Value = serde_json::from_str(body)?;
    let systems = match parsed.get("systems") {
        Some(Value::Array(systems)) => systems,
        _ => return Err(Error::Protocol("no systems in account listing".to_string())),
    };
    let mut devices = Vec::new();
    for system in systems {
        let system_id = system.get("systemId").and_then(as_text).unwrap_or_default();
        let system_name = system.get("name").and_then(as_text).unwrap_or_default();
        let Some(Value::Array(entries)) = system.get("devices") else {
            continue;
        };
        for device in entries {
            let Some(device_id) = device.get("id").and_then(as_text) else {
                continue;
            };
            devices.push(PairedDevice {
                system_id: system_id.clone(),
                system_name: system_name.clone(),
                device_id,
                serial_number: device
                    .pointer("/product/serialNumber")
                    .and_then(as_text)
                    .unwrap_or_default(),
                product_name: device
                    .pointer("/product/name")
                    .and_then(as_text)
                    .unwrap_or_default(),
            });
        }
    }
    Ok(devices)
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_joins_ids() {
        let ids = [ParameterId(302), ParameterId(517), ParameterId(528)];
        assert_eq!(parameters_query(&ids), "302,517,528");
        assert_eq!(points_path("hoiax-123"), "/devices/hoiax-123/points");
    }

    #[test]
    fn write_body_uses_integers_when_possible() {
        let mut values = PointValues::new();
        values.insert(ParameterId(517), 3.0);
        values.insert(ParameterId(516), 2.5);
        assert_eq!(write_body(&values), json!({"516": 2.5, "517": 3}));
    }

    #[test]
    fn parses_points_with_string_ids() {
        let body = r#"[
            {"parameterId": "517", "value": 3, "writable": true, "strVal": "3"},
            {"parameterId": 528, "value": 61.4, "writable": false},
            {"parameterId": "500", "value": 8, "writable": true, "strVal": "External",
             "enumValues": [{"value": "8", "text": "External"}, {"value": 9, "text": "Price"}]}
        ]"#;
        let points = parse_points_response(body).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].id, ParameterId(517));
        assert!(points[0].writable);
        assert_eq!(points[1].value, 61.4);
        assert_eq!(points[1].display_value, None);
        assert_eq!(points[2].display_value.as_deref(), Some("External"));
        assert!(points[2].supports_enum_value(9));
    }

    #[test]
    fn skips_malformed_points() {
        let body = r#"[{"parameterId": "517"}, {"value": 3}, {"parameterId": "302", "value": 4.2}]"#;
        let points = parse_points_response(body).unwrap();
        assert_eq!(points, vec![DevicePoint::new(ParameterId(302), 4.2)]);
    }

    #[test]
    fn non_array_is_protocol_error() {
        let err = parse_points_response(r#"{"message": "unauthorized"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(matches!(parse_points_response(""), Err(Error::Protocol(_))));
    }

    #[test]
    fn firmware_version_from_device_info() {
        let body = r#"{"id": "x", "firmware": {"currentFwVersion": "1.2.7", "desiredFwVersion": "1.2.7"}}"#;
        assert_eq!(parse_firmware_version(body).unwrap(), "1.2.7");
        assert!(parse_firmware_version(r#"{"id": "x"}"#).is_err());
    }

    #[test]
    fn systems_are_flattened() {
        let body = json!({
            "page": 1, "itemsPerPage": 10, "numItems": 1,
            "systems": [{
                "systemId": "sys-1",
                "name": "Home",
                "devices": [
                    {"id": "dev-1", "product": {"serialNumber": "S1", "name": "Connected 200"}},
                    {"id": "dev-2", "product": {"serialNumber": "S2", "name": "Connected 300"}}
                ]
            }]
        })
        .to_string();
        let devices = parse_systems_response(&body).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].device_id, "dev-2");
        assert_eq!(devices[1].system_name, "Home");
        assert_eq!(devices[0].product_name, "Connected 200");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("Høiax", 2), "Hø");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
