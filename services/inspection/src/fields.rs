//! Tolerant field access over PLC payloads.
//!
//! Every PLC tick arrives as a loosely-typed JSON object. Key names are not
//! stable across firmware revisions (some carry a leading space, some were
//! renamed), and booleans show up as native booleans, `"TRUE"`, `"1"` or `1`.
//! All probing of raw payloads goes through this module so call sites work on
//! [`ExtractedFields`] instead of ad hoc map lookups.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Payload keys written by the PLC gateway
pub mod keys {
    pub const CYCLE_NAME: &str = "NombreCiclo";
    pub const CYCLE_NAME_FALLBACKS: &[&str] = &["nombre_ciclo"];
    pub const EXECUTION_CENTER: &str = "ID_EC";
    pub const EXECUTION_CENTER_FALLBACKS: &[&str] = &["elemento_combustible"];
    pub const CONTROL_POINT: &str = "ID_Control";
    pub const CONTROL_POINT_FALLBACKS: &[&str] = &["ID", "id_puntero", "PunteroControl"];
    pub const ACTIVITY_FLAG: &str = "CicloActivo";
    pub const FAILURE_FLAG: &str = "Falla";
    pub const CAPTURE_DATE: &str = "FechaFoto";
    pub const CAPTURE_TIME: &str = "HoraFoto";
    pub const EMBEDDED_TIMESTAMPS: &[&str] = &["datetime", "timestamp"];
}

/// A decoded PLC payload
pub type Payload = Map<String, Value>;

/// Errors raised while turning a raw payload into [`ExtractedFields`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),

    #[error("payload is JSON but not an object")]
    NotAnObject,

    #[error("missing required field {0}")]
    MissingField(&'static str),
}

/// Normalized view over one payload. Recomputed on every access, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFields {
    pub cycle_name: String,
    pub execution_center_id: String,
    /// Empty when the tick does not point at a control point
    pub control_point_id: String,
    pub activity_flag: bool,
    pub failure_flag: bool,
    /// `FechaFoto` + `HoraFoto` when both are present and well-formed
    pub capture_request_time: Option<NaiveDateTime>,
    /// Timestamp embedded by the PLC gateway, normalized to UTC
    pub observed_at: Option<DateTime<Utc>>,
}

/// Decode a raw payload string into a JSON object.
pub fn decode(raw: &str) -> Result<Payload, ParseError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ParseError::NotAnObject),
        Err(e) => Err(ParseError::Malformed(e.to_string())),
    }
}

/// Extract a string field, trying `field_name`, its single-leading-space
/// variant, then each fallback in order.
///
/// The first present value wins unless it is null, blank, or one of
/// `false`/`none`/`null` (case-insensitive), in which case the next variant is
/// tried. A native `false` ends the search with `""`; a native `true` yields
/// `"true"`. Absence is a normal outcome and returns `""`.
pub fn extract(payload: &Payload, field_name: &str, fallback_names: &[&str]) -> String {
    let spaced = format!(" {field_name}");
    let variants = [field_name, spaced.as_str()]
        .into_iter()
        .chain(fallback_names.iter().copied());

    for variant in variants {
        let value = match payload.get(variant) {
            None | Some(Value::Null) => continue,
            Some(value) => value,
        };

        let text = match value {
            Value::Bool(false) => return String::new(),
            Value::Bool(true) => return "true".to_string(),
            Value::String(s) => s.trim().to_string(),
            other => other.to_string().trim().to_string(),
        };

        let lowered = text.to_lowercase();
        if !text.is_empty() && !matches!(lowered.as_str(), "false" | "none" | "null") {
            return text;
        }
    }

    String::new()
}

/// Boolean coercion gating cycle boundaries.
///
/// Native booleans pass through; strings match `true`/`1`/`yes`
/// case-insensitively (untrimmed); numbers are true only when equal to 1;
/// everything else is false.
pub fn is_true(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"),
        Value::Number(n) => n.as_f64() == Some(1.0),
        _ => false,
    }
}

/// Read a flag from `field_name` or its leading-space variant.
///
/// The first variant holding a non-empty value is coerced with [`is_true`];
/// a falsy first variant (`false`, `0`, `""`) defers to the next one.
pub fn flag(payload: &Payload, field_name: &str) -> bool {
    let spaced = format!(" {field_name}");
    [field_name, spaced.as_str()]
        .iter()
        .filter_map(|variant| payload.get(*variant))
        .find(|value| !is_falsy(value))
        .map(is_true)
        .unwrap_or(false)
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Extract the normalized fields from a decoded payload.
///
/// `offset` is the plant offset applied to naive embedded timestamps.
pub fn extract_fields(payload: &Payload, offset: FixedOffset) -> Result<ExtractedFields, ParseError> {
    let cycle_name = extract(payload, keys::CYCLE_NAME, keys::CYCLE_NAME_FALLBACKS);
    if cycle_name.is_empty() {
        return Err(ParseError::MissingField(keys::CYCLE_NAME));
    }

    let execution_center_id = extract(
        payload,
        keys::EXECUTION_CENTER,
        keys::EXECUTION_CENTER_FALLBACKS,
    );
    if execution_center_id.is_empty() {
        return Err(ParseError::MissingField(keys::EXECUTION_CENTER));
    }

    let capture_request_time = parse_capture_time(
        &extract(payload, keys::CAPTURE_DATE, &[]),
        &extract(payload, keys::CAPTURE_TIME, &[]),
    );

    let observed_at = keys::EMBEDDED_TIMESTAMPS
        .iter()
        .map(|key| extract(payload, key, &[]))
        .find(|s| !s.is_empty())
        .and_then(|s| parse_plc_timestamp(&s))
        .map(|ts| ts.normalize(offset));

    Ok(ExtractedFields {
        cycle_name,
        execution_center_id,
        control_point_id: extract(payload, keys::CONTROL_POINT, keys::CONTROL_POINT_FALLBACKS),
        activity_flag: flag(payload, keys::ACTIVITY_FLAG),
        failure_flag: flag(payload, keys::FAILURE_FLAG),
        capture_request_time,
        observed_at,
    })
}

/// Decode and extract in one step.
pub fn parse(raw: &str, offset: FixedOffset) -> Result<ExtractedFields, ParseError> {
    extract_fields(&decode(raw)?, offset)
}

/// A timestamp as written by the PLC gateway, with or without a UTC offset
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlcTimestamp {
    Naive(NaiveDateTime),
    Aware(DateTime<FixedOffset>),
}

impl PlcTimestamp {
    /// Collapse to UTC, reading naive values at the plant offset.
    pub fn normalize(self, offset: FixedOffset) -> DateTime<Utc> {
        match self {
            PlcTimestamp::Aware(ts) => ts.with_timezone(&Utc),
            PlcTimestamp::Naive(naive) => match offset.from_local_datetime(&naive).single() {
                Some(local) => local.with_timezone(&Utc),
                None => Utc.from_utc_datetime(&naive),
            },
        }
    }
}

impl From<DateTime<Utc>> for PlcTimestamp {
    fn from(ts: DateTime<Utc>) -> Self {
        PlcTimestamp::Aware(ts.fixed_offset())
    }
}

impl From<NaiveDateTime> for PlcTimestamp {
    fn from(ts: NaiveDateTime) -> Self {
        PlcTimestamp::Naive(ts)
    }
}

/// Parse RFC 3339 or the naive `YYYY-MM-DD[ T]HH:MM:SS[.f]` forms; a trailing
/// `Z` is accepted on the naive forms.
pub fn parse_plc_timestamp(text: &str) -> Option<PlcTimestamp> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(PlcTimestamp::Aware(ts));
    }

    let (body, utc) = match text.strip_suffix('Z') {
        Some(body) => (body, true),
        None => (text, false),
    };
    let naive = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(body, fmt).ok())?;

    if utc {
        Some(PlcTimestamp::Aware(Utc.from_utc_datetime(&naive).fixed_offset()))
    } else {
        Some(PlcTimestamp::Naive(naive))
    }
}

/// Parse a `DDMMYY` date; years are 20YY.
pub fn parse_ddmmyy(text: &str) -> Option<NaiveDate> {
    if text.len() != 6 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let day = text[0..2].parse().ok()?;
    let month = text[2..4].parse().ok()?;
    let year: i32 = text[4..6].parse().ok()?;
    NaiveDate::from_ymd_opt(2000 + year, month, day)
}

/// Parse a `DDMMYY` date plus an `HHMMSS` time.
pub fn parse_capture_time(date: &str, time: &str) -> Option<NaiveDateTime> {
    if time.len() != 6 || !time.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let date = parse_ddmmyy(date)?;
    date.and_hms_opt(
        time[0..2].parse().ok()?,
        time[2..4].parse().ok()?,
        time[4..6].parse().ok()?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("test payload must be an object"),
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn test_extract_prefers_exact_then_spaced_then_fallback() {
        let p = payload(json!({" NombreCiclo": "CNA2", "nombre_ciclo": "OLD"}));
        assert_eq!(extract(&p, "NombreCiclo", &["nombre_ciclo"]), "CNA2");

        let p = payload(json!({"nombre_ciclo": "  OLD  "}));
        assert_eq!(extract(&p, "NombreCiclo", &["nombre_ciclo"]), "OLD");
    }

    #[test]
    fn test_extract_skips_placeholder_values() {
        let p = payload(json!({"ID_EC": "None", " ID_EC": "  ", "elemento_combustible": "E3742"}));
        assert_eq!(extract(&p, "ID_EC", &["elemento_combustible"]), "E3742");

        let p = payload(json!({"ID_EC": null, " ID_EC": "null"}));
        assert_eq!(extract(&p, "ID_EC", &[]), "");
    }

    #[test]
    fn test_extract_native_booleans_and_numbers() {
        let p = payload(json!({"ID_Control": false, "ID": "1F"}));
        assert_eq!(extract(&p, "ID_Control", &["ID"]), "");

        let p = payload(json!({"ID_Control": true}));
        assert_eq!(extract(&p, "ID_Control", &[]), "true");

        let p = payload(json!({"ID_Control": 7}));
        assert_eq!(extract(&p, "ID_Control", &[]), "7");
    }

    #[test]
    fn test_is_true_coercion() {
        assert!(is_true(&json!(true)));
        assert!(!is_true(&json!(false)));
        assert!(is_true(&json!("TRUE")));
        assert!(is_true(&json!("Yes")));
        assert!(is_true(&json!("1")));
        assert!(!is_true(&json!(" true")));
        assert!(!is_true(&json!("on")));
        assert!(is_true(&json!(1)));
        assert!(is_true(&json!(1.0)));
        assert!(!is_true(&json!(2)));
        assert!(!is_true(&json!(0)));
        assert!(!is_true(&json!(null)));
        assert!(!is_true(&json!([1])));
    }

    #[test]
    fn test_flag_defers_falsy_first_variant() {
        let p = payload(json!({"CicloActivo": false, " CicloActivo": "true"}));
        assert!(flag(&p, "CicloActivo"));

        let p = payload(json!({"CicloActivo": "false", " CicloActivo": true}));
        assert!(!flag(&p, "CicloActivo"));

        let p = payload(json!({}));
        assert!(!flag(&p, "CicloActivo"));
    }

    #[test]
    fn test_extract_fields_requires_key() {
        let p = payload(json!({"NombreCiclo": "CNA2", "CicloActivo": true}));
        assert_eq!(
            extract_fields(&p, utc()),
            Err(ParseError::MissingField(keys::EXECUTION_CENTER))
        );
    }

    #[test]
    fn test_extract_fields_full_payload() {
        let p = payload(json!({
            " NombreCiclo": "CNA2",
            "ID_EC": "E3742",
            "ID_Control": "1F",
            " CicloActivo": "TRUE",
            "Falla": "0",
            "FechaFoto": "231225",
            "HoraFoto": "134953",
            "datetime": "2025-12-23T13:49:53Z"
        }));
        let fields = extract_fields(&p, utc()).unwrap();
        assert_eq!(fields.cycle_name, "CNA2");
        assert_eq!(fields.execution_center_id, "E3742");
        assert_eq!(fields.control_point_id, "1F");
        assert!(fields.activity_flag);
        assert!(!fields.failure_flag);
        assert_eq!(
            fields.capture_request_time,
            NaiveDate::from_ymd_opt(2025, 12, 23).unwrap().and_hms_opt(13, 49, 53)
        );
        assert_eq!(
            fields.observed_at,
            Some(Utc.with_ymd_and_hms(2025, 12, 23, 13, 49, 53).unwrap())
        );
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert_eq!(decode("[1, 2]"), Err(ParseError::NotAnObject));
        assert!(matches!(decode("{not json"), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_naive_timestamps_use_plant_offset() {
        let offset = FixedOffset::west_opt(3 * 3600).unwrap();
        let naive = parse_plc_timestamp("2025-12-23 10:00:00").unwrap();
        assert!(matches!(naive, PlcTimestamp::Naive(_)));
        assert_eq!(
            naive.normalize(offset),
            Utc.with_ymd_and_hms(2025, 12, 23, 13, 0, 0).unwrap()
        );

        let aware = parse_plc_timestamp("2025-12-23T10:00:00-03:00").unwrap();
        assert_eq!(aware.normalize(utc()), naive.normalize(offset));
    }

    #[test]
    fn test_parse_capture_time_rejects_bad_dates() {
        assert!(parse_capture_time("321225", "134953").is_none());
        assert!(parse_capture_time("231225", "1349").is_none());
        assert!(parse_ddmmyy("23122a").is_none());
    }
}
