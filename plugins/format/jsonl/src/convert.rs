use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Number, Value as Json};

use tabflow_api::value::{format_decimal, parse_decimal};
use tabflow_api::{DataError, DataType, Value};

/// Parse one line into a JSON object.
pub(crate) fn parse_record(line: &str) -> Result<Map<String, Json>, DataError> {
    match serde_json::from_str::<Json>(line)? {
        Json::Object(map) => Ok(map),
        other => Err(DataError::format(format!("expected a JSON object, got {other}"))),
    }
}

/// Column type of a JSON value; `None` for `null`. Nested objects are kept
/// as their JSON text.
pub(crate) fn infer_type(json: &Json) -> Option<DataType> {
    match json {
        Json::Null => None,
        Json::Bool(_) => Some(DataType::Boolean),
        Json::Number(n) if n.is_i64() => Some(DataType::Long),
        Json::Number(_) => Some(DataType::Double),
        Json::String(_) | Json::Object(_) => Some(DataType::String),
        Json::Array(items) => {
            let element = items
                .iter()
                .filter_map(infer_type)
                .reduce(|a, b| a.widen(&b))
                .unwrap_or(DataType::String);
            Some(DataType::array(element))
        }
    }
}

fn mismatch(data_type: &DataType, json: &Json) -> String {
    format!("expected {data_type}, got {json}")
}

fn integer(data_type: &DataType, json: &Json) -> Result<i64, String> {
    match json {
        Json::Number(n) => n.as_i64().ok_or_else(|| mismatch(data_type, json)),
        _ => Err(mismatch(data_type, json)),
    }
}

fn float(data_type: &DataType, json: &Json) -> Result<f64, String> {
    match json {
        Json::Number(n) => n.as_f64().ok_or_else(|| mismatch(data_type, json)),
        _ => Err(mismatch(data_type, json)),
    }
}

/// Convert a JSON value to the column type. Untyped columns take the type
/// of the value itself.
pub(crate) fn to_value(json: &Json, data_type: Option<&DataType>) -> Result<Value, String> {
    if json.is_null() {
        return Ok(Value::Null);
    }
    let Some(dt) = data_type else {
        return match infer_type(json) {
            Some(inferred) => to_value(json, Some(&inferred)),
            None => Ok(Value::Null),
        };
    };

    let out_of_range = || format!("{json} is out of range for {dt}");
    match dt {
        DataType::Boolean => json.as_bool().map(Value::Boolean).ok_or_else(|| mismatch(dt, json)),
        DataType::Short => i16::try_from(integer(dt, json)?).map(Value::Short).map_err(|_| out_of_range()),
        DataType::Int => i32::try_from(integer(dt, json)?).map(Value::Int).map_err(|_| out_of_range()),
        DataType::Long => integer(dt, json).map(Value::Long),
        DataType::BigInt => match json {
            Json::Number(n) => n
                .as_i64()
                .map(i128::from)
                .or_else(|| n.as_u64().map(i128::from))
                .map(Value::BigInt)
                .ok_or_else(|| mismatch(dt, json)),
            Json::String(s) => s.parse().map(Value::BigInt).map_err(|_| mismatch(dt, json)),
            _ => Err(mismatch(dt, json)),
        },
        DataType::Float => float(dt, json).map(|v| Value::Float(v as f32)),
        DataType::Double => float(dt, json).map(Value::Double),
        DataType::Decimal { scale, .. } => {
            let text = match json {
                Json::Number(n) => n.to_string(),
                Json::String(s) => s.clone(),
                _ => return Err(mismatch(dt, json)),
            };
            let (unscaled, parsed_scale) = parse_decimal(&text).ok_or_else(|| mismatch(dt, json))?;
            rescale(unscaled, parsed_scale, *scale)
                .map(|u| Value::Decimal(u, *scale))
                .ok_or_else(out_of_range)
        }
        DataType::String | DataType::Char(_) | DataType::Varchar(_) => match json {
            Json::String(s) => Ok(Value::String(s.clone())),
            other => Ok(Value::String(other.to_string())),
        },
        DataType::Bytes | DataType::Binary => match json {
            Json::String(s) => STANDARD
                .decode(s)
                .map(Value::Bytes)
                .map_err(|e| format!("invalid base64: {e}")),
            _ => Err(mismatch(dt, json)),
        },
        DataType::Date => match json {
            Json::String(s) => parse_date(s).map(Value::Date).ok_or_else(|| mismatch(dt, json)),
            _ => i32::try_from(integer(dt, json)?).map(Value::Date).map_err(|_| out_of_range()),
        },
        DataType::Timestamp => integer(dt, json).map(Value::Timestamp),
        DataType::Array(element) => match json {
            Json::Array(items) => items
                .iter()
                .map(|item| to_value(item, Some(element)))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            _ => Err(mismatch(dt, json)),
        },
    }
}

fn rescale(unscaled: i128, from: u8, to: u8) -> Option<i128> {
    if from > to {
        return None;
    }
    10i128.checked_pow(u32::from(to - from))?.checked_mul(unscaled)
}

pub(crate) fn to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Short(v) => Json::from(*v),
        Value::Int(v) => Json::from(*v),
        Value::Long(v) => Json::from(*v),
        Value::BigInt(v) => match i64::try_from(*v) {
            Ok(small) => Json::from(small),
            Err(_) => Json::String(v.to_string()),
        },
        Value::Float(v) => Number::from_f64(f64::from(*v)).map_or(Json::Null, Json::Number),
        Value::Double(v) => Number::from_f64(*v).map_or(Json::Null, Json::Number),
        Value::Decimal(unscaled, scale) => Json::String(format_decimal(*unscaled, *scale)),
        Value::String(s) => Json::String(s.clone()),
        Value::Bytes(b) => Json::String(STANDARD.encode(b)),
        Value::Date(days) => Json::String(format_date(*days)),
        Value::Timestamp(micros) => Json::from(*micros),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect()),
    }
}

// ── Calendar ──

/// Days since 1970-01-01 of a proleptic Gregorian date.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year.div_euclid(400);
    let yoe = year - era * 400;
    let mp = (i64::from(month) + 9) % 12;
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// `YYYY-MM-DD` to days since epoch. Rejects impossible dates.
pub(crate) fn parse_date(text: &str) -> Option<i32> {
    let mut parts = text.splitn(3, '-');
    let year: i64 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let days = days_from_civil(year, month, day);
    if civil_from_days(days) != (year, month, day) {
        return None;
    }
    i32::try_from(days).ok()
}

pub(crate) fn format_date(days: i32) -> String {
    let (year, month, day) = civil_from_days(i64::from(days));
    format!("{year:04}-{month:02}-{day:02}")
}
