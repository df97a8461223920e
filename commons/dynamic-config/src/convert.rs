use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("value type is not {0}")]
    WrongType(&'static str),

    #[error("value out of range for {0}")]
    OutOfRange(&'static str),

    #[error("failed to parse duration: {0}")]
    Duration(String),

    #[error("structure conversion failed: {0}")]
    Structure(#[from] serde_json::Error),
}

/// Conversion from a raw configured value.
pub trait FromConfigValue: Sized {
    fn from_config_value(value: &Value) -> Result<Self, ConvertError>;
}

fn integer(value: &Value) -> Result<i64, ConvertError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if n.is_u64() {
                Err(ConvertError::OutOfRange("int"))
            } else {
                Err(ConvertError::WrongType("int"))
            }
        }
        _ => Err(ConvertError::WrongType("int")),
    }
}

impl FromConfigValue for i64 {
    fn from_config_value(value: &Value) -> Result<Self, ConvertError> {
        integer(value)
    }
}

impl FromConfigValue for i32 {
    fn from_config_value(value: &Value) -> Result<Self, ConvertError> {
        i32::try_from(integer(value)?)
            .map_err(|_| ConvertError::OutOfRange("i32"))
    }
}

impl FromConfigValue for usize {
    fn from_config_value(value: &Value) -> Result<Self, ConvertError> {
        usize::try_from(integer(value)?)
            .map_err(|_| ConvertError::OutOfRange("usize"))
    }
}

impl FromConfigValue for f64 {
    fn from_config_value(value: &Value) -> Result<Self, ConvertError> {
        match value {
            Value::Number(n) => {
                n.as_f64().ok_or(ConvertError::WrongType("float"))
            }
            _ => Err(ConvertError::WrongType("float")),
        }
    }
}

impl FromConfigValue for bool {
    fn from_config_value(value: &Value) -> Result<Self, ConvertError> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::String(s) => match s.as_str() {
                "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
                "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
                _ => Err(ConvertError::WrongType("bool")),
            },
            _ => Err(ConvertError::WrongType("bool")),
        }
    }
}

impl FromConfigValue for String {
    fn from_config_value(value: &Value) -> Result<Self, ConvertError> {
        match value {
            Value::String(s) => Ok(s.clone()),
            _ => Err(ConvertError::WrongType("string")),
        }
    }
}

impl FromConfigValue for Map<String, Value> {
    fn from_config_value(value: &Value) -> Result<Self, ConvertError> {
        match value {
            Value::Object(map) => Ok(map.clone()),
            _ => Err(ConvertError::WrongType("map")),
        }
    }
}

/// Strings use duration syntax, numbers are seconds.
impl FromConfigValue for Duration {
    fn from_config_value(value: &Value) -> Result<Self, ConvertError> {
        match value {
            Value::String(s) => parse_duration_default_seconds(s),
            Value::Number(n) => {
                let secs = n
                    .as_f64()
                    .ok_or(ConvertError::WrongType("duration"))?;
                seconds(secs)
            }
            _ => Err(ConvertError::WrongType("duration")),
        }
    }
}

fn seconds(secs: f64) -> Result<Duration, ConvertError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ConvertError::Duration(e.to_string()))
}

/// Parses `"90"`, `"1.5"`, `"300ms"`, `"1h30m"` or `"2d"`. A bare number is
/// a count of seconds.
pub fn parse_duration_default_seconds(
    s: &str,
) -> Result<Duration, ConvertError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ConvertError::Duration("empty string".to_string()));
    }
    if let Ok(secs) = s.parse::<f64>() {
        return seconds(secs);
    }

    let invalid =
        || ConvertError::Duration(format!("invalid duration {:?}", s));
    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_end]
            .parse()
            .map_err(|_| invalid())?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86400.0,
            "" => {
                return Err(ConvertError::Duration(format!(
                    "missing unit in duration {:?}",
                    s
                )))
            }
            unit => {
                return Err(ConvertError::Duration(format!(
                    "unknown unit {:?} in duration {:?}",
                    unit, s
                )))
            }
        };
        rest = &rest[unit_end..];
        total += value * scale;
    }
    seconds(total)
}

/// Builds a converter that decodes an object over `default`: fields present
/// in the configured value replace the default's, others keep it. Any field
/// failing to decode fails the whole conversion.
pub fn convert_structure<T>(
    default: T,
) -> impl Fn(&Value) -> Result<T, ConvertError>
where
    T: Serialize + DeserializeOwned,
{
    move |value: &Value| {
        let overrides = match value {
            Value::Object(map) => map,
            _ => return Err(ConvertError::WrongType("map")),
        };
        let mut merged = serde_json::to_value(&default)?;
        match merged.as_object_mut() {
            Some(base) => {
                for (k, v) in overrides {
                    base.insert(k.clone(), v.clone());
                }
            }
            None => return Err(ConvertError::WrongType("structure")),
        }
        Ok(serde_json::from_value(merged)?)
    }
}
