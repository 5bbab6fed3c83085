//! Tolerant decoders for spreadsheet-backed payloads.
//!
//! The remote store hands back cells as whatever type the sheet inferred, so
//! an id may be `4511` or `"4511"`, a flag may be `true` or `"TRUE"`, and an
//! empty cell arrives as `""`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

pub fn string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_to_string(&value).ok_or_else(|| D::Error::custom(format!("expected text, got {}", value)))
}

pub fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value_to_string(&value) {
        Some(s) if !s.is_empty() => Ok(Some(s)),
        Some(_) => Ok(None),
        None => Err(D::Error::custom(format!("expected text, got {}", value))),
    }
}

pub fn number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::Null => Ok(0),
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                u32::try_from(v).map_err(D::Error::custom)
            } else if let Some(f) = n.as_f64() {
                if f.is_sign_negative() {
                    Err(D::Error::custom("negative value"))
                } else {
                    Ok(f.round() as u32)
                }
            } else {
                Err(D::Error::custom("negative value"))
            }
        }
        Value::String(s) if s.trim().is_empty() => Ok(0),
        Value::String(s) => s.trim().parse().map_err(D::Error::custom),
        other => Err(D::Error::custom(format!("expected number, got {}", other))),
    }
}

pub fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(true),
            "false" | "0" | "no" | "n" | "" => Ok(false),
            other => Err(D::Error::custom(format!("expected boolean, got {:?}", other))),
        },
        other => Err(D::Error::custom(format!("expected boolean, got {}", other))),
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => {
            // Sheets report integral ids as floats now and then; 4511.0 is still "4511".
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64().map(|f| {
                    if f.fract() == 0.0 {
                        format!("{}", f as i64)
                    } else {
                        f.to_string()
                    }
                })
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Row {
        #[serde(deserialize_with = "super::string")]
        id: String,
        #[serde(default, deserialize_with = "super::opt_string")]
        room: Option<String>,
        #[serde(default, deserialize_with = "super::number")]
        minutes: u32,
        #[serde(default, deserialize_with = "super::flag")]
        active: bool,
    }

    #[test]
    fn test_numeric_id_becomes_text() {
        let row: Row = serde_json::from_str(r#"{"id": 4511}"#).unwrap();
        assert_eq!(row.id, "4511");

        let row: Row = serde_json::from_str(r#"{"id": 4511.0}"#).unwrap();
        assert_eq!(row.id, "4511");

        let row: Row = serde_json::from_str(r#"{"id": " 4511 "}"#).unwrap();
        assert_eq!(row.id, "4511");
    }

    #[test]
    fn test_empty_cell_is_absent_reference() {
        let row: Row = serde_json::from_str(r#"{"id": "1", "room": ""}"#).unwrap();
        assert_eq!(row.room, None);

        let row: Row = serde_json::from_str(r#"{"id": "1", "room": "r-1"}"#).unwrap();
        assert_eq!(row.room.as_deref(), Some("r-1"));
    }

    #[test]
    fn test_spreadsheet_flags_and_numbers() {
        let row: Row =
            serde_json::from_str(r#"{"id": "1", "minutes": "90", "active": "TRUE"}"#).unwrap();
        assert_eq!(row.minutes, 90);
        assert!(row.active);

        let row: Row = serde_json::from_str(r#"{"id": "1", "minutes": 60.0, "active": false}"#)
            .unwrap();
        assert_eq!(row.minutes, 60);
        assert!(!row.active);
    }

    #[test]
    fn test_rejects_structured_id() {
        let result: Result<Row, _> = serde_json::from_str(r#"{"id": {"nested": 1}}"#);
        assert!(result.is_err());
    }
}
