use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::document::{Document, get_path};

/// When an entity's membership ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndPeriod {
    /// A school/academic year, e.g. `2024`.
    Year(i32),
    /// An exact end date.
    Date(NaiveDate),
}

impl EndPeriod {
    /// Interpret a raw field value.
    ///
    /// Accepts integers, numeric strings, extended-JSON `{"$numberInt": "2024"}`
    /// wrappers, `YYYY-MM-DD` dates and RFC 3339 timestamps. Falsy values
    /// (null, `0`, `""`, `false`) mean "no end period". Anything else is
    /// unparseable and returns `Err` with the offending value rendered.
    pub fn from_value(value: &Value) -> Result<Option<Self>, String> {
        match value {
            Value::Null | Value::Bool(false) => Ok(None),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(None),
                Some(year) => i32::try_from(year)
                    .map(|y| Some(EndPeriod::Year(y)))
                    .map_err(|_| value.to_string()),
                None => match n.as_f64() {
                    Some(f) if f == 0.0 => Ok(None),
                    Some(f) if f.fract() == 0.0 && f.abs() < i32::MAX as f64 => {
                        Ok(Some(EndPeriod::Year(f as i32)))
                    }
                    _ => Err(value.to_string()),
                },
            },
            Value::String(s) => Self::from_str_value(s.trim()).ok_or_else(|| value.to_string()),
            Value::Object(map) => match map.get("$numberInt").or_else(|| map.get("$numberLong")) {
                Some(inner) => Self::from_value(inner),
                None => match map.get("$date") {
                    Some(inner) => Self::from_value(inner),
                    None => Err(value.to_string()),
                },
            },
            _ => Err(value.to_string()),
        }
    }

    fn from_str_value(s: &str) -> Option<Option<Self>> {
        if s.is_empty() {
            return Some(None);
        }
        if let Ok(year) = s.parse::<i32>() {
            return Some((year != 0).then_some(EndPeriod::Year(year)));
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Some(Some(EndPeriod::Date(date)));
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Some(Some(EndPeriod::Date(ts.with_timezone(&Utc).date_naive())));
        }
        None
    }

    /// Calendar year this period belongs to.
    pub fn year(&self) -> i32 {
        use chrono::Datelike;
        match self {
            EndPeriod::Year(y) => *y,
            EndPeriod::Date(d) => d.year(),
        }
    }

    /// January 1 of the year, or the literal date, at midnight.
    pub fn end_datetime(&self) -> Option<NaiveDateTime> {
        let date = match self {
            EndPeriod::Year(y) => NaiveDate::from_ymd_opt(*y, 1, 1)?,
            EndPeriod::Date(d) => *d,
        };
        date.and_hms_opt(0, 0, 0)
    }
}

/// Error extracting an entity from a stored document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntityError {
    #[error("document has no usable '{0}' identifier field")]
    MissingId(String),

    #[error("unparseable end period in '{field}': {value}")]
    InvalidEndPeriod { field: String, value: String },
}

/// The unit of retirement: one record from the plan's entity collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// Stable identifier, rendered as a string for logs and the report.
    pub id: String,
    /// The identifier exactly as stored, used when matching related records.
    pub raw_id: Value,
    pub end_period: Option<EndPeriod>,
    /// The full stored document; plan templates read references from here.
    pub document: Document,
}

impl Entity {
    /// Extract an entity using the configured field names.
    pub fn from_document(
        document: Document,
        id_field: &str,
        end_period_field: &str,
    ) -> Result<Self, EntityError> {
        let raw_id = match get_path(&document, id_field) {
            Some(Value::Null) | None => return Err(EntityError::MissingId(id_field.to_string())),
            Some(Value::String(s)) if s.is_empty() => {
                return Err(EntityError::MissingId(id_field.to_string()));
            }
            Some(v) => v.clone(),
        };
        let id = match &raw_id {
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("$oid") {
                Some(Value::String(oid)) => oid.clone(),
                _ => raw_id.to_string(),
            },
            other => other.to_string(),
        };

        let end_period = match get_path(&document, end_period_field) {
            Some(value) => EndPeriod::from_value(value).map_err(|value| {
                EntityError::InvalidEndPeriod {
                    field: end_period_field.to_string(),
                    value,
                }
            })?,
            None => None,
        };

        Ok(Self {
            id,
            raw_id,
            end_period,
            document,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::document;

    #[test]
    fn test_end_period_from_value() {
        assert_eq!(EndPeriod::from_value(&json!(2022)), Ok(Some(EndPeriod::Year(2022))));
        assert_eq!(EndPeriod::from_value(&json!("2025")), Ok(Some(EndPeriod::Year(2025))));
        assert_eq!(
            EndPeriod::from_value(&json!({ "$numberInt": "2023" })),
            Ok(Some(EndPeriod::Year(2023)))
        );
        assert_eq!(
            EndPeriod::from_value(&json!("2024-08-01")),
            Ok(Some(EndPeriod::Date(NaiveDate::from_ymd_opt(2024, 8, 1).unwrap())))
        );
        assert_eq!(
            EndPeriod::from_value(&json!("2024-08-01T10:00:00Z")),
            Ok(Some(EndPeriod::Date(NaiveDate::from_ymd_opt(2024, 8, 1).unwrap())))
        );
        assert_eq!(EndPeriod::from_value(&json!(null)), Ok(None));
        assert_eq!(EndPeriod::from_value(&json!(0)), Ok(None));
        assert_eq!(EndPeriod::from_value(&json!("")), Ok(None));
        assert!(EndPeriod::from_value(&json!("next year")).is_err());
        assert!(EndPeriod::from_value(&json!([2024])).is_err());
    }

    #[test]
    fn test_end_datetime() {
        let year = EndPeriod::Year(2024);
        assert_eq!(
            year.end_datetime(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(year.year(), 2024);
    }

    #[test]
    fn test_entity_from_document() {
        let doc = document::document(json!({
            "_id": "c1",
            "characterid": "u1",
            "endyear": 2022,
        }));
        let entity = Entity::from_document(doc, "_id", "endyear").unwrap();
        assert_eq!(entity.id, "c1");
        assert_eq!(entity.raw_id, json!("c1"));
        assert_eq!(entity.end_period, Some(EndPeriod::Year(2022)));
    }

    #[test]
    fn test_entity_object_id_and_numeric_id() {
        let doc = document::document(json!({ "_id": { "$oid": "65a1" } }));
        let entity = Entity::from_document(doc, "_id", "endyear").unwrap();
        assert_eq!(entity.id, "65a1");
        assert_eq!(entity.end_period, None);

        let doc = document::document(json!({ "id": 42 }));
        let entity = Entity::from_document(doc, "id", "endyear").unwrap();
        assert_eq!(entity.id, "42");
        assert_eq!(entity.raw_id, json!(42));
    }

    #[test]
    fn test_entity_errors() {
        let doc = document::document(json!({ "name": "no id" }));
        assert_eq!(
            Entity::from_document(doc, "id", "endyear"),
            Err(EntityError::MissingId("id".into()))
        );

        let doc = document::document(json!({ "id": "u1", "endyear": "soon" }));
        assert!(matches!(
            Entity::from_document(doc, "id", "endyear"),
            Err(EntityError::InvalidEndPeriod { .. })
        ));
    }
}
