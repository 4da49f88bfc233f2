/// Field descriptor registry: maps the portable field type names that dataset
/// maintainers put into the catalog onto concrete column specifications and
/// onto a parser usable by the external row-ingestion pipeline.
///
/// The set of types is closed; anything else must fail schema synthesis
/// instead of silently defaulting to a text column.
use serde::Deserialize;
use serde_json::Value as JsonValue;
use strum_macros::{Display, EnumIter, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Email,
    Binary,
    Json,
    Text,
}

/// Constructor parameters passed through from the catalog `Field.options`
/// blob. Unknown keys are ignored so that frontend-only options (e.g. display
/// hints) can share the same blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ColumnOptions {
    pub max_length: Option<u32>,
    pub max_digits: Option<u32>,
    pub decimal_places: Option<u32>,
}

/// A fully resolved column: portable type + nullability + options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub field_type: FieldType,
    pub nullable: bool,
    pub options: ColumnOptions,
}

impl ColumnSpec {
    pub fn new(
        field_type: FieldType,
        options: Option<&JsonValue>,
        nullable: bool,
    ) -> Result<Self, serde_json::Error> {
        let options = match options {
            Some(value) => ColumnOptions::deserialize(value)?,
            None => ColumnOptions::default(),
        };
        Ok(Self {
            field_type,
            nullable,
            options,
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Value {value:?} is not a valid {field_type}")]
pub struct ValueParseError {
    pub field_type: FieldType,
    pub value: String,
}

impl FieldType {
    /// Parse a raw textual value (as produced by a CSV/spreadsheet loader)
    /// into a typed JSON value matching this column kind. This is the schema
    /// surface the external import pipeline programs against.
    pub fn parse_value(&self, raw: &str) -> Result<JsonValue, ValueParseError> {
        let error = || ValueParseError {
            field_type: *self,
            value: raw.to_string(),
        };
        let raw = raw.trim();

        match self {
            FieldType::String | FieldType::Text => Ok(JsonValue::from(raw)),
            FieldType::Integer => raw
                .parse::<i64>()
                .map(JsonValue::from)
                .map_err(|_| error()),
            FieldType::Float => raw
                .parse::<f64>()
                .map(JsonValue::from)
                .map_err(|_| error()),
            // Decimals stay textual to avoid binary float drift; the storage
            // backend casts them into its native numeric type.
            FieldType::Decimal => match raw.parse::<f64>() {
                Ok(_) => Ok(JsonValue::from(raw)),
                Err(_) => Err(error()),
            },
            FieldType::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "1" => Ok(JsonValue::from(true)),
                "false" | "f" | "no" | "0" => Ok(JsonValue::from(false)),
                _ => Err(error()),
            },
            FieldType::Date => {
                if is_iso_date(raw) {
                    Ok(JsonValue::from(raw))
                } else {
                    Err(error())
                }
            }
            FieldType::DateTime => {
                // A multibyte character straddling the date/time boundary
                // can't be part of a valid ISO timestamp
                let split = raw.len().min(10);
                if !raw.is_char_boundary(split) {
                    return Err(error());
                }
                let (date, rest) = raw.split_at(split);
                let time_ok = rest.is_empty()
                    || ((rest.starts_with(' ') || rest.starts_with('T'))
                        && rest[1..].splitn(3, ':').all(|part| {
                            !part.is_empty()
                                && part.chars().all(|c| c.is_ascii_digit() || c == '.')
                        }));
                if is_iso_date(date) && time_ok {
                    Ok(JsonValue::from(raw))
                } else {
                    Err(error())
                }
            }
            FieldType::Email => {
                let (user, domain) = raw.split_once('@').ok_or_else(error)?;
                if user.is_empty() || domain.is_empty() || !domain.contains('.') {
                    return Err(error());
                }
                Ok(JsonValue::from(raw))
            }
            // Binary values travel as hex strings; decoding here only
            // validates them.
            FieldType::Binary => match hex::decode(raw) {
                Ok(_) => Ok(JsonValue::from(raw.to_ascii_lowercase())),
                Err(_) => Err(error()),
            },
            FieldType::Json => serde_json::from_str(raw).map_err(|_| error()),
        }
    }
}

fn is_iso_date(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    parts.len() == 3
        && parts[0].len() == 4
        && parts[1].len() == 2
        && parts[2].len() == 2
        && parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_type_names_round_trip() {
        for field_type in FieldType::iter() {
            assert_eq!(
                FieldType::from_str(&field_type.to_string()).unwrap(),
                field_type
            );
        }
        assert_eq!(FieldType::from_str("datetime").unwrap(), FieldType::DateTime);
        assert!(FieldType::from_str("uuid").is_err());
        assert!(FieldType::from_str("STRING").is_err());
    }

    #[test]
    fn test_column_spec_options_passthrough() {
        let options = serde_json::json!({"max_length": 255, "something_else": true});
        let spec = ColumnSpec::new(FieldType::String, Some(&options), false).unwrap();
        assert_eq!(spec.options.max_length, Some(255));
        assert!(!spec.nullable);

        let spec = ColumnSpec::new(FieldType::Decimal, None, true).unwrap();
        assert_eq!(spec.options, ColumnOptions::default());
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(
            FieldType::Integer.parse_value("42").unwrap(),
            JsonValue::from(42)
        );
        assert_eq!(
            FieldType::Boolean.parse_value("t").unwrap(),
            JsonValue::from(true)
        );
        assert_eq!(
            FieldType::Decimal.parse_value("10.50").unwrap(),
            JsonValue::from("10.50")
        );
        assert_eq!(
            FieldType::Date.parse_value("2020-03-01").unwrap(),
            JsonValue::from("2020-03-01")
        );
        assert_eq!(
            FieldType::DateTime
                .parse_value("2020-03-01T12:30:00")
                .unwrap(),
            JsonValue::from("2020-03-01T12:30:00")
        );
        assert_eq!(
            FieldType::Json.parse_value(r#"{"a": 1}"#).unwrap(),
            serde_json::json!({"a": 1})
        );

        assert!(FieldType::Integer.parse_value("forty-two").is_err());
        assert!(FieldType::Date.parse_value("01/03/2020").is_err());
        assert!(FieldType::Email.parse_value("not-an-email").is_err());
        assert!(FieldType::Binary.parse_value("0xzz").is_err());
    }

    #[test]
    fn test_parse_datetime_rejects_mangled_input() {
        // Non-ASCII garbage around the date/time boundary must come back as
        // a parse error, whatever bytes the loader hands us
        for raw in ["2020-03-0é 11:11", "2020-03-0日", "ééééééééé é", "é"] {
            assert!(FieldType::DateTime.parse_value(raw).is_err(), "{raw:?}");
        }
        assert!(FieldType::DateTime.parse_value("2020-03-01 11:11").is_ok());
    }
}
