use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Namespace Values
// =============================================================================

/// A value that can live in a session namespace.
///
/// This is the closed set of types that survive a snapshot round trip.
/// The serialized form is adjacently tagged so integers and floats never
/// collapse into one another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    Str(String),
    List(Vec<Value>),
    /// Table whose keys are all strings.
    Map(BTreeMap<String, Value>),
    /// Table with keys of any storable type, such as a sparse array or a
    /// sequence carrying named fields. Entries are kept in key order.
    Table(Vec<(TableKey, Value)>),
}

/// Key of a [`Value::Table`] entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TableKey {
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    Str(String),
}

impl TableKey {
    /// Sort order: booleans, then numbers, then strings.
    pub fn cmp_order(&self, other: &TableKey) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        fn rank(key: &TableKey) -> u8 {
            match key {
                TableKey::Bool(_) => 0,
                TableKey::Int(_) | TableKey::Float(_) => 1,
                TableKey::Str(_) => 2,
            }
        }
        match (self, other) {
            (TableKey::Bool(a), TableKey::Bool(b)) => a.cmp(b),
            (TableKey::Int(a), TableKey::Int(b)) => a.cmp(b),
            (TableKey::Str(a), TableKey::Str(b)) => a.cmp(b),
            (a, b) if rank(a) == 1 && rank(b) == 1 => {
                a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal)
            }
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            TableKey::Int(i) => *i as f64,
            TableKey::Float(f) => *f,
            _ => f64::NAN,
        }
    }
}

impl std::fmt::Display for TableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableKey::Bool(b) => write!(f, "{}", b),
            TableKey::Int(i) => write!(f, "{}", i),
            TableKey::Float(x) => write!(f, "{}", x),
            TableKey::Str(s) => write!(f, "{}", s),
        }
    }
}

impl Value {
    /// Short type name used in `show_vars()` summaries and diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Table(_) => "table",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON document into a namespace value.
    ///
    /// Integral JSON numbers become `Int`, everything else numeric becomes
    /// `Float`.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert into plain JSON for display. Non-finite floats become strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Nil => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(float_repr::non_finite_label(*f).into())),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            // Display only: keys are stringified.
            Value::Table(entries) => serde_json::Value::Object(
                entries.iter().map(|(k, v)| (k.to_string(), v.to_json())).collect(),
            ),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// JSON has no representation for NaN or the infinities, so those are
/// written as strings and read back as floats.
mod float_repr {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;

    pub(super) fn non_finite_label(f: f64) -> &'static str {
        if f.is_nan() {
            "NaN"
        } else if f.is_sign_positive() {
            "inf"
        } else {
            "-inf"
        }
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_str(non_finite_label(*value))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        struct FloatVisitor;

        impl<'de> Visitor<'de> for FloatVisitor {
            type Value = f64;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a float or one of \"NaN\", \"inf\", \"-inf\"")
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
                Ok(v)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
                Ok(v as f64)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
                Ok(v as f64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
                match v {
                    "NaN" => Ok(f64::NAN),
                    "inf" => Ok(f64::INFINITY),
                    "-inf" => Ok(f64::NEG_INFINITY),
                    other => Err(E::custom(format!("invalid float literal '{}'", other))),
                }
            }
        }

        deserializer.deserialize_any(FloatVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_and_float_stay_distinct() {
        let values = vec![Value::Int(1), Value::Float(1.0)];
        let json = serde_json::to_string(&values).unwrap();
        let back: Vec<Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn test_non_finite_floats_survive_serialization() {
        let json = serde_json::to_string(&Value::Float(f64::INFINITY)).unwrap();
        assert!(json.contains("\"inf\""));
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Float(f64::INFINITY));

        let nan: Value = serde_json::from_str(r#"{"type":"float","value":"NaN"}"#).unwrap();
        assert!(matches!(nan, Value::Float(f) if f.is_nan()));
    }

    #[test]
    fn test_from_json_nested() {
        let json = serde_json::json!({"x": 1, "y": [1.5, "a", null], "z": {"ok": true}});
        let value = Value::from_json(&json);
        let Value::Map(map) = &value else {
            panic!("expected map");
        };
        assert_eq!(map["x"], Value::Int(1));
        assert_eq!(
            map["y"],
            Value::List(vec![Value::Float(1.5), Value::from("a"), Value::Nil])
        );
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_table_keys_keep_their_type() {
        let table = Value::Table(vec![
            (TableKey::Int(1), Value::Int(10)),
            (TableKey::Int(5), Value::from("e")),
            (TableKey::Float(f64::INFINITY), Value::Bool(true)),
            (TableKey::Str("1".into()), Value::from("string one")),
        ]);
        let json = serde_json::to_string(&table).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
        assert_eq!(back.type_name(), "table");
    }

    #[test]
    fn test_table_key_order() {
        let mut keys = vec![
            TableKey::Str("a".into()),
            TableKey::Int(3),
            TableKey::Float(1.5),
            TableKey::Bool(true),
            TableKey::Int(-2),
        ];
        keys.sort_by(|a, b| a.cmp_order(b));
        assert_eq!(
            keys,
            vec![
                TableKey::Bool(true),
                TableKey::Int(-2),
                TableKey::Float(1.5),
                TableKey::Int(3),
                TableKey::Str("a".into()),
            ]
        );
    }
}
