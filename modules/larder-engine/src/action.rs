//! Actions and their payloads.
//!
//! A [`Payload`] is a JSON-shaped tree that can also hold values JSON cannot
//! represent: opaque handles and non-finite floats. Domain actions are
//! expected to stay within JSON; the serializability guard reports the
//! first value that does not.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Number, Value};

use crate::error::PayloadError;

/// A dispatched action: a type string plus a payload.
#[derive(Debug, Clone)]
pub struct Action {
    kind: String,
    payload: Payload,
}

impl Action {
    /// Create an action with a `Null` payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Payload::Null,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Build an action whose payload is the JSON form of `payload`.
    pub fn from_serialize<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind).with_payload(serde_json::to_value(payload)?))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Decode the payload into `T`. Fails if the payload holds values that
    /// have no JSON form.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let json = self.payload.to_json()?;
        Ok(serde_json::from_value(json)?)
    }
}

/// A value that cannot be serialized, carried by reference.
#[derive(Clone)]
pub struct Opaque {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque<{}>", self.type_name)
    }
}

#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    List(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
    Opaque(Opaque),
}

/// The first non-serializable value found in a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path from the payload root, e.g. `items[2].callback`.
    pub path: String,
    /// Description of what was found there.
    pub found: String,
}

impl Payload {
    /// Look up a key in a `Map` payload.
    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Payload::Map(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&Opaque> {
        match self {
            Payload::Opaque(o) => Some(o),
            _ => None,
        }
    }

    /// Depth-first search for the first value without a JSON form.
    pub fn find_non_serializable(&self) -> Option<Violation> {
        let mut path = Vec::new();
        self.find_at(&mut path)
    }

    fn find_at(&self, path: &mut Vec<String>) -> Option<Violation> {
        let found = match self {
            Payload::Opaque(o) => format!("opaque value of type {}", o.type_name()),
            Payload::Float(f) if !f.is_finite() => format!("non-finite number {f}"),
            Payload::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    path.push(format!("[{i}]"));
                    let hit = item.find_at(path);
                    path.pop();
                    if hit.is_some() {
                        return hit;
                    }
                }
                return None;
            }
            Payload::Map(map) => {
                for (key, item) in map {
                    path.push(key.clone());
                    let hit = item.find_at(path);
                    path.pop();
                    if hit.is_some() {
                        return hit;
                    }
                }
                return None;
            }
            _ => return None,
        };

        Some(Violation {
            path: render_path(path),
            found,
        })
    }

    /// Convert to JSON, failing on the first non-serializable value.
    pub fn to_json(&self) -> Result<Value, PayloadError> {
        if let Some(violation) = self.find_non_serializable() {
            return Err(PayloadError::NotSerializable {
                path: violation.path,
                found: violation.found,
            });
        }
        Ok(self.to_json_unchecked())
    }

    fn to_json_unchecked(&self) -> Value {
        match self {
            Payload::Null | Payload::Opaque(_) => Value::Null,
            Payload::Bool(b) => Value::Bool(*b),
            Payload::Int(i) => Value::from(*i),
            Payload::UInt(u) => Value::from(*u),
            Payload::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Payload::Str(s) => Value::String(s.clone()),
            Payload::List(items) => Value::Array(items.iter().map(Self::to_json_unchecked).collect()),
            Payload::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_unchecked()))
                    .collect(),
            ),
        }
    }
}

fn render_path(segments: &[String]) -> String {
    if segments.is_empty() {
        return "<root>".to_string();
    }
    let mut out = String::new();
    for segment in segments {
        if !out.is_empty() && !segment.starts_with('[') {
            out.push('.');
        }
        out.push_str(segment);
    }
    out
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Payload::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Payload::UInt(u)
                } else {
                    Payload::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Payload::Str(s),
            Value::Array(items) => Payload::List(items.into_iter().map(Payload::from).collect()),
            Value::Object(map) => {
                Payload::Map(map.into_iter().map(|(k, v)| (k, Payload::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Str(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Str(s)
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Payload::Bool(b)
    }
}

impl From<i64> for Payload {
    fn from(i: i64) -> Self {
        Payload::Int(i)
    }
}

impl From<u32> for Payload {
    fn from(u: u32) -> Self {
        Payload::Int(i64::from(u))
    }
}

impl From<f64> for Payload {
    fn from(f: f64) -> Self {
        Payload::Float(f)
    }
}

impl From<Opaque> for Payload {
    fn from(o: Opaque) -> Self {
        Payload::Opaque(o)
    }
}

impl From<Vec<Payload>> for Payload {
    fn from(items: Vec<Payload>) -> Self {
        Payload::List(items)
    }
}

impl<K: Into<String>, V: Into<Payload>> FromIterator<(K, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Payload::Map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_payload_round_trips() {
        let value = json!({"id": 7, "tags": ["a", "b"], "price": 19.5, "big": u64::MAX});
        let payload = Payload::from(value.clone());
        assert!(payload.find_non_serializable().is_none());
        assert_eq!(payload.to_json().unwrap(), value);
    }

    #[test]
    fn finds_nested_opaque_value() {
        let payload: Payload = [(
            "items",
            Payload::List(vec![
                Payload::from(1i64),
                [("callback", Payload::from(Opaque::new(|| ())))]
                    .into_iter()
                    .collect(),
            ]),
        )]
        .into_iter()
        .collect();

        let violation = payload.find_non_serializable().unwrap();
        assert_eq!(violation.path, "items[1].callback");
        assert!(violation.found.starts_with("opaque value"));
        assert!(payload.to_json().is_err());
    }

    #[test]
    fn non_finite_float_is_a_violation() {
        let violation = Payload::from(f64::INFINITY).find_non_serializable().unwrap();
        assert_eq!(violation.path, "<root>");
        assert!(Payload::from(1.25).find_non_serializable().is_none());
    }

    #[test]
    fn decode_reads_typed_payload() {
        #[derive(serde::Deserialize)]
        struct Login {
            email: String,
        }

        let action = Action::new("auth/login").with_payload(json!({"email": "a@b.c"}));
        let login: Login = action.decode().unwrap();
        assert_eq!(login.email, "a@b.c");
        assert!(action.is("auth/login"));
    }

    #[test]
    fn opaque_downcasts_to_original_type() {
        let opaque = Opaque::new(42u8);
        assert_eq!(opaque.downcast_ref::<u8>(), Some(&42));
        assert!(opaque.downcast_ref::<String>().is_none());
    }
}
