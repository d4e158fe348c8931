//! Request fingerprints.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Deterministic identity of a cacheable request: `endpoint(canonical-args)`.
///
/// Object keys in the args are sorted at every depth, so two requests that
/// differ only in key order share a fingerprint and a cache entry. Integral
/// floats are written as integers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(endpoint: &str, args: &Value) -> Self {
        let mut out = String::with_capacity(endpoint.len() + 16);
        out.push_str(endpoint);
        out.push('(');
        write_canonical(args, &mut out);
        out.push(')');
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compact JSON with object keys sorted, independent of how the `Map` was
/// built.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Number(n) => match n.as_f64() {
            // `1.0` and `1` name the same request.
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                out.push_str(&(f as i64).to_string())
            }
            _ => out.push_str(&n.to_string()),
        },
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integral_floats_match_integers() {
        assert_eq!(
            Fingerprint::new("getProduct", &json!({"id": 1})),
            Fingerprint::new("getProduct", &json!({"id": 1.0}))
        );
        assert_ne!(
            Fingerprint::new("getProduct", &json!({"id": 1})),
            Fingerprint::new("getProduct", &json!({"id": 1.5}))
        );
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = Fingerprint::new(
            "getProducts",
            &json!({"category": "Tablets", "page": 2, "filter": {"b": 1, "a": [{"y": 1, "x": 2}]}}),
        );
        let b = Fingerprint::new(
            "getProducts",
            &json!({"filter": {"a": [{"x": 2, "y": 1}], "b": 1}, "page": 2, "category": "Tablets"}),
        );
        assert_eq!(a, b);
        assert_eq!(
            a.as_str(),
            r#"getProducts({"category":"Tablets","filter":{"a":[{"x":2,"y":1}],"b":1},"page":2})"#
        );
    }

    #[test]
    fn endpoint_and_values_distinguish() {
        let args = json!({"id": 1});
        assert_ne!(
            Fingerprint::new("getProduct", &args),
            Fingerprint::new("getCart", &args)
        );
        assert_ne!(
            Fingerprint::new("getProduct", &json!({"id": 1})),
            Fingerprint::new("getProduct", &json!({"id": "1"}))
        );
    }

    #[test]
    fn array_order_is_significant() {
        assert_ne!(
            Fingerprint::new("q", &json!([1, 2])),
            Fingerprint::new("q", &json!([2, 1]))
        );
    }

    #[test]
    fn scalar_and_null_args() {
        assert_eq!(Fingerprint::new("getMyCart", &Value::Null).as_str(), "getMyCart(null)");
        assert_eq!(Fingerprint::new("getProduct", &json!(5)).as_str(), "getProduct(5)");
    }
}
