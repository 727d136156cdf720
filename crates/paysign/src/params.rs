use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::{PaySignError, Result};

/// Keys that carry the signature itself and never take part in signing.
pub const SIGN_FIELDS: [&str; 2] = ["sign", "sign_type"];

/// Binary field sent through the multipart path, never signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileParam {
    pub name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    /// Nested object or array, serialized as one JSON value when signed.
    Json(Value),
    File(FileParam),
}

impl ParamValue {
    /// The value as it appears in a canonical string, or `None` when it is
    /// excluded (empty text, null, file).
    fn signable(&self) -> Option<String> {
        match self {
            Self::Text(text) if text.is_empty() => None,
            Self::Text(text) => Some(text.clone()),
            Self::Json(Value::Null) => None,
            Self::Json(value) => Some(value.to_string()),
            Self::File(_) => None,
        }
    }

    fn to_json(&self) -> Option<Value> {
        match self {
            Self::Text(text) => Some(Value::String(text.clone())),
            Self::Json(value) => Some(value.clone()),
            Self::File(_) => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for ParamValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

macro_rules! text_from_display {
    ($($ty:ty),*) => {
        $(impl From<$ty> for ParamValue {
            fn from(value: $ty) -> Self {
                Self::Text(value.to_string())
            }
        })*
    };
}

text_from_display!(i32, i64, u32, u64, usize, bool);

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text),
            Value::Number(number) => Self::Text(number.to_string()),
            Value::Bool(flag) => Self::Text(flag.to_string()),
            other => Self::Json(other),
        }
    }
}

impl From<FileParam> for ParamValue {
    fn from(value: FileParam) -> Self {
        Self::File(value)
    }
}

impl From<ParameterBag> for ParamValue {
    fn from(value: ParameterBag) -> Self {
        Self::Json(value.to_json())
    }
}

/// Insertion-ordered request parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterBag {
    entries: IndexMap<String, ParamValue>,
}

impl ParameterBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key`. A replaced key keeps its original position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.get(key)
    }

    /// Text value of `key`; `None` for JSON and file values.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(ParamValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        self.entries.shift_remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Fails with the first key in `keys` that is absent or empty.
    pub fn check_required(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            let present = self
                .entries
                .get(*key)
                .is_some_and(|value| value.signable().is_some() || matches!(value, ParamValue::File(_)));
            if !present {
                return Err(PaySignError::MissingParam((*key).to_string()));
            }
        }
        Ok(())
    }

    /// Deterministic signing input: `k1=v1&k2=v2` over the signable entries,
    /// keys in ascending byte order. `sign`, `sign_type`, empty values,
    /// nulls and files are left out.
    pub fn canonical_string(&self) -> String {
        self.canonical_string_without(&SIGN_FIELDS)
    }

    /// Canonical string leaving out `excluded` instead of both sign fields.
    /// Alipay requests sign `sign_type` too.
    pub fn canonical_string_without(&self, excluded: &[&str]) -> String {
        let mut pairs: Vec<(&str, String)> = self
            .entries
            .iter()
            .filter(|(key, _)| !excluded.contains(&key.as_str()))
            .filter_map(|(key, value)| value.signable().map(|v| (key.as_str(), v)))
            .collect();
        pairs.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        let mut out = String::new();
        for (i, (key, value)) in pairs.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out
    }

    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .filter_map(|(key, value)| value.to_json().map(|v| (key.clone(), v)))
            .collect();
        Value::Object(map)
    }

    /// JSON request body in insertion order, files excluded.
    pub fn json_body(&self) -> String {
        self.to_json().to_string()
    }

    /// `application/x-www-form-urlencoded` body, keys sorted, files excluded.
    pub fn form_urlencoded(&self) -> String {
        let mut pairs: Vec<(&str, String)> = self
            .entries
            .iter()
            .filter_map(|(key, value)| match value {
                ParamValue::Text(text) => Some((key.as_str(), text.clone())),
                ParamValue::Json(Value::Null) | ParamValue::File(_) => None,
                ParamValue::Json(json) => Some((key.as_str(), json.to_string())),
            })
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));

        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in pairs {
            serializer.append_pair(key, &value);
        }
        serializer.finish()
    }
}

impl<K, V> FromIterator<(K, V)> for ParameterBag
where
    K: Into<String>,
    V: Into<ParamValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bag = Self::new();
        for (key, value) in iter {
            bag.set(key, value);
        }
        bag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_drops_sign_fields_and_empty_values() {
        let bag: ParameterBag = [("b", "2"), ("a", "1"), ("sign", "x"), ("empty", "")]
            .into_iter()
            .collect();
        assert_eq!(bag.canonical_string(), "a=1&b=2");
    }

    #[test]
    fn canonical_ignores_insertion_order() {
        let forward = ParameterBag::new().with("app_id", "1").with("method", "m").with("charset", "utf-8");
        let backward = ParameterBag::new().with("charset", "utf-8").with("method", "m").with("app_id", "1");
        assert_eq!(forward.canonical_string(), backward.canonical_string());
        assert_eq!(forward.canonical_string(), "app_id=1&charset=utf-8&method=m");
    }

    #[test]
    fn canonical_sorts_by_byte_value() {
        let bag = ParameterBag::new().with("a", "1").with("B", "2").with("_c", "3");
        assert_eq!(bag.canonical_string(), "B=2&_c=3&a=1");
    }

    #[test]
    fn canonical_excludes_sign_type_and_files() {
        let bag = ParameterBag::new()
            .with("sign_type", "RSA2")
            .with("media", FileParam { name: "a.png".into(), content: vec![1, 2, 3] })
            .with("meta", "x");
        assert_eq!(bag.canonical_string(), "meta=x");
    }

    #[test]
    fn canonical_without_keeps_sign_type() {
        let bag = ParameterBag::new().with("sign_type", "RSA2").with("sign", "x").with("a", "1");
        assert_eq!(bag.canonical_string_without(&["sign"]), "a=1&sign_type=RSA2");
    }

    /// Keys of `encoded`, checking every pair is `key=value` with a value.
    fn canonical_keys(encoded: &str) -> Vec<&str> {
        encoded
            .split('&')
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap();
                assert!(!value.is_empty(), "empty value for {key}");
                key
            })
            .collect()
    }

    #[test]
    fn canonical_keys_are_byte_sorted_across_key_shapes() {
        let cases: &[&[&str]] = &[
            &["b", "a", "C", "A", "c"],
            &["out_trade_no", "out_trade", "out-trade", "outTradeNo", "out.trade"],
            &["商户", "appid", "金额", "éclair", "zeta", "Zeta"],
            &["a10", "a2", "a1", "a_1", "a01"],
            &["sign", "sign_type", "signature", "sign_", "SIGN"],
        ];
        for keys in cases {
            let bag: ParameterBag = keys.iter().map(|key| (*key, "v")).collect();
            let encoded = bag.canonical_string();
            let got = canonical_keys(&encoded);

            let mut expected: Vec<&str> = keys
                .iter()
                .copied()
                .filter(|key| *key != "sign" && *key != "sign_type")
                .collect();
            expected.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
            assert_eq!(got, expected, "{keys:?}");
        }
    }

    #[test]
    fn canonical_holds_for_seeded_random_bags() {
        use rand::seq::SliceRandom;
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha20Rng;

        const ALPHABET: &[&str] = &["a", "B", "z", "_", "0", "9", "é", "支", "付", "-", "."];
        let mut rng = ChaCha20Rng::seed_from_u64(20261018);
        for _ in 0..200 {
            let mut bag = ParameterBag::new();
            for _ in 0..rng.gen_range(0..12) {
                let key: String = match rng.gen_range(0..10) {
                    0 => "sign".into(),
                    1 => "sign_type".into(),
                    _ => (0..rng.gen_range(1..6))
                        .map(|_| *ALPHABET.choose(&mut rng).unwrap())
                        .collect(),
                };
                let value = if rng.gen_bool(0.2) { "" } else { "v" };
                bag.set(key, value);
            }

            let encoded = bag.canonical_string();
            if encoded.is_empty() {
                continue;
            }
            let keys = canonical_keys(&encoded);
            assert!(!keys.contains(&"sign") && !keys.contains(&"sign_type"), "{encoded}");
            assert!(
                keys.windows(2).all(|pair| pair[0].as_bytes() < pair[1].as_bytes()),
                "{encoded}"
            );
            let kept = bag
                .iter()
                .filter(|(key, value)| {
                    *key != "sign" && *key != "sign_type" && value.signable().is_some()
                })
                .count();
            assert_eq!(keys.len(), kept);
        }
    }

    #[test]
    fn nested_map_is_json_serialized() {
        let biz = ParameterBag::new().with("out_trade_no", "T1").with("total_amount", "0.01");
        let bag = ParameterBag::new().with("biz_content", biz).with("app_id", "2016");
        assert_eq!(
            bag.canonical_string(),
            r#"app_id=2016&biz_content={"out_trade_no":"T1","total_amount":"0.01"}"#
        );
    }

    #[test]
    fn null_json_is_excluded() {
        let bag = ParameterBag::new().with("a", json!(null)).with("b", json!(3));
        assert_eq!(bag.canonical_string(), "b=3");
    }

    #[test]
    fn empty_bag_encodes_to_empty_string() {
        assert_eq!(ParameterBag::new().canonical_string(), "");
    }

    #[test]
    fn set_replaces_in_place() {
        let mut bag = ParameterBag::new().with("x", "1").with("y", "2");
        bag.set("x", "3");
        let keys: Vec<&str> = bag.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["x", "y"]);
        assert_eq!(bag.get_str("x"), Some("3"));
    }

    #[test]
    fn check_required_reports_first_missing_key() {
        let bag = ParameterBag::new().with("out_trade_no", "T1").with("subject", "");
        let err = bag.check_required(&["out_trade_no", "subject", "total_amount"]).unwrap_err();
        assert!(matches!(err, PaySignError::MissingParam(key) if key == "subject"));
    }

    #[test]
    fn json_body_keeps_insertion_order() {
        let bag = ParameterBag::new()
            .with("mchid", "1900")
            .with("amount", json!({"total": 1, "currency": "CNY"}))
            .with("appid", "wx1");
        assert_eq!(
            bag.json_body(),
            r#"{"mchid":"1900","amount":{"total":1,"currency":"CNY"},"appid":"wx1"}"#
        );
    }

    #[test]
    fn form_urlencoded_escapes_values() {
        let bag = ParameterBag::new().with("timestamp", "2023-01-01 10:00:00").with("a", "x&y");
        assert_eq!(bag.form_urlencoded(), "a=x%26y&timestamp=2023-01-01+10%3A00%3A00");
    }
}
