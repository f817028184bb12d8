use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::evasion::{PAD_TYPES, URI_ENCODE_MODES};

pub const DEFAULT_AGENT: &str = "Mozilla/4.0 (compatible; MSIE 6.0; Windows NT 5.1)";
pub const DEFAULT_READ_MAX_DATA: i64 = 1024 * 1024;

/// Value schema for a named option. Unknown names fall back to `Str`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OptionKind {
    Str,
    Integer,
    Bool,
    Enum(&'static [&'static str]),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Integer(i64),
    Str(String),
}

impl OptionValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

pub fn kind_of(name: &str) -> OptionKind {
    match name {
        "agent" | "vhost" | "ssl_server_name_indication" | "domain" | "username" | "password"
        | "preferred_auth" => OptionKind::Str,

        "read_max_data"
        | "uri_encode_count"
        | "pad_method_uri_count"
        | "pad_uri_version_count"
        | "pad_fake_headers_count"
        | "pad_get_params_count"
        | "pad_post_params_count"
        | "chunked_size" => OptionKind::Integer,

        "partial" | "no_body_for_auth" | "digest_auth_iis" | "uri_full_url"
        | "uri_dir_self_reference" | "uri_dir_fake_relative" | "uri_use_backslashes"
        | "uri_fake_end" | "uri_fake_params_start" | "method_random_valid"
        | "method_random_invalid" | "method_random_case" | "version_random_valid"
        | "version_random_invalid" | "pad_fake_headers" | "pad_get_params"
        | "pad_post_params" | "shuffle_get_params" | "shuffle_post_params"
        | "header_folding" => OptionKind::Bool,

        "uri_encode_mode" => OptionKind::Enum(URI_ENCODE_MODES),
        "pad_method_uri_type" | "pad_uri_version_type" => OptionKind::Enum(PAD_TYPES),

        _ => OptionKind::Str,
    }
}

/// Loose truthiness: `true`/`false` plus anything starting with `t`, `y`
/// or `1` (case-insensitive) is true. Everything else is false.
fn coerce_bool(value: &str) -> bool {
    let v = value.trim();
    if v.eq_ignore_ascii_case("true") {
        return true;
    }
    matches!(v.as_bytes().first(), Some(b't' | b'T' | b'y' | b'Y' | b'1'))
}

/// Decimal parse; anything unparsable is 0.
fn coerce_int(value: &str) -> i64 {
    value.trim().parse::<i64>().unwrap_or(0)
}

/// Typed, validated configuration bag. Writes are coerced per the schema
/// in `kind_of`; reads come back with defaults applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    opts: BTreeMap<String, OptionValue>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let mut cfg = ClientConfig {
            opts: BTreeMap::new(),
        };
        let defaults: &[(&str, OptionValue)] = &[
            ("agent", OptionValue::Str(DEFAULT_AGENT.into())),
            ("read_max_data", OptionValue::Integer(DEFAULT_READ_MAX_DATA)),
            ("uri_encode_mode", OptionValue::Str("hex-normal".into())),
            ("uri_encode_count", OptionValue::Integer(1)),
            ("pad_method_uri_count", OptionValue::Integer(1)),
            ("pad_uri_version_count", OptionValue::Integer(1)),
            ("pad_method_uri_type", OptionValue::Str("space".into())),
            ("pad_uri_version_type", OptionValue::Str("space".into())),
            ("pad_fake_headers_count", OptionValue::Integer(16)),
            ("pad_get_params_count", OptionValue::Integer(16)),
            ("pad_post_params_count", OptionValue::Integer(16)),
            ("chunked_size", OptionValue::Integer(0)),
            ("digest_auth_iis", OptionValue::Bool(true)),
        ];
        for (name, value) in defaults {
            cfg.opts.insert((*name).to_string(), value.clone());
        }
        cfg
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores one option from its string form. Enum options
    /// reject values outside their declared choices; bool and integer
    /// options coerce.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), Error> {
        let coerced = match kind_of(name) {
            OptionKind::Str => OptionValue::Str(value.to_string()),
            OptionKind::Integer => OptionValue::Integer(coerce_int(value)),
            OptionKind::Bool => OptionValue::Bool(coerce_bool(value)),
            OptionKind::Enum(allowed) => {
                if !allowed.contains(&value) {
                    return Err(Error::InvalidOption {
                        name: name.to_string(),
                        value: value.to_string(),
                        allowed,
                    });
                }
                OptionValue::Str(value.to_string())
            }
        };
        self.opts.insert(name.to_string(), coerced);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.opts.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.opts.get(name) {
            Some(OptionValue::Str(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> bool {
        match self.opts.get(name) {
            Some(OptionValue::Bool(b)) => *b,
            Some(OptionValue::Str(s)) => coerce_bool(s),
            Some(OptionValue::Integer(n)) => *n != 0,
            None => false,
        }
    }

    pub fn get_int(&self, name: &str) -> i64 {
        match self.opts.get(name) {
            Some(OptionValue::Integer(n)) => *n,
            Some(OptionValue::Str(s)) => coerce_int(s),
            Some(OptionValue::Bool(b)) => *b as i64,
            None => 0,
        }
    }

    /// A per-call view: the base config plus `overrides`, without mutating
    /// the base. Override writes validate the same way `set` does.
    pub fn merge<'a, I>(&self, overrides: I) -> Result<ClientConfig, Error>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut merged = self.clone();
        for (name, value) in overrides {
            merged.set(name, value)?;
        }
        Ok(merged)
    }

    /// Loads options from a JSON object, coercing each value through the
    /// schema. Non-object values are rejected.
    pub fn load_json(&mut self, value: &serde_json::Value) -> Result<(), Error> {
        let map = value.as_object().ok_or_else(|| Error::Encode(
            "config document must be a JSON object".to_string(),
        ))?;
        for (name, v) in map {
            let text = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.set(name, &text)?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.opts).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_writes_validate() {
        let mut cfg = ClientConfig::new();
        let err = cfg.set("uri_encode_mode", "bogus").unwrap_err();
        match err {
            Error::InvalidOption { name, value, .. } => {
                assert_eq!(name, "uri_encode_mode");
                assert_eq!(value, "bogus");
            }
            other => panic!("unexpected error: {other}"),
        }
        cfg.set("uri_encode_mode", "u-random").unwrap();
        assert_eq!(cfg.get_str("uri_encode_mode"), Some("u-random"));
    }

    #[test]
    fn bool_coercion_accepts_loose_truthiness() {
        let mut cfg = ClientConfig::new();
        for truthy in ["yes", "true", "T", "1", "y"] {
            cfg.set("partial", truthy).unwrap();
            assert!(cfg.get_bool("partial"), "{truthy} should be true");
        }
        for falsy in ["no", "false", "0", "off", ""] {
            cfg.set("partial", falsy).unwrap();
            assert!(!cfg.get_bool("partial"), "{falsy} should be false");
        }
    }

    #[test]
    fn integer_coercion_defaults_to_zero() {
        let mut cfg = ClientConfig::new();
        cfg.set("read_max_data", "4096").unwrap();
        assert_eq!(cfg.get_int("read_max_data"), 4096);
        cfg.set("read_max_data", "not-a-number").unwrap();
        assert_eq!(cfg.get_int("read_max_data"), 0);
    }

    #[test]
    fn unknown_names_are_strings() {
        let mut cfg = ClientConfig::new();
        cfg.set("x_custom_knob", "whatever").unwrap();
        assert_eq!(cfg.get_str("x_custom_knob"), Some("whatever"));
    }

    #[test]
    fn merge_leaves_the_base_alone() {
        let base = ClientConfig::new();
        let view = base.merge([("agent", "probe/1.0"), ("partial", "1")]).unwrap();
        assert_eq!(view.get_str("agent"), Some("probe/1.0"));
        assert!(view.get_bool("partial"));
        assert_eq!(base.get_str("agent"), Some(DEFAULT_AGENT));
        assert!(!base.get_bool("partial"));
    }

    #[test]
    fn json_round_trip() {
        let mut cfg = ClientConfig::new();
        let doc = serde_json::json!({
            "vhost": "target.example",
            "chunked_size": 17,
            "header_folding": true,
        });
        cfg.load_json(&doc).unwrap();
        assert_eq!(cfg.get_str("vhost"), Some("target.example"));
        assert_eq!(cfg.get_int("chunked_size"), 17);
        assert!(cfg.get_bool("header_folding"));

        let dumped = cfg.to_json();
        assert_eq!(dumped["vhost"], "target.example");
    }

    #[test]
    fn defaults_are_seeded() {
        let cfg = ClientConfig::new();
        assert_eq!(cfg.get_int("read_max_data"), DEFAULT_READ_MAX_DATA);
        assert_eq!(cfg.get_str("uri_encode_mode"), Some("hex-normal"));
        assert!(cfg.get_bool("digest_auth_iis"));
        assert_eq!(cfg.get_int("pad_method_uri_count"), 1);
    }
}
