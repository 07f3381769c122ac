use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// A single datasource parameter. String values coerce leniently to the
/// numeric and boolean getters so callers can pass everything as text (the
/// common case when parameters come from a map file or the command line).
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

/// The typed parameter bag handed to `datasource::open`. Unknown keys are
/// ignored by backends; missing required keys fail construction.
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: HashMap<String, ParamValue>,
}

impl Params {
    pub fn new() -> Self {
        Params::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn get_text(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| match v {
            ParamValue::Text(s) => s.clone(),
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Float(f) => f.to_string(),
            ParamValue::Bool(b) => b.to_string(),
        })
    }

    pub fn required_text(&self, key: &str) -> Result<String> {
        self.get_text(key)
            .ok_or_else(|| Error::MissingParam(key.to_string()))
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(ParamValue::Bool(b)) => Ok(Some(*b)),
            Some(ParamValue::Int(i)) => Ok(Some(*i != 0)),
            Some(ParamValue::Text(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(Some(true)),
                "false" | "no" | "off" | "0" => Ok(Some(false)),
                _ => Err(invalid(key, format!("cannot parse '{s}' as a boolean"))),
            },
            Some(ParamValue::Float(_)) => Err(invalid(key, "expected a boolean".to_string())),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(ParamValue::Int(i)) => Ok(Some(*i)),
            Some(ParamValue::Float(f)) if f.fract() == 0.0 => Ok(Some(*f as i64)),
            Some(ParamValue::Text(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| invalid(key, format!("cannot parse '{s}' as an integer"))),
            Some(_) => Err(invalid(key, "expected an integer".to_string())),
        }
    }

    pub fn get_float(&self, key: &str) -> Result<Option<f64>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(ParamValue::Float(f)) => Ok(Some(*f)),
            Some(ParamValue::Int(i)) => Ok(Some(*i as f64)),
            Some(ParamValue::Text(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| invalid(key, format!("cannot parse '{s}' as a number"))),
            Some(_) => Err(invalid(key, "expected a number".to_string())),
        }
    }

    /// A single-character parameter (`separator`, `quote`).
    pub fn get_char(&self, key: &str) -> Result<Option<u8>> {
        match self.get_text(key) {
            None => Ok(None),
            Some(s) => {
                let bytes = s.as_bytes();
                if bytes.len() == 1 {
                    Ok(Some(bytes[0]))
                } else {
                    Err(invalid(key, "expected a single character".to_string()))
                }
            }
        }
    }

    /// Resolves the `file` parameter, prepending `base` when present.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        let file = self.required_text("file")?;
        let path = match self.get_text("base") {
            Some(base) => PathBuf::from(base).join(file),
            None => PathBuf::from(file),
        };
        Ok(path)
    }
}

fn invalid(key: &str, reason: String) -> Error {
    Error::InvalidParam {
        key: key.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_coercions() {
        let params = Params::new()
            .with("strict", "true")
            .with("row_limit", "25")
            .with("ratio", "0.55");
        assert_eq!(params.get_bool("strict").unwrap(), Some(true));
        assert_eq!(params.get_int("row_limit").unwrap(), Some(25));
        assert_eq!(params.get_float("ratio").unwrap(), Some(0.55));
        assert!(params.get_bool("missing").unwrap().is_none());
    }

    #[test]
    fn invalid_values_name_the_key() {
        let params = Params::new().with("row_limit", "lots");
        match params.get_int("row_limit") {
            Err(Error::InvalidParam { key, .. }) => assert_eq!(key, "row_limit"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn base_prepends_file() {
        let params = Params::new().with("base", "/data").with("file", "points.csv");
        assert_eq!(params.resolve_path().unwrap(), PathBuf::from("/data/points.csv"));
    }
}
