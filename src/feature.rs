use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::geometry::Geometry;

/// Attribute value. Values are immutable once stored on a feature.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Declared type of an attribute column, as reported by descriptors and used
/// by the CSV type inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Bool,
    Integer,
    Double,
    Text,
}

/// Ordered attribute-name list shared by every feature a datasource emits.
/// Features store values keyed by index into this schema.
#[derive(Debug, Default)]
pub struct Context {
    names: Vec<String>,
    lookup: HashMap<String, usize>,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ctx = Context::new();
        for name in names {
            ctx.push(name.into());
        }
        ctx
    }

    /// Registers a name, returning its index. Pushing an existing name
    /// returns the original index.
    pub fn push(&mut self, name: impl Into<String>) -> usize {
        let name = name.into();
        if let Some(&index) = self.lookup.get(&name) {
            return index;
        }
        let index = self.names.len();
        self.lookup.insert(name.clone(), index);
        self.names.push(name);
        index
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.lookup.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(|s| s.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|s| s.as_str())
    }
}

/// One attributed record: 1-based id, shared schema, per-index values, and a
/// geometry. Ids are assigned in source order by the emitting backend.
#[derive(Debug, Clone)]
pub struct Feature {
    id: u64,
    ctx: Arc<Context>,
    values: Vec<Option<Value>>,
    pub geometry: Geometry,
}

impl Feature {
    pub fn new(id: u64, ctx: Arc<Context>) -> Self {
        let len = ctx.len();
        Feature {
            id,
            ctx,
            values: vec![None; len],
            geometry: Geometry::Empty,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn envelope(&self) -> crate::envelope::Envelope<f64> {
        self.geometry.envelope()
    }

    /// Stores a value by name. Unknown names extend the schema only while
    /// this feature holds the sole reference to it; a shared context is
    /// frozen and the put fails.
    pub fn put(&mut self, name: &str, value: Value) -> Result<()> {
        let index = match self.ctx.lookup(name) {
            Some(index) => index,
            None => match Arc::get_mut(&mut self.ctx) {
                Some(ctx) => ctx.push(name),
                None => return Err(Error::UnknownAttribute(name.to_string())),
            },
        };
        self.put_by_index(index, value);
        Ok(())
    }

    pub fn put_by_index(&mut self, index: usize, value: Value) {
        if index >= self.values.len() {
            self.values.resize(index + 1, None);
        }
        self.values[index] = Some(value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.ctx.lookup(name).and_then(|index| self.get_by_index(index))
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index).and_then(|slot| slot.as_ref())
    }

    pub fn has_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set attributes in schema order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref()
                .and_then(|value| self.ctx.name(index).map(|name| (name, value)))
        })
    }
}

/// Decodes attribute bytes according to the datasource's `encoding`
/// parameter. UTF-8 is the default; Latin-1 covers the DBF files in the
/// wild; anything else falls back to lossy UTF-8 with a warning.
pub fn decode_text(bytes: &[u8], encoding: &str) -> String {
    match encoding.to_ascii_lowercase().as_str() {
        "" | "utf8" | "utf-8" => String::from_utf8_lossy(bytes).into_owned(),
        "latin1" | "latin-1" | "iso-8859-1" => bytes.iter().map(|&b| b as char).collect(),
        other => {
            log::warn!("unsupported encoding '{other}', decoding as utf-8");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_push_dedupes() {
        let mut ctx = Context::new();
        assert_eq!(ctx.push("name"), 0);
        assert_eq!(ctx.push("value"), 1);
        assert_eq!(ctx.push("name"), 0);
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.lookup("value"), Some(1));
        assert_eq!(ctx.lookup("missing"), None);
    }

    #[test]
    fn put_fails_on_shared_context() {
        let ctx = Arc::new(Context::from_names(["a"]));
        let _other = ctx.clone();
        let mut feature = Feature::new(1, ctx);
        feature.put("a", Value::Integer(1)).unwrap();
        assert!(matches!(
            feature.put("b", Value::Integer(2)),
            Err(Error::UnknownAttribute(_))
        ));
    }

    #[test]
    fn put_extends_unshared_context() {
        let mut feature = Feature::new(1, Arc::new(Context::new()));
        feature.put("fresh", Value::Text("x".into())).unwrap();
        assert_eq!(feature.get("fresh"), Some(&Value::Text("x".into())));
    }

    #[test]
    fn iteration_is_schema_order() {
        let ctx = Arc::new(Context::from_names(["b", "a", "c"]));
        let mut feature = Feature::new(1, ctx);
        feature.put_by_index(2, Value::Integer(3));
        feature.put_by_index(0, Value::Integer(1));
        let keys: Vec<_> = feature.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn latin1_decoding() {
        assert_eq!(decode_text(&[0x63, 0x61, 0x66, 0xe9], "latin1"), "café");
    }
}
