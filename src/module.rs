//! Structured module data read by conditions.
//!
//! A module is an external collaborator that, for each scanned buffer,
//! exposes a read-only value tree under its import name. Conditions reach
//! into it with dotted, indexed and call syntax (`pe.sections[0].name`,
//! `tests.lowercase("A")`). The evaluator only ever reads these trees.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A host function callable from conditions.
#[derive(Clone)]
pub struct ModuleFunction(Arc<dyn Fn(&[ModuleValue]) -> ModuleValue + Send + Sync>);

impl ModuleFunction {
    pub fn new(f: impl Fn(&[ModuleValue]) -> ModuleValue + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, args: &[ModuleValue]) -> ModuleValue {
        (self.0)(args)
    }
}

impl fmt::Debug for ModuleFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ModuleFunction")
    }
}

/// One node of a module's value tree.
///
/// # Examples
///
/// ```rust
/// use yara_engine::ModuleValue;
///
/// let value = ModuleValue::from(serde_json::json!({
///     "number_of_sections": 3,
///     "sections": [{"name": ".text"}],
/// }));
/// assert_eq!(value.field("number_of_sections").and_then(|v| v.as_integer()), Some(3));
/// let name = value.field("sections").and_then(|v| v.index(0)).and_then(|v| v.field("name"));
/// assert_eq!(name.and_then(|v| v.as_bytes()), Some(&b".text"[..]));
/// ```
#[derive(Debug, Clone, Default)]
pub enum ModuleValue {
    Integer(i64),
    Float(f64),
    String(Vec<u8>),
    Array(Vec<ModuleValue>),
    /// String-keyed map; iterated as key/value pairs.
    Dictionary(BTreeMap<String, ModuleValue>),
    /// Fixed set of named fields.
    Struct(BTreeMap<String, ModuleValue>),
    Function(ModuleFunction),
    #[default]
    Undefined,
}

impl ModuleValue {
    /// Named member of a struct, or a dictionary entry.
    pub fn field(&self, name: &str) -> Option<&ModuleValue> {
        match self {
            ModuleValue::Struct(fields) | ModuleValue::Dictionary(fields) => fields.get(name),
            _ => None,
        }
    }

    /// Array element, zero-based.
    pub fn index(&self, index: usize) -> Option<&ModuleValue> {
        match self {
            ModuleValue::Array(items) => items.get(index),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ModuleValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ModuleValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, ModuleValue::Undefined)
    }

    /// Turn the struct at a dotted `path` into a dictionary, so conditions
    /// can index it by key and iterate it as key/value pairs. Arrays on the
    /// way are descended element by element; an empty path converts `self`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use yara_engine::ModuleValue;
    ///
    /// let pe = ModuleValue::from(serde_json::json!({
    ///     "exports": {"ReadFile": 2},
    ///     "sections": [{"flags": {"exec": 1}}],
    /// }))
    /// .dictionary_at("exports")
    /// .dictionary_at("sections.flags");
    /// assert!(matches!(pe.field("exports"), Some(ModuleValue::Dictionary(_))));
    /// let flags = pe.field("sections").and_then(|s| s.index(0)).and_then(|s| s.field("flags"));
    /// assert!(matches!(flags, Some(ModuleValue::Dictionary(_))));
    /// ```
    pub fn dictionary_at(mut self, path: &str) -> Self {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        convert_to_dictionary(&mut self, &segments);
        self
    }

    /// Build a struct from `(name, value)` pairs.
    pub fn structure<K: Into<String>>(fields: impl IntoIterator<Item = (K, ModuleValue)>) -> Self {
        ModuleValue::Struct(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<i64> for ModuleValue {
    fn from(value: i64) -> Self {
        ModuleValue::Integer(value)
    }
}

impl From<f64> for ModuleValue {
    fn from(value: f64) -> Self {
        ModuleValue::Float(value)
    }
}

impl From<&str> for ModuleValue {
    fn from(value: &str) -> Self {
        ModuleValue::String(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for ModuleValue {
    fn from(value: Vec<u8>) -> Self {
        ModuleValue::String(value)
    }
}

impl From<ModuleFunction> for ModuleValue {
    fn from(value: ModuleFunction) -> Self {
        ModuleValue::Function(value)
    }
}

fn convert_to_dictionary(value: &mut ModuleValue, path: &[&str]) {
    if let ModuleValue::Array(items) = value {
        for item in items {
            convert_to_dictionary(item, path);
        }
        return;
    }
    match path.split_first() {
        None => {
            if let ModuleValue::Struct(fields) = value {
                let fields = std::mem::take(fields);
                *value = ModuleValue::Dictionary(fields);
            }
        }
        Some((name, rest)) => {
            if let ModuleValue::Struct(fields) | ModuleValue::Dictionary(fields) = value {
                if let Some(child) = fields.get_mut(*name) {
                    convert_to_dictionary(child, rest);
                }
            }
        }
    }
}

/// JSON objects become structs, booleans become `0`/`1` and `null` is
/// undefined. Use [`ModuleValue::dictionary_at`] for objects that are keyed
/// maps rather than fixed fields.
impl From<serde_json::Value> for ModuleValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => ModuleValue::Undefined,
            Value::Bool(b) => ModuleValue::Integer(i64::from(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ModuleValue::Integer(i),
                None => n.as_f64().map_or(ModuleValue::Undefined, ModuleValue::Float),
            },
            Value::String(s) => ModuleValue::String(s.into_bytes()),
            Value::Array(items) => {
                ModuleValue::Array(items.into_iter().map(ModuleValue::from).collect())
            }
            Value::Object(map) => {
                ModuleValue::Struct(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Supplies module data for each scanned buffer.
///
/// `load` is called once per imported module per scan; returning `None`
/// leaves every access into the module undefined.
pub trait ModuleProvider: Send + Sync {
    fn load(&self, module: &str, data: &[u8]) -> Option<ModuleValue>;
}

impl<F> ModuleProvider for F
where
    F: Fn(&str, &[u8]) -> Option<ModuleValue> + Send + Sync,
{
    fn load(&self, module: &str, data: &[u8]) -> Option<ModuleValue> {
        self(module, data)
    }
}

/// The same value tree for every buffer.
#[derive(Debug, Clone, Default)]
pub struct StaticModules {
    modules: HashMap<String, ModuleValue>,
}

impl StaticModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, name: impl Into<String>, value: impl Into<ModuleValue>) -> Self {
        self.modules.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ModuleValue>) {
        self.modules.insert(name.into(), value.into());
    }
}

impl ModuleProvider for StaticModules {
    fn load(&self, module: &str, _data: &[u8]) -> Option<ModuleValue> {
        self.modules.get(module).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json() {
        let value = ModuleValue::from(json!({
            "flag": true,
            "ratio": 0.5,
            "missing": null,
            "list": [1, 2],
        }));
        assert_eq!(value.field("flag").and_then(ModuleValue::as_integer), Some(1));
        assert!(matches!(value.field("ratio"), Some(ModuleValue::Float(f)) if *f == 0.5));
        assert!(value.field("missing").is_some_and(ModuleValue::is_undefined));
        assert_eq!(
            value.field("list").and_then(|l| l.index(1)).and_then(ModuleValue::as_integer),
            Some(2)
        );
        assert!(value.field("list").and_then(|l| l.index(2)).is_none());
    }

    #[test]
    fn test_dictionary_at() {
        let value = ModuleValue::from(json!({
            "exports": {"ReadFile": 2},
            "nested": {"inner": {"k": 1}},
            "sections": [{"flags": {"exec": 1}}, {"flags": {}}],
        }))
        .dictionary_at("exports")
        .dictionary_at("nested.inner")
        .dictionary_at("sections.flags")
        .dictionary_at("missing.path");

        assert!(matches!(value, ModuleValue::Struct(_)));
        assert!(matches!(value.field("exports"), Some(ModuleValue::Dictionary(m)) if m.len() == 1));
        assert!(matches!(value.field("nested"), Some(ModuleValue::Struct(_))));
        assert!(matches!(
            value.field("nested").and_then(|n| n.field("inner")),
            Some(ModuleValue::Dictionary(_))
        ));
        let sections = value.field("sections").unwrap();
        for i in 0..2 {
            assert!(matches!(
                sections.index(i).and_then(|s| s.field("flags")),
                Some(ModuleValue::Dictionary(_))
            ));
        }
        assert!(matches!(
            ModuleValue::from(json!({"k": 1})).dictionary_at(""),
            ModuleValue::Dictionary(_)
        ));
    }

    #[test]
    fn test_function_call() {
        let upper = ModuleFunction::new(|args| match args {
            [ModuleValue::String(s)] => ModuleValue::String(s.to_ascii_uppercase()),
            _ => ModuleValue::Undefined,
        });
        let result = upper.call(&[ModuleValue::from("abc")]);
        assert_eq!(result.as_bytes(), Some(&b"ABC"[..]));
        assert!(upper.call(&[]).is_undefined());
    }

    #[test]
    fn test_static_modules() {
        let modules = StaticModules::new().with_module("tests", json!({"constant": 7}));
        let loaded = modules.load("tests", b"").unwrap();
        assert_eq!(loaded.field("constant").and_then(ModuleValue::as_integer), Some(7));
        assert!(modules.load("pe", b"").is_none());
    }

    #[test]
    fn test_closure_provider() {
        let provider = |module: &str, data: &[u8]| {
            (module == "size").then(|| ModuleValue::Integer(data.len() as i64))
        };
        assert_eq!(
            provider.load("size", b"abcd").and_then(|v| v.as_integer()),
            Some(4)
        );
    }
}
