//! Attribute values exchanged between configuration, state and providers.
//!
//! Every attribute is a [`Value`]: a tagged variant that can be matched
//! exhaustively, including the two states a plan cares about beyond plain
//! data, `Null` and `Unknown`.

mod path;

pub use path::{AttrPath, PathStep};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An object-shaped attribute map, keyed by attribute name.
pub type Attributes = BTreeMap<String, Value>;

/// Type descriptor for attribute values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "of", rename_all = "snake_case")]
pub enum ValueType {
    /// Any type; decided by the value itself.
    Dynamic,
    /// Boolean.
    Bool,
    /// Number (64-bit float).
    Number,
    /// UTF-8 string.
    String,
    /// Ordered list of one element type.
    List(Box<ValueType>),
    /// Unordered set of one element type.
    Set(Box<ValueType>),
    /// String-keyed map of one element type.
    Map(Box<ValueType>),
    /// Object with a fixed set of named attributes.
    Object(BTreeMap<String, ValueType>),
}

/// A single attribute value.
///
/// Sets compare by content: two sets holding the same elements in a
/// different order are equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Explicitly absent.
    Null,
    /// Only known after the change is applied.
    Unknown(ValueType),
    /// Boolean.
    Bool(bool),
    /// Number.
    Number(f64),
    /// String.
    String(String),
    /// Ordered list.
    List(Vec<Value>),
    /// Unordered set (deduplicated).
    Set(Vec<Value>),
    /// String-keyed map.
    Map(BTreeMap<String, Value>),
    /// Object with named attributes.
    Object(BTreeMap<String, Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Unknown(a), Self::Unknown(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a.to_bits() == b.to_bits() || a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Set(a), Self::Set(b)) => set_eq(a, b),
            (Self::Map(a), Self::Map(b)) | (Self::Object(a), Self::Object(b)) => a == b,
            _ => false,
        }
    }
}

fn set_eq(a: &[Value], b: &[Value]) -> bool {
    a.iter().all(|x| b.contains(x)) && b.iter().all(|y| a.contains(y))
}

impl Value {
    /// Builds a set, dropping duplicate elements.
    #[must_use]
    pub fn set(items: impl IntoIterator<Item = Self>) -> Self {
        let mut out: Vec<Self> = Vec::new();
        for item in items {
            if !out.contains(&item) {
                out.push(item);
            }
        }
        Self::Set(out)
    }

    /// Builds a string value.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Builds an unknown value of dynamic type.
    #[must_use]
    pub const fn unknown() -> Self {
        Self::Unknown(ValueType::Dynamic)
    }

    /// Returns true for `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true if this value itself is `Unknown`.
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }

    /// Returns true if this value or any nested element is `Unknown`.
    #[must_use]
    pub fn contains_unknown(&self) -> bool {
        match self {
            Self::Unknown(_) => true,
            Self::List(items) | Self::Set(items) => items.iter().any(Self::contains_unknown),
            Self::Map(entries) | Self::Object(entries) => entries.values().any(Self::contains_unknown),
            Self::Null | Self::Bool(_) | Self::Number(_) | Self::String(_) => false,
        }
    }

    /// Returns the string slice if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean if this is a bool.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the number if this is a number.
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Short name of the variant, for diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Unknown(_) => "unknown",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
            Self::Object(_) => "object",
        }
    }

    /// Looks up a nested value by path.
    #[must_use]
    pub fn get_path(&self, path: &AttrPath) -> Option<&Self> {
        let mut current = self;
        for step in path.steps() {
            current = match (step, current) {
                (PathStep::Attr(name) | PathStep::Key(name), Self::Object(m) | Self::Map(m)) => m.get(name)?,
                (PathStep::Index(i), Self::List(items) | Self::Set(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Converts a YAML value into an untyped attribute value.
    ///
    /// Sequences become lists and mappings become objects; [`Value::coerce`]
    /// narrows them once a schema type is known.
    #[must_use]
    pub fn from_yaml(yaml: &serde_yaml::Value) -> Self {
        match yaml {
            serde_yaml::Value::Null => Self::Null,
            serde_yaml::Value::Bool(b) => Self::Bool(*b),
            serde_yaml::Value::Number(n) => n.as_f64().map_or(Self::Null, Self::Number),
            serde_yaml::Value::String(s) => Self::String(s.clone()),
            serde_yaml::Value::Sequence(items) => Self::List(items.iter().map(Self::from_yaml).collect()),
            serde_yaml::Value::Mapping(mapping) => Self::Object(
                mapping
                    .iter()
                    .map(|(k, v)| (yaml_key(k), Self::from_yaml(v)))
                    .collect(),
            ),
            serde_yaml::Value::Tagged(tagged) => Self::from_yaml(&tagged.value),
        }
    }

    /// Converts the value to the shape described by `ty`.
    ///
    /// `Null` and `Unknown` pass through (an untyped unknown takes the
    /// target type).
    ///
    /// # Errors
    ///
    /// Returns a description of the mismatch when the value cannot take
    /// the requested type.
    pub fn coerce(self, ty: &ValueType) -> Result<Self, String> {
        match (self, ty) {
            (Self::Null, _) => Ok(Self::Null),
            (Self::Unknown(ValueType::Dynamic), ValueType::Dynamic) => Ok(Self::unknown()),
            (Self::Unknown(ValueType::Dynamic), target) => Ok(Self::Unknown(target.clone())),
            (Self::Unknown(inner), _) => Ok(Self::Unknown(inner)),
            (value, ValueType::Dynamic) => Ok(value),
            (Self::Bool(b), ValueType::Bool) => Ok(Self::Bool(b)),
            (Self::String(s), ValueType::Bool) => match s.as_str() {
                "true" => Ok(Self::Bool(true)),
                "false" => Ok(Self::Bool(false)),
                _ => Err(format!("cannot convert \"{s}\" to bool")),
            },
            (Self::Number(n), ValueType::Number) => Ok(Self::Number(n)),
            (Self::String(s), ValueType::Number) => s
                .parse::<f64>()
                .map(Self::Number)
                .map_err(|_| format!("cannot convert \"{s}\" to number")),
            (Self::String(s), ValueType::String) => Ok(Self::String(s)),
            (Self::Number(n), ValueType::String) => Ok(Self::String(format_number(n))),
            (Self::Bool(b), ValueType::String) => Ok(Self::String(b.to_string())),
            (Self::List(items) | Self::Set(items), ValueType::List(elem)) => items
                .into_iter()
                .map(|v| v.coerce(elem))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            (Self::List(items) | Self::Set(items), ValueType::Set(elem)) => items
                .into_iter()
                .map(|v| v.coerce(elem))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::set),
            (Self::Map(entries) | Self::Object(entries), ValueType::Map(elem)) => entries
                .into_iter()
                .map(|(k, v)| v.coerce(elem).map(|v| (k, v)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Self::Map),
            (Self::Map(mut entries) | Self::Object(mut entries), ValueType::Object(fields)) => {
                let mut out = BTreeMap::new();
                for (name, field_ty) in fields {
                    let value = entries.remove(name).unwrap_or(Self::Null);
                    out.insert(name.clone(), value.coerce(field_ty)?);
                }
                if let Some(extra) = entries.keys().next() {
                    return Err(format!("unexpected attribute \"{extra}\""));
                }
                Ok(Self::Object(out))
            }
            (value, target) => Err(format!("expected {}, found {}", target, value.kind())),
        }
    }

    /// Renders the value for display. Unknown values render as
    /// `(known after apply)`.
    #[must_use]
    pub fn render(&self) -> String {
        self.to_string()
    }
}

fn yaml_key(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Formats a number without a trailing `.0` for integral values.
#[must_use]
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dynamic => write!(f, "any"),
            Self::Bool => write!(f, "bool"),
            Self::Number => write!(f, "number"),
            Self::String => write!(f, "string"),
            Self::List(elem) => write!(f, "list({elem})"),
            Self::Set(elem) => write!(f, "set({elem})"),
            Self::Map(elem) => write!(f, "map({elem})"),
            Self::Object(_) => write!(f, "object"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Unknown(_) => write!(f, "(known after apply)"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{}", format_number(*n)),
            Self::String(s) => write!(f, "{s:?}"),
            Self::List(items) | Self::Set(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(entries) | Self::Object(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} = {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_equality_ignores_order() {
        let a = Value::set(vec![Value::from("a"), Value::from("b")]);
        let b = Value::set(vec![Value::from("b"), Value::from("a")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_list_equality_is_positional() {
        let a = Value::List(vec![Value::from("a"), Value::from("b")]);
        let b = Value::List(vec![Value::from("b"), Value::from("a")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_set_deduplicates() {
        let s = Value::set(vec![Value::from("x"), Value::from("x")]);
        assert!(matches!(s, Value::Set(ref items) if items.len() == 1));
    }

    #[test]
    fn test_contains_unknown_nested() {
        let mut obj = BTreeMap::new();
        obj.insert("inner".to_string(), Value::List(vec![Value::unknown()]));
        assert!(Value::Object(obj).contains_unknown());
        assert!(!Value::from("known").contains_unknown());
    }

    #[test]
    fn test_coerce_list_to_set() {
        let v = Value::List(vec![Value::from("b"), Value::from("a"), Value::from("b")]);
        let coerced = v.coerce(&ValueType::Set(Box::new(ValueType::String))).unwrap();
        assert_eq!(coerced, Value::set(vec![Value::from("a"), Value::from("b")]));
    }

    #[test]
    fn test_coerce_rejects_mismatch() {
        let v = Value::List(vec![]);
        assert!(v.coerce(&ValueType::Bool).is_err());
    }

    #[test]
    fn test_unknown_takes_target_type() {
        let v = Value::unknown().coerce(&ValueType::String).unwrap();
        assert_eq!(v, Value::Unknown(ValueType::String));
    }

    #[test]
    fn test_from_yaml_mapping() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("a: 1\nb: [x, y]").unwrap();
        let v = Value::from_yaml(&yaml);
        let path: AttrPath = "b[1]".parse().unwrap();
        assert_eq!(v.get_path(&path), Some(&Value::from("y")));
    }

    #[test]
    fn test_serde_keeps_unknown_marker() {
        let v = Value::Unknown(ValueType::List(Box::new(ValueType::String)));
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn test_render() {
        assert_eq!(Value::Number(3.0).render(), "3");
        assert_eq!(Value::unknown().render(), "(known after apply)");
        assert_eq!(Value::from("hi").render(), "\"hi\"");
    }
}
