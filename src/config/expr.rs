//! `${...}` expressions inside attribute values.
//!
//! A string that is exactly one expression evaluates to the referenced
//! value with its own type. Any other string containing expressions is a
//! template and evaluates to a string. `$${` escapes a literal `${`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::address::{InstanceKey, ResourceMode};
use crate::value::{AttrPath, Value};

/// Instance key inside a reference, as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyExpr {
    /// A literal index or string key.
    Literal(InstanceKey),
    /// `count.index` of the enclosing instance.
    CountIndex,
    /// `each.key` of the enclosing instance.
    EachKey,
}

/// Reference to another resource's attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Managed resource or data source.
    pub mode: ResourceMode,
    /// Resource type.
    pub resource_type: String,
    /// Resource name.
    pub name: String,
    /// Instance key, if the reference names one instance.
    pub key: Option<KeyExpr>,
    /// Path into the referenced object; empty for the whole object.
    pub path: AttrPath,
    /// The expression as written.
    pub text: String,
}

/// One `${...}` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A resource attribute reference.
    Reference(Reference),
    /// `count.index`.
    CountIndex,
    /// `each.key`.
    EachKey,
    /// `each.value`, optionally followed by a path.
    EachValue(AttrPath),
}

/// Piece of a string template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    /// Literal text.
    Literal(String),
    /// Interpolated expression.
    Expr(Expr),
}

/// Parsed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigExpr {
    /// A plain value.
    Literal(Value),
    /// A string that is exactly one expression.
    Expr(Expr),
    /// A string mixing text and expressions.
    Template(Vec<TemplatePart>),
    /// A sequence.
    List(Vec<ConfigExpr>),
    /// A mapping.
    Object(BTreeMap<String, ConfigExpr>),
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_key(inner: &str) -> Result<KeyExpr, String> {
    let inner = inner.trim();
    match inner {
        "count.index" => Ok(KeyExpr::CountIndex),
        "each.key" => Ok(KeyExpr::EachKey),
        _ => {
            if let Some(s) = inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
                Ok(KeyExpr::Literal(InstanceKey::Str(s.to_string())))
            } else {
                inner
                    .parse::<u64>()
                    .map(|i| KeyExpr::Literal(InstanceKey::Int(i)))
                    .map_err(|_| format!("invalid instance key \"{inner}\""))
            }
        }
    }
}

fn parse_reference(text: &str) -> Result<Reference, String> {
    let (mode, rest) = text
        .strip_prefix("data.")
        .map_or((ResourceMode::Managed, text), |rest| (ResourceMode::Data, rest));

    let (resource_type, rest) = rest
        .split_once('.')
        .ok_or_else(|| String::from("expected TYPE.NAME"))?;
    if !is_identifier(resource_type) {
        return Err(format!("invalid resource type \"{resource_type}\""));
    }

    let name_end = rest.find(['.', '[']).unwrap_or(rest.len());
    let name = &rest[..name_end];
    if !is_identifier(name) {
        return Err(format!("invalid resource name \"{name}\""));
    }
    let mut rest = &rest[name_end..];

    let key = if let Some(after) = rest.strip_prefix('[') {
        let end = after
            .find(']')
            .ok_or_else(|| String::from("unterminated instance key"))?;
        let key = parse_key(&after[..end])?;
        rest = &after[end + 1..];
        Some(key)
    } else {
        None
    };

    let path = if rest.is_empty() {
        AttrPath::default()
    } else {
        rest.parse::<AttrPath>()?
    };

    Ok(Reference {
        mode,
        resource_type: resource_type.to_string(),
        name: name.to_string(),
        key,
        path,
        text: text.to_string(),
    })
}

impl FromStr for Expr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        match text {
            "" => Err(String::from("empty expression")),
            "count.index" => Ok(Self::CountIndex),
            "each.key" => Ok(Self::EachKey),
            "each.value" => Ok(Self::EachValue(AttrPath::default())),
            _ if text.starts_with("each.value") => {
                let rest = &text["each.value".len()..];
                if !rest.starts_with(['.', '[']) {
                    return Err(format!("unknown symbol \"{text}\""));
                }
                Ok(Self::EachValue(rest.parse()?))
            }
            _ if text.starts_with("count.") || text.starts_with("each.") => {
                Err(format!("unknown symbol \"{text}\""))
            }
            _ => parse_reference(text).map(Self::Reference),
        }
    }
}

/// Splits a string into literal text and `${...}` expressions.
///
/// # Errors
///
/// Returns a message for unterminated or malformed expressions.
pub fn parse_template(s: &str) -> Result<Vec<TemplatePart>, String> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = s;

    while let Some(pos) = rest.find("${") {
        if rest[..pos].ends_with('$') {
            literal.push_str(&rest[..pos - 1]);
            literal.push_str("${");
            rest = &rest[pos + 2..];
            continue;
        }
        literal.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| String::from("unterminated \"${\""))?;
        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
        }
        parts.push(TemplatePart::Expr(after[..end].parse()?));
        rest = &after[end + 1..];
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        parts.push(TemplatePart::Literal(literal));
    }
    Ok(parts)
}

impl ConfigExpr {
    /// Parses a YAML attribute value.
    ///
    /// # Errors
    ///
    /// Returns a message for the first malformed expression.
    pub fn parse(yaml: &serde_yaml::Value) -> Result<Self, String> {
        match yaml {
            serde_yaml::Value::String(s) if s.contains("${") => {
                let mut parts = parse_template(s)?;
                if parts.len() == 1 {
                    match parts.pop() {
                        Some(TemplatePart::Expr(expr)) => return Ok(Self::Expr(expr)),
                        Some(TemplatePart::Literal(text)) => return Ok(Self::Literal(Value::String(text))),
                        None => {}
                    }
                }
                Ok(Self::Template(parts))
            }
            serde_yaml::Value::Sequence(items) => {
                items.iter().map(Self::parse).collect::<Result<_, _>>().map(Self::List)
            }
            serde_yaml::Value::Mapping(mapping) => {
                let mut out = BTreeMap::new();
                for (k, v) in mapping {
                    let key = match k {
                        serde_yaml::Value::String(s) => s.clone(),
                        other => Value::from_yaml(other).render(),
                    };
                    out.insert(key, Self::parse(v)?);
                }
                Ok(Self::Object(out))
            }
            serde_yaml::Value::Tagged(tagged) => Self::parse(&tagged.value),
            other => Ok(Self::Literal(Value::from_yaml(other))),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference(r) => write!(f, "{}", r.text),
            Self::CountIndex => write!(f, "count.index"),
            Self::EachKey => write!(f, "each.key"),
            Self::EachValue(path) if path.is_empty() => write!(f, "each.value"),
            Self::EachValue(path) => write!(f, "each.value.{path}"),
        }
    }
}
