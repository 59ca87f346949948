//! Attribute paths such as `rule[0].ports` or `tags["env"]`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One step of an attribute path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathStep {
    /// Named attribute or nested block.
    Attr(String),
    /// Position in a list.
    Index(usize),
    /// Key in a map.
    Key(String),
}

/// Path from the root of a resource object to a nested attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttrPath(Vec<PathStep>);

impl AttrPath {
    /// Path to a top-level attribute.
    #[must_use]
    pub fn attr(name: impl Into<String>) -> Self {
        Self(vec![PathStep::Attr(name.into())])
    }

    /// Returns a new path with an attribute step appended.
    #[must_use]
    pub fn join_attr(&self, name: impl Into<String>) -> Self {
        let mut steps = self.0.clone();
        steps.push(PathStep::Attr(name.into()));
        Self(steps)
    }

    /// Returns a new path with an index step appended.
    #[must_use]
    pub fn join_index(&self, index: usize) -> Self {
        let mut steps = self.0.clone();
        steps.push(PathStep::Index(index));
        Self(steps)
    }

    /// Returns a new path with a key step appended.
    #[must_use]
    pub fn join_key(&self, key: impl Into<String>) -> Self {
        let mut steps = self.0.clone();
        steps.push(PathStep::Key(key.into()));
        Self(steps)
    }

    /// The steps of this path.
    #[must_use]
    pub fn steps(&self) -> &[PathStep] {
        &self.0
    }

    /// The top-level attribute name, if the path starts with one.
    #[must_use]
    pub fn root(&self) -> Option<&str> {
        match self.0.first() {
            Some(PathStep::Attr(name)) => Some(name),
            _ => None,
        }
    }

    /// Returns true if `self` equals `other` or is an ancestor of it.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Returns true if the path has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            match step {
                PathStep::Attr(name) if i == 0 => write!(f, "{name}")?,
                PathStep::Attr(name) => write!(f, ".{name}")?,
                PathStep::Index(idx) => write!(f, "[{idx}]")?,
                PathStep::Key(key) => write!(f, "[{key:?}]")?,
            }
        }
        Ok(())
    }
}

impl FromStr for AttrPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut steps = Vec::new();
        let mut rest = s.trim();

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('[') {
                let end = after
                    .find(']')
                    .ok_or_else(|| format!("unterminated index in path: {s}"))?;
                let inner = &after[..end];
                if let Some(key) = inner.strip_prefix('"').and_then(|k| k.strip_suffix('"')) {
                    steps.push(PathStep::Key(key.to_string()));
                } else {
                    let idx = inner
                        .parse::<usize>()
                        .map_err(|_| format!("invalid index \"{inner}\" in path: {s}"))?;
                    steps.push(PathStep::Index(idx));
                }
                rest = &after[end + 1..];
            } else {
                let body = rest.strip_prefix('.').unwrap_or(rest);
                let end = body.find(['.', '[']).unwrap_or(body.len());
                let name = &body[..end];
                if name.is_empty() {
                    return Err(format!("empty attribute name in path: {s}"));
                }
                steps.push(PathStep::Attr(name.to_string()));
                rest = &body[end..];
            }
        }

        Ok(Self(steps))
    }
}

impl TryFrom<String> for AttrPath {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AttrPath> for String {
    fn from(path: AttrPath) -> Self {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path: AttrPath = "rule[0].ports[\"http\"]".parse().unwrap();
        assert_eq!(path.steps().len(), 4);
        assert_eq!(path.to_string(), "rule[0].ports[\"http\"]");
        assert_eq!(path.root(), Some("rule"));
    }

    #[test]
    fn test_prefix() {
        let parent = AttrPath::attr("rule");
        let child = parent.join_index(2).join_attr("port");
        assert!(parent.is_prefix_of(&child));
        assert!(!child.is_prefix_of(&parent));
    }

    #[test]
    fn test_parse_errors() {
        assert!("a[".parse::<AttrPath>().is_err());
        assert!("a[x]".parse::<AttrPath>().is_err());
        assert!("a..b".parse::<AttrPath>().is_err());
    }
}
