//! Planned changes for single resource instances.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

use crate::address::ResourceAddress;
use crate::provider::ObjectState;
use crate::value::{AttrPath, Attributes, Value};

/// Rendering used in place of sensitive values.
pub const SENSITIVE_MASK: &str = "(sensitive value)";

/// What the engine will do to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Nothing to do.
    NoOp,
    /// Create a new object.
    Create,
    /// Update the object in place.
    Update,
    /// Delete the object.
    Delete,
    /// Delete the object, then create a new one.
    Replace,
    /// Read a data source.
    Read,
}

/// Why an instance is being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceReason {
    /// An attribute that cannot change in place differs.
    ForcedByAttribute,
    /// The recorded instance is tainted.
    Tainted,
    /// Replacement was requested explicitly.
    Requested,
    /// The provider refused an in-place update during a previous round.
    ProviderRequested,
}

/// Before and after values of one top-level attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChange {
    /// Attribute path.
    pub path: AttrPath,
    /// Recorded value; `None` when the instance does not exist yet.
    pub before: Option<Value>,
    /// Planned value; `None` when the instance is being deleted.
    pub after: Option<Value>,
    /// The recorded value was set rather than left null.
    pub before_explicit: bool,
    /// The configuration sets this attribute, even if to null.
    pub after_explicit: bool,
    /// The planned value is only known after apply.
    pub unknown_after: bool,
    /// Values must never be displayed.
    pub sensitive: bool,
    /// A difference here forces replacement.
    pub forces_replacement: bool,
}

/// The computed change for one instance.
#[derive(Debug, Clone, Serialize)]
pub struct Change {
    /// Target instance.
    pub address: ResourceAddress,
    /// Provider that owns the instance.
    pub provider: String,
    /// Required action.
    pub action: Action,
    /// Why a replacement is planned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_reason: Option<ReplaceReason>,
    /// Per-attribute changes, sorted by path.
    pub attributes: Vec<AttributeChange>,
    /// Paths whose difference forces replacement.
    pub replace_paths: BTreeSet<AttrPath>,
    /// Sensitive attribute paths of the planned object.
    #[serde(skip)]
    pub sensitive_paths: BTreeSet<AttrPath>,
    /// Recorded object.
    #[serde(skip)]
    pub before: Option<ObjectState>,
    /// Planned attributes, possibly holding unknown values.
    #[serde(skip)]
    pub after: Option<Attributes>,
    /// Instances this one must wait for.
    #[serde(skip)]
    pub depends_on: BTreeSet<ResourceAddress>,
    /// Dependencies recorded in state when the instance was last applied.
    #[serde(skip)]
    pub recorded_dependencies: Vec<ResourceAddress>,
    /// Schema version the planned object follows.
    #[serde(skip)]
    pub schema_version: u64,
}

impl Action {
    /// Returns true if applying the action touches the provider.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Returns true if the action removes the current object.
    #[must_use]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Delete | Self::Replace)
    }

    /// Plan symbol.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::NoOp => " ",
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::Replace => "-/+",
            Self::Read => "<=",
        }
    }
}

impl AttributeChange {
    /// Returns true if the attribute will change.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.unknown_after || self.before != self.after
    }

    fn render(&self, value: Option<&Value>) -> Option<String> {
        value.map(|v| {
            if self.sensitive && !v.is_unknown() && !v.is_null() {
                String::from(SENSITIVE_MASK)
            } else {
                v.render()
            }
        })
    }

    /// Displayable recorded value.
    #[must_use]
    pub fn render_before(&self) -> Option<String> {
        self.render(self.before.as_ref())
    }

    /// Displayable planned value.
    #[must_use]
    pub fn render_after(&self) -> Option<String> {
        self.render(self.after.as_ref())
    }
}

impl Serialize for AttributeChange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("AttributeChange", 7)?;
        s.serialize_field("path", &self.path)?;
        s.serialize_field("before", &self.render_before())?;
        s.serialize_field("after", &self.render_after())?;
        s.serialize_field("after_explicit", &self.after_explicit)?;
        s.serialize_field("unknown_after", &self.unknown_after)?;
        s.serialize_field("sensitive", &self.sensitive)?;
        s.serialize_field("forces_replacement", &self.forces_replacement)?;
        s.end()
    }
}

impl Change {
    /// A change that leaves a recorded instance alone.
    #[must_use]
    pub fn no_op(address: ResourceAddress, provider: impl Into<String>, prior: ObjectState) -> Self {
        Self {
            address,
            provider: provider.into(),
            action: Action::NoOp,
            replace_reason: None,
            attributes: Vec::new(),
            replace_paths: BTreeSet::new(),
            sensitive_paths: BTreeSet::new(),
            after: Some(prior.attributes.clone()),
            before: Some(prior),
            depends_on: BTreeSet::new(),
            recorded_dependencies: Vec::new(),
            schema_version: 0,
        }
    }

    /// Attribute changes that actually differ.
    pub fn changed_attributes(&self) -> impl Iterator<Item = &AttributeChange> {
        self.attributes.iter().filter(|a| a.is_changed())
    }

    /// Attributes planned as unknown.
    #[must_use]
    pub fn unknown_after(&self) -> Vec<&AttrPath> {
        self.attributes
            .iter()
            .filter(|a| a.unknown_after)
            .map(|a| &a.path)
            .collect()
    }

    /// Planned object value for reference lookups.
    #[must_use]
    pub fn planned_value(&self) -> Option<Value> {
        self.after.clone().map(Value::Object)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoOp => "no-op",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Read => "read",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ReplaceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ForcedByAttribute => "an attribute forces replacement",
            Self::Tainted => "instance is tainted",
            Self::Requested => "replacement was requested",
            Self::ProviderRequested => "provider cannot update in place",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action.symbol(), self.address)?;
        if let Some(reason) = self.replace_reason {
            write!(f, " ({reason})")?;
        }
        for attr in self.changed_attributes() {
            let before = attr.render_before().unwrap_or_else(|| String::from("null"));
            let after = attr.render_after().unwrap_or_else(|| String::from("null"));
            write!(f, "\n    {}: {before} -> {after}", attr.path)?;
            if attr.forces_replacement {
                write!(f, " # forces replacement")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_rendering_is_masked() {
        let change = AttributeChange {
            path: AttrPath::attr("password"),
            before: Some(Value::string("hunter2")),
            after: Some(Value::string("correct horse")),
            before_explicit: true,
            after_explicit: true,
            unknown_after: false,
            sensitive: true,
            forces_replacement: false,
        };
        assert!(change.is_changed());
        assert_eq!(change.render_before().as_deref(), Some(SENSITIVE_MASK));
        assert_eq!(change.render_after().as_deref(), Some(SENSITIVE_MASK));

        let json = serde_json::to_string(&change).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("correct horse"));
    }

    #[test]
    fn test_action_classification() {
        assert!(!Action::NoOp.is_change());
        assert!(Action::Read.is_change());
        assert!(Action::Replace.is_destructive());
        assert!(!Action::Update.is_destructive());
        assert_eq!(Action::Replace.to_string(), "replace");
    }
}
