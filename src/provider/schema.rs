//! Provider schemas.
//!
//! A schema describes the attributes and nested blocks of one resource or
//! data source type. The diff engine walks it to decide which attributes
//! are computed, which force replacement and which are sensitive.

use std::collections::BTreeMap;

use crate::value::{AttrPath, Attributes, PathStep, Value, ValueType};

/// Schema of everything one provider offers.
#[derive(Debug, Clone, Default)]
pub struct ProviderSchema {
    /// Managed resource types.
    pub resources: BTreeMap<String, ResourceSchema>,
    /// Data source types.
    pub data_sources: BTreeMap<String, ResourceSchema>,
    /// The provider requires its operations to run one at a time.
    pub serialize_operations: bool,
}

/// Schema of one resource or data source type.
#[derive(Debug, Clone, Default)]
pub struct ResourceSchema {
    /// Schema version recorded alongside each instance.
    pub version: u64,
    /// Root block.
    pub block: BlockSchema,
}

/// A block: attributes plus nested blocks.
#[derive(Debug, Clone, Default)]
pub struct BlockSchema {
    /// Attributes by name.
    pub attributes: BTreeMap<String, AttributeSchema>,
    /// Nested blocks by name.
    pub blocks: BTreeMap<String, NestedBlockSchema>,
}

/// Schema of a single attribute.
#[derive(Debug, Clone)]
pub struct AttributeSchema {
    /// Value type.
    pub ty: ValueType,
    /// Must be set in configuration.
    pub required: bool,
    /// May be set in configuration.
    pub optional: bool,
    /// Provider fills the value when configuration leaves it unset.
    pub computed: bool,
    /// Changing the value cannot be done in place.
    pub force_new: bool,
    /// Value must never be displayed.
    pub sensitive: bool,
    /// Value used when configuration leaves it unset.
    pub default: Option<Value>,
    /// Sibling attributes whose change makes this computed value unknown
    /// until the update is applied.
    pub invalidated_by: Vec<String>,
}

/// How a nested block repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nesting {
    /// At most one block.
    Single,
    /// Ordered blocks.
    List,
    /// Unordered blocks.
    Set,
    /// Blocks keyed by label.
    Map,
}

/// Schema of a nested block.
#[derive(Debug, Clone)]
pub struct NestedBlockSchema {
    /// Cardinality.
    pub nesting: Nesting,
    /// The nested block body.
    pub block: BlockSchema,
    /// Minimum number of blocks.
    pub min_items: usize,
    /// Maximum number of blocks.
    pub max_items: Option<usize>,
}

impl ProviderSchema {
    /// Creates an empty provider schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a managed resource type.
    #[must_use]
    pub fn with_resource(mut self, name: impl Into<String>, schema: ResourceSchema) -> Self {
        self.resources.insert(name.into(), schema);
        self
    }

    /// Adds a data source type.
    #[must_use]
    pub fn with_data_source(mut self, name: impl Into<String>, schema: ResourceSchema) -> Self {
        self.data_sources.insert(name.into(), schema);
        self
    }

    /// Declares that operations of this provider must not overlap.
    #[must_use]
    pub const fn serialized(mut self) -> Self {
        self.serialize_operations = true;
        self
    }
}

impl ResourceSchema {
    /// Creates a version 0 schema from a root block.
    #[must_use]
    pub const fn new(block: BlockSchema) -> Self {
        Self { version: 0, block }
    }

    /// Sets the schema version.
    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }
}

impl AttributeSchema {
    const fn base(ty: ValueType) -> Self {
        Self {
            ty,
            required: false,
            optional: false,
            computed: false,
            force_new: false,
            sensitive: false,
            default: None,
            invalidated_by: Vec::new(),
        }
    }

    /// A required attribute.
    #[must_use]
    pub fn required(ty: ValueType) -> Self {
        Self {
            required: true,
            ..Self::base(ty)
        }
    }

    /// An optional attribute.
    #[must_use]
    pub fn optional(ty: ValueType) -> Self {
        Self {
            optional: true,
            ..Self::base(ty)
        }
    }

    /// A read-only attribute set by the provider.
    #[must_use]
    pub fn computed(ty: ValueType) -> Self {
        Self {
            computed: true,
            ..Self::base(ty)
        }
    }

    /// An attribute that may be configured and is otherwise computed.
    #[must_use]
    pub fn optional_computed(ty: ValueType) -> Self {
        Self {
            optional: true,
            computed: true,
            ..Self::base(ty)
        }
    }

    /// Marks the attribute as forcing replacement when changed.
    #[must_use]
    pub const fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Marks the attribute as sensitive.
    #[must_use]
    pub const fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Sets a default value.
    #[must_use]
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Marks the computed value as stale whenever one of `attributes` changes.
    #[must_use]
    pub fn invalidated_by(mut self, attributes: &[&str]) -> Self {
        self.invalidated_by = attributes.iter().map(|a| (*a).to_string()).collect();
        self
    }

    /// Returns true if the attribute can only be set by the provider.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.computed && !self.optional && !self.required
    }
}

impl NestedBlockSchema {
    /// Creates a nested block with no item limits.
    #[must_use]
    pub const fn new(nesting: Nesting, block: BlockSchema) -> Self {
        Self {
            nesting,
            block,
            min_items: 0,
            max_items: None,
        }
    }

    /// Sets the item limits.
    #[must_use]
    pub const fn with_items(mut self, min: usize, max: Option<usize>) -> Self {
        self.min_items = min;
        self.max_items = max;
        self
    }

    /// Value type of the whole nested collection.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        let elem = self.block.value_type();
        match self.nesting {
            Nesting::Single => elem,
            Nesting::List => ValueType::List(Box::new(elem)),
            Nesting::Set => ValueType::Set(Box::new(elem)),
            Nesting::Map => ValueType::Map(Box::new(elem)),
        }
    }
}

impl BlockSchema {
    /// Creates an empty block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, attribute: AttributeSchema) -> Self {
        self.attributes.insert(name.into(), attribute);
        self
    }

    /// Adds a nested block.
    #[must_use]
    pub fn with_block(mut self, name: impl Into<String>, block: NestedBlockSchema) -> Self {
        self.blocks.insert(name.into(), block);
        self
    }

    /// Object type described by this block.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        let mut fields: BTreeMap<String, ValueType> = self
            .attributes
            .iter()
            .map(|(name, attr)| (name.clone(), attr.ty.clone()))
            .collect();
        for (name, nested) in &self.blocks {
            fields.insert(name.clone(), nested.value_type());
        }
        ValueType::Object(fields)
    }

    /// Finds the attribute schema a path points to. Index and key steps
    /// into nested blocks are skipped.
    #[must_use]
    pub fn attribute_at(&self, path: &AttrPath) -> Option<&AttributeSchema> {
        let mut block = self;
        let mut steps = path.steps().iter().peekable();
        while let Some(step) = steps.next() {
            let PathStep::Attr(name) = step else {
                continue;
            };
            if let Some(attr) = block.attributes.get(name) {
                return Some(attr);
            }
            block = &block.blocks.get(name)?.block;
            while matches!(steps.peek(), Some(PathStep::Index(_) | PathStep::Key(_))) {
                steps.next();
            }
        }
        None
    }

    /// Checks configuration against the block and normalizes it.
    ///
    /// Every schema attribute appears in the result (`Null` when unset),
    /// values are coerced to their declared type and defaults are applied.
    ///
    /// # Errors
    ///
    /// Returns the offending path and a message for unsupported attributes,
    /// missing required attributes, read-only attributes set in
    /// configuration, type mismatches and block count violations.
    pub fn conform(&self, mut config: Attributes, at: &AttrPath) -> Result<Attributes, (AttrPath, String)> {
        if let Some(extra) = config
            .keys()
            .find(|k| !self.attributes.contains_key(*k) && !self.blocks.contains_key(*k))
        {
            return Err((at.join_attr(extra.clone()), String::from("unsupported attribute")));
        }

        let mut out = Attributes::new();

        for (name, attr) in &self.attributes {
            let path = at.join_attr(name.clone());
            let raw = config.remove(name).unwrap_or(Value::Null);

            if attr.is_read_only() && !raw.is_null() {
                return Err((path, String::from("attribute is read-only")));
            }
            if attr.required && raw.is_null() {
                return Err((path, String::from("required attribute is not set")));
            }

            let value = match raw {
                Value::Null => attr.default.clone().unwrap_or(Value::Null),
                other => other,
            };
            let value = value.coerce(&attr.ty).map_err(|e| (path, e))?;
            out.insert(name.clone(), value);
        }

        for (name, nested) in &self.blocks {
            let path = at.join_attr(name.clone());
            let raw = config.remove(name).unwrap_or(Value::Null);
            out.insert(name.clone(), nested.conform(raw, &path)?);
        }

        Ok(out)
    }
}

impl NestedBlockSchema {
    fn conform(&self, raw: Value, path: &AttrPath) -> Result<Value, (AttrPath, String)> {
        let count_error = |n: usize| {
            (
                path.clone(),
                format!(
                    "expected between {} and {} blocks, found {n}",
                    self.min_items,
                    self.max_items.map_or_else(|| String::from("any"), |m| m.to_string())
                ),
            )
        };

        let check_count = |n: usize| {
            if n < self.min_items || self.max_items.is_some_and(|m| n > m) {
                Err(count_error(n))
            } else {
                Ok(())
            }
        };

        match (self.nesting, raw) {
            (_, Value::Unknown(_)) => Ok(Value::Unknown(self.value_type())),
            (Nesting::Single, Value::Null) => {
                check_count(0)?;
                Ok(Value::Null)
            }
            (Nesting::Single, Value::Object(body) | Value::Map(body)) => {
                check_count(1)?;
                self.block.conform(body, path).map(Value::Object)
            }
            (Nesting::List | Nesting::Set, Value::Null) => {
                check_count(0)?;
                Ok(if self.nesting == Nesting::Set {
                    Value::Set(Vec::new())
                } else {
                    Value::List(Vec::new())
                })
            }
            (Nesting::List | Nesting::Set, Value::List(items) | Value::Set(items)) => {
                check_count(items.len())?;
                let mut blocks = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let item_path = path.join_index(i);
                    let Value::Object(body) = item else {
                        return Err((item_path, format!("expected block, found {}", item.kind())));
                    };
                    blocks.push(Value::Object(self.block.conform(body, &item_path)?));
                }
                Ok(if self.nesting == Nesting::Set {
                    Value::set(blocks)
                } else {
                    Value::List(blocks)
                })
            }
            (Nesting::Map, Value::Null) => {
                check_count(0)?;
                Ok(Value::Map(BTreeMap::new()))
            }
            (Nesting::Map, Value::Object(entries) | Value::Map(entries)) => {
                check_count(entries.len())?;
                let mut blocks = BTreeMap::new();
                for (key, item) in entries {
                    let item_path = path.join_key(key.clone());
                    let Value::Object(body) = item else {
                        return Err((item_path, format!("expected block, found {}", item.kind())));
                    };
                    blocks.insert(key, Value::Object(self.block.conform(body, &item_path)?));
                }
                Ok(Value::Map(blocks))
            }
            (_, other) => Err((path.clone(), format!("expected block, found {}", other.kind()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_schema() -> BlockSchema {
        BlockSchema::new()
            .with_attribute("name", AttributeSchema::required(ValueType::String).force_new())
            .with_attribute("id", AttributeSchema::computed(ValueType::String))
            .with_attribute(
                "size",
                AttributeSchema::optional(ValueType::String).with_default("small"),
            )
            .with_attribute(
                "password",
                AttributeSchema::optional(ValueType::String).sensitive(),
            )
            .with_block(
                "rule",
                NestedBlockSchema::new(
                    Nesting::List,
                    BlockSchema::new().with_attribute("port", AttributeSchema::required(ValueType::Number)),
                )
                .with_items(0, Some(2)),
            )
    }

    #[test]
    fn test_attribute_constructors_set_flags() {
        let required = AttributeSchema::required(ValueType::String);
        assert!(required.required && !required.optional && !required.computed);
        let computed = AttributeSchema::computed(ValueType::String);
        assert!(computed.computed && !computed.optional);
        let both = AttributeSchema::optional_computed(ValueType::Number).force_new();
        assert!(both.optional && both.computed && both.force_new);
        assert!(AttributeSchema::optional(ValueType::Bool).default.is_none());
    }

    #[test]
    fn test_conform_fills_defaults_and_nulls() {
        let mut config = Attributes::new();
        config.insert("name".to_string(), Value::from("web"));
        let out = server_schema().conform(config, &AttrPath::default()).unwrap();
        assert_eq!(out.get("size"), Some(&Value::from("small")));
        assert_eq!(out.get("id"), Some(&Value::Null));
        assert_eq!(out.get("rule"), Some(&Value::List(vec![])));
    }

    #[test]
    fn test_conform_rejects_missing_required() {
        let err = server_schema().conform(Attributes::new(), &AttrPath::default()).unwrap_err();
        assert_eq!(err.0.to_string(), "name");
    }

    #[test]
    fn test_conform_rejects_read_only() {
        let mut config = Attributes::new();
        config.insert("name".to_string(), Value::from("web"));
        config.insert("id".to_string(), Value::from("x"));
        assert!(server_schema().conform(config, &AttrPath::default()).is_err());
    }

    #[test]
    fn test_conform_block_limits() {
        let rule = |p: f64| {
            let mut m = BTreeMap::new();
            m.insert("port".to_string(), Value::Number(p));
            Value::Object(m)
        };
        let mut config = Attributes::new();
        config.insert("name".to_string(), Value::from("web"));
        config.insert("rule".to_string(), Value::List(vec![rule(1.0), rule(2.0), rule(3.0)]));
        let err = server_schema().conform(config, &AttrPath::default()).unwrap_err();
        assert_eq!(err.0.to_string(), "rule");
    }

    #[test]
    fn test_attribute_at_nested() {
        let schema = server_schema();
        let path: AttrPath = "rule[1].port".parse().unwrap();
        assert!(schema.attribute_at(&path).is_some_and(|a| a.required));
        assert!(schema.attribute_at(&AttrPath::attr("password")).is_some_and(|a| a.sensitive));
        assert!(schema.attribute_at(&AttrPath::attr("nope")).is_none());
    }
}
