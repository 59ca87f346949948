//! Expansion of configuration into resource instances.
//!
//! `count`, `for_each` and module calls are expanded into one
//! [`ResolvedResource`] per instance. Instance symbols (`count.index`,
//! `each.key`, `each.value`) are substituted here; what remains are
//! references to other instances, evaluated later against planned or
//! applied values.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::debug;

use super::expr::{ConfigExpr, Expr, KeyExpr, Reference, TemplatePart};
use super::spec::{DeployConfig, ForEach, LifecycleConfig, ModuleConfig, ResourceConfig};
use crate::address::{InstanceKey, ModuleStep, ResourceAddress, ResourceMode};
use crate::error::ConfigError;
use crate::state::StateSnapshot;
use crate::value::{AttrPath, Attributes, PathStep, Value, ValueType, format_number};

/// Source of referenced objects during evaluation.
pub trait ReferenceLookup {
    /// Object for `address`. `None` means its value is not known yet.
    fn lookup(&self, address: &ResourceAddress) -> Option<Value>;
}

/// Lookup that knows nothing; every reference evaluates to unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnknownLookup;

impl ReferenceLookup for UnknownLookup {
    fn lookup(&self, _address: &ResourceAddress) -> Option<Value> {
        None
    }
}

impl ReferenceLookup for BTreeMap<ResourceAddress, Value> {
    fn lookup(&self, address: &ResourceAddress) -> Option<Value> {
        self.get(address).cloned()
    }
}

impl ReferenceLookup for StateSnapshot {
    fn lookup(&self, address: &ResourceAddress) -> Option<Value> {
        self.get(address)
            .map(|instance| Value::Object(instance.attributes.clone()))
    }
}

/// Instances a reference points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefTarget {
    /// A single instance.
    One(ResourceAddress),
    /// All instances of a counted resource, by index.
    List(Vec<ResourceAddress>),
    /// All instances of a `for_each` resource, by key.
    Map(BTreeMap<String, ResourceAddress>),
}

/// A reference bound to concrete instance addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundRef {
    /// The expression as written.
    pub text: String,
    /// Referenced instances.
    pub target: RefTarget,
    /// Path into each referenced object.
    pub path: AttrPath,
}

/// Piece of a bound template.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundPart {
    /// Literal text.
    Literal(String),
    /// Interpolated reference.
    Ref(BoundRef),
}

/// An attribute value whose only open parts are references.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr {
    /// A plain value.
    Literal(Value),
    /// A reference keeping the referenced value's type.
    Ref(BoundRef),
    /// A string template.
    Template(Vec<BoundPart>),
    /// A sequence.
    List(Vec<ValueExpr>),
    /// A mapping.
    Object(BTreeMap<String, ValueExpr>),
}

/// One resource instance ready for planning.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResource {
    /// Instance address.
    pub address: ResourceAddress,
    /// Provider name.
    pub provider: String,
    /// Attribute expressions.
    pub attributes: BTreeMap<String, ValueExpr>,
    /// Instances referenced by the expressions.
    pub references: BTreeSet<ResourceAddress>,
    /// Instances named by `depends_on`.
    pub depends_on: BTreeSet<ResourceAddress>,
    /// Lifecycle rules.
    pub lifecycle: LifecycleConfig,
}

/// Every instance declared by a configuration.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    resources: Vec<ResolvedResource>,
    index: HashMap<ResourceAddress, usize>,
}

fn describe_step(step: &PathStep) -> String {
    match step {
        PathStep::Attr(name) => format!("attribute \"{name}\""),
        PathStep::Index(i) => format!("index {i}"),
        PathStep::Key(k) => format!("key \"{k}\""),
    }
}

fn traverse(value: &Value, path: &AttrPath) -> Result<Value, String> {
    let mut current = value;
    for step in path.steps() {
        current = match (step, current) {
            (_, Value::Unknown(_)) => return Ok(Value::unknown()),
            (PathStep::Attr(name) | PathStep::Key(name), Value::Object(m) | Value::Map(m)) => m
                .get(name)
                .ok_or_else(|| format!("has no {}", describe_step(step)))?,
            (PathStep::Index(i), Value::List(items) | Value::Set(items)) => items
                .get(*i)
                .ok_or_else(|| format!("has no {}", describe_step(step)))?,
            (step, other) => {
                return Err(format!("cannot access {} on a {} value", describe_step(step), other.kind()));
            }
        };
    }
    Ok(current.clone())
}

impl BoundRef {
    fn resolve_one(&self, address: &ResourceAddress, lookup: &dyn ReferenceLookup) -> Result<Value, String> {
        let Some(object) = lookup.lookup(address) else {
            return Ok(Value::unknown());
        };
        traverse(&object, &self.path).map_err(|m| format!("{address} {m}"))
    }

    /// Evaluates the reference.
    ///
    /// # Errors
    ///
    /// Returns a message if the path does not exist on a referenced object.
    pub fn evaluate(&self, lookup: &dyn ReferenceLookup) -> Result<Value, String> {
        match &self.target {
            RefTarget::One(address) => self.resolve_one(address, lookup),
            RefTarget::List(addresses) => addresses
                .iter()
                .map(|a| self.resolve_one(a, lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            RefTarget::Map(addresses) => addresses
                .iter()
                .map(|(k, a)| self.resolve_one(a, lookup).map(|v| (k.clone(), v)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Map),
        }
    }

    /// Addresses this reference depends on.
    pub fn addresses(&self) -> Box<dyn Iterator<Item = &ResourceAddress> + '_> {
        match &self.target {
            RefTarget::One(address) => Box::new(std::iter::once(address)),
            RefTarget::List(addresses) => Box::new(addresses.iter()),
            RefTarget::Map(addresses) => Box::new(addresses.values()),
        }
    }
}

fn interpolate(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(format_number(*n)),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Err(String::from("cannot interpolate a null value")),
        other => Err(format!("cannot interpolate a {} value", other.kind())),
    }
}

impl ValueExpr {
    /// Evaluates the expression. Values that depend on unknown references
    /// evaluate to [`Value::Unknown`].
    ///
    /// # Errors
    ///
    /// Returns a message for missing attributes or values that cannot be
    /// interpolated.
    pub fn evaluate(&self, lookup: &dyn ReferenceLookup) -> Result<Value, String> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Ref(reference) => reference.evaluate(lookup),
            Self::Template(parts) => {
                let mut out = String::new();
                let mut unknown = false;
                for part in parts {
                    match part {
                        BoundPart::Literal(text) => out.push_str(text),
                        BoundPart::Ref(reference) => {
                            let value = reference.evaluate(lookup)?;
                            if value.contains_unknown() {
                                unknown = true;
                            } else {
                                out.push_str(
                                    &interpolate(&value).map_err(|m| format!("{}: {m}", reference.text))?,
                                );
                            }
                        }
                    }
                }
                Ok(if unknown {
                    Value::Unknown(ValueType::String)
                } else {
                    Value::String(out)
                })
            }
            Self::List(items) => items
                .iter()
                .map(|item| item.evaluate(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Self::Object(entries) => entries
                .iter()
                .map(|(k, v)| v.evaluate(lookup).map(|v| (k.clone(), v)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Object),
        }
    }
}

impl ResolvedResource {
    /// Evaluates every attribute.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidExpression`] naming the attribute that
    /// failed.
    pub fn evaluate(&self, lookup: &dyn ReferenceLookup) -> Result<Attributes, ConfigError> {
        self.attributes
            .iter()
            .map(|(name, expr)| {
                expr.evaluate(lookup)
                    .map(|v| (name.clone(), v))
                    .map_err(|message| ConfigError::InvalidExpression {
                        address: self.address.to_string(),
                        expression: name.clone(),
                        message,
                    })
            })
            .collect()
    }

    /// References and explicit dependencies together.
    pub fn all_dependencies(&self) -> impl Iterator<Item = &ResourceAddress> {
        self.references.iter().chain(self.depends_on.iter())
    }
}

impl ResolvedConfig {
    /// Instances in declaration order.
    #[must_use]
    pub fn resources(&self) -> &[ResolvedResource] {
        &self.resources
    }

    /// Looks up an instance.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&ResolvedResource> {
        self.index.get(address).map(|&i| &self.resources[i])
    }

    /// Returns true if the instance is declared.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.index.contains_key(address)
    }

    /// Number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct Scope {
    count_index: Option<u64>,
    each: Option<(String, Value)>,
}

type Expansion = Vec<(Option<InstanceKey>, Option<Scope>)>;

fn expand(count: Option<u64>, for_each: Option<&ForEach>, field: &str) -> Result<Expansion, ConfigError> {
    match (count, for_each) {
        (Some(_), Some(_)) => Err(ConfigError::validation(
            "count and for_each are mutually exclusive",
            field,
        )),
        (Some(n), None) => Ok((0..n)
            .map(|i| {
                let scope = Scope {
                    count_index: Some(i),
                    each: None,
                };
                (Some(InstanceKey::Int(i)), Some(scope))
            })
            .collect()),
        (None, Some(ForEach::List(items))) => Ok(items
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|k| {
                let scope = Scope {
                    count_index: None,
                    each: Some((k.clone(), Value::String(k.clone()))),
                };
                (Some(InstanceKey::Str(k.clone())), Some(scope))
            })
            .collect()),
        (None, Some(ForEach::Map(entries))) => Ok(entries
            .iter()
            .map(|(k, v)| {
                let scope = Scope {
                    count_index: None,
                    each: Some((k.clone(), Value::from_yaml(v))),
                };
                (Some(InstanceKey::Str(k.clone())), Some(scope))
            })
            .collect()),
        (None, None) => Ok(vec![(None, None)]),
    }
}

struct ModuleInstance<'a> {
    path: Vec<ModuleStep>,
    scope: Option<Scope>,
    resources: &'a [ResourceConfig],
    data: &'a [ResourceConfig],
}

fn module_label(path: &[ModuleStep]) -> String {
    path.iter()
        .map(|step| match &step.key {
            Some(key) => format!("module.{}{key}", step.name),
            None => format!("module.{}", step.name),
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn collect_modules<'a>(
    modules: &'a [ModuleConfig],
    parent: &[ModuleStep],
    parent_scope: Option<&Scope>,
    out: &mut Vec<ModuleInstance<'a>>,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for module in modules {
        let mut call = parent.to_vec();
        call.push(ModuleStep {
            name: module.name.clone(),
            key: None,
        });
        let label = module_label(&call);
        if !seen.insert(module.name.as_str()) {
            return Err(ConfigError::DuplicateAddress { address: label });
        }

        for (key, scope) in expand(module.count, module.for_each.as_ref(), &label)? {
            let mut path = parent.to_vec();
            path.push(ModuleStep {
                name: module.name.clone(),
                key,
            });
            let scope = scope.or_else(|| parent_scope.cloned());
            collect_modules(&module.modules, &path, scope.as_ref(), out)?;
            out.push(ModuleInstance {
                path,
                scope,
                resources: &module.resources,
                data: &module.data,
            });
        }
    }
    Ok(())
}

type BlockKey<'a> = (ResourceMode, &'a str, &'a str);

enum Instances {
    Single(ResourceAddress),
    Counted(Vec<ResourceAddress>),
    Keyed(BTreeMap<String, ResourceAddress>),
}

struct Block<'a> {
    config: &'a ResourceConfig,
    mode: ResourceMode,
    expansion: Expansion,
    instances: Instances,
}

struct Binder<'a> {
    blocks: &'a HashMap<BlockKey<'a>, Block<'a>>,
    scope: Option<&'a Scope>,
    address: &'a ResourceAddress,
    references: BTreeSet<ResourceAddress>,
}

enum Bound {
    Value(Value),
    Ref(BoundRef),
}

impl Binder<'_> {
    fn error(&self, expression: impl ToString, message: impl Into<String>) -> ConfigError {
        ConfigError::InvalidExpression {
            address: self.address.to_string(),
            expression: expression.to_string(),
            message: message.into(),
        }
    }

    fn bind_key(&self, key: &KeyExpr, text: &str) -> Result<InstanceKey, ConfigError> {
        match key {
            KeyExpr::Literal(k) => Ok(k.clone()),
            KeyExpr::CountIndex => self
                .scope
                .and_then(|s| s.count_index)
                .map(InstanceKey::Int)
                .ok_or_else(|| self.error(text, "count.index used outside a counted resource")),
            KeyExpr::EachKey => self
                .scope
                .and_then(|s| s.each.as_ref())
                .map(|(k, _)| InstanceKey::Str(k.clone()))
                .ok_or_else(|| self.error(text, "each.key used outside a for_each resource")),
        }
    }

    fn bind_reference(&self, reference: &Reference) -> Result<BoundRef, ConfigError> {
        let unresolvable = || ConfigError::UnresolvableReference {
            address: self.address.clone(),
            reference: reference.text.clone(),
        };
        let block = self
            .blocks
            .get(&(reference.mode, reference.resource_type.as_str(), reference.name.as_str()))
            .ok_or_else(unresolvable)?;

        let target = match (&reference.key, &block.instances) {
            (None, Instances::Single(address)) => RefTarget::One(address.clone()),
            (None, Instances::Counted(addresses)) => RefTarget::List(addresses.clone()),
            (None, Instances::Keyed(addresses)) => RefTarget::Map(addresses.clone()),
            (Some(key), Instances::Counted(addresses)) => match self.bind_key(key, &reference.text)? {
                InstanceKey::Int(i) => usize::try_from(i)
                    .ok()
                    .and_then(|i| addresses.get(i))
                    .map(|a| RefTarget::One(a.clone()))
                    .ok_or_else(unresolvable)?,
                InstanceKey::Str(_) => return Err(unresolvable()),
            },
            (Some(key), Instances::Keyed(addresses)) => match self.bind_key(key, &reference.text)? {
                InstanceKey::Str(k) => addresses
                    .get(&k)
                    .map(|a| RefTarget::One(a.clone()))
                    .ok_or_else(unresolvable)?,
                InstanceKey::Int(_) => return Err(unresolvable()),
            },
            (Some(_), Instances::Single(_)) => return Err(unresolvable()),
        };

        Ok(BoundRef {
            text: reference.text.clone(),
            target,
            path: reference.path.clone(),
        })
    }

    fn bind_expr(&mut self, expr: &Expr) -> Result<Bound, ConfigError> {
        match expr {
            Expr::CountIndex => self
                .scope
                .and_then(|s| s.count_index)
                .map(|i| Bound::Value(Value::Number(i as f64)))
                .ok_or_else(|| self.error(expr, "count.index used outside a counted resource")),
            Expr::EachKey => self
                .scope
                .and_then(|s| s.each.as_ref())
                .map(|(k, _)| Bound::Value(Value::String(k.clone())))
                .ok_or_else(|| self.error(expr, "each.key used outside a for_each resource")),
            Expr::EachValue(path) => {
                let (_, value) = self
                    .scope
                    .and_then(|s| s.each.as_ref())
                    .ok_or_else(|| self.error(expr, "each.value used outside a for_each resource"))?;
                traverse(value, path)
                    .map(Bound::Value)
                    .map_err(|m| self.error(expr, format!("each.value {m}")))
            }
            Expr::Reference(reference) => {
                let bound = self.bind_reference(reference)?;
                self.references.extend(bound.addresses().cloned());
                Ok(Bound::Ref(bound))
            }
        }
    }

    fn bind(&mut self, expr: &ConfigExpr) -> Result<ValueExpr, ConfigError> {
        match expr {
            ConfigExpr::Literal(value) => Ok(ValueExpr::Literal(value.clone())),
            ConfigExpr::Expr(inner) => Ok(match self.bind_expr(inner)? {
                Bound::Value(value) => ValueExpr::Literal(value),
                Bound::Ref(reference) => ValueExpr::Ref(reference),
            }),
            ConfigExpr::Template(parts) => {
                let mut bound = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        TemplatePart::Literal(text) => bound.push(BoundPart::Literal(text.clone())),
                        TemplatePart::Expr(inner) => match self.bind_expr(inner)? {
                            Bound::Value(value) => bound.push(BoundPart::Literal(
                                interpolate(&value).map_err(|m| self.error(inner, m))?,
                            )),
                            Bound::Ref(reference) => bound.push(BoundPart::Ref(reference)),
                        },
                    }
                }
                Ok(ValueExpr::Template(bound))
            }
            ConfigExpr::List(items) => items
                .iter()
                .map(|item| self.bind(item))
                .collect::<Result<Vec<_>, _>>()
                .map(ValueExpr::List),
            ConfigExpr::Object(entries) => {
                let mut out = BTreeMap::new();
                for (k, v) in entries {
                    out.insert(k.clone(), self.bind(v)?);
                }
                Ok(ValueExpr::Object(out))
            }
        }
    }

    fn bind_depends_on(&self, text: &str) -> Result<Vec<ResourceAddress>, ConfigError> {
        match text.parse::<Expr>() {
            Ok(Expr::Reference(reference)) if reference.path.is_empty() => {
                let bound = self.bind_reference(&reference)?;
                Ok(bound.addresses().cloned().collect())
            }
            _ => Err(self.error(text, "depends_on entries must name a resource as TYPE.NAME")),
        }
    }
}

fn build_blocks<'a>(
    instance: &ModuleInstance<'a>,
) -> Result<(HashMap<BlockKey<'a>, Block<'a>>, Vec<BlockKey<'a>>), ConfigError> {
    let mut blocks = HashMap::new();
    let mut order = Vec::new();
    let declared = instance
        .data
        .iter()
        .map(|c| (ResourceMode::Data, c))
        .chain(instance.resources.iter().map(|c| (ResourceMode::Managed, c)));

    for (mode, config) in declared {
        let base = match mode {
            ResourceMode::Data => ResourceAddress::data(&config.resource_type, &config.name),
            ResourceMode::Managed => ResourceAddress::new(&config.resource_type, &config.name),
        }
        .in_module(instance.path.clone());

        let expansion = expand(config.count, config.for_each.as_ref(), &base.to_string())?;
        let instances = if config.count.is_some() {
            Instances::Counted(
                expansion
                    .iter()
                    .filter_map(|(k, _)| k.clone().map(|k| base.clone().with_key(k)))
                    .collect(),
            )
        } else if config.for_each.is_some() {
            Instances::Keyed(
                expansion
                    .iter()
                    .filter_map(|(k, _)| match k {
                        Some(InstanceKey::Str(s)) => {
                            Some((s.clone(), base.clone().with_key(InstanceKey::Str(s.clone()))))
                        }
                        _ => None,
                    })
                    .collect(),
            )
        } else {
            Instances::Single(base.clone())
        };

        let key = (mode, config.resource_type.as_str(), config.name.as_str());
        let block = Block {
            config,
            mode,
            expansion,
            instances,
        };
        if blocks.insert(key, block).is_some() {
            return Err(ConfigError::DuplicateAddress {
                address: base.to_string(),
            });
        }
        order.push(key);
    }
    Ok((blocks, order))
}

/// Expands a configuration into resource instances.
///
/// # Errors
///
/// Returns a configuration error for duplicate addresses, malformed
/// expressions and references to undeclared instances.
pub fn resolve(config: &DeployConfig) -> Result<ResolvedConfig, ConfigError> {
    let mut modules = vec![ModuleInstance {
        path: Vec::new(),
        scope: None,
        resources: &config.resources,
        data: &config.data,
    }];
    collect_modules(&config.modules, &[], None, &mut modules)?;

    let mut resolved = ResolvedConfig::default();

    for module in &modules {
        let (blocks, order) = build_blocks(module)?;

        for block in order.iter().filter_map(|key| blocks.get(key)) {
            let mut parsed = BTreeMap::new();
            for (name, yaml) in &block.config.attributes {
                let expr = ConfigExpr::parse(yaml).map_err(|message| ConfigError::InvalidExpression {
                    address: format!("{}.{}", block.config.resource_type, block.config.name),
                    expression: name.clone(),
                    message,
                })?;
                parsed.insert(name.clone(), expr);
            }

            for (key, scope) in &block.expansion {
                let mut address = match block.mode {
                    ResourceMode::Data => ResourceAddress::data(&block.config.resource_type, &block.config.name),
                    ResourceMode::Managed => ResourceAddress::new(&block.config.resource_type, &block.config.name),
                }
                .in_module(module.path.clone());
                if let Some(key) = key {
                    address = address.with_key(key.clone());
                }

                let scope = scope.as_ref().or(module.scope.as_ref());
                let mut binder = Binder {
                    blocks: &blocks,
                    scope,
                    address: &address,
                    references: BTreeSet::new(),
                };

                let mut attributes = BTreeMap::new();
                for (name, expr) in &parsed {
                    attributes.insert(name.clone(), binder.bind(expr)?);
                }

                let mut depends_on = BTreeSet::new();
                for text in &block.config.depends_on {
                    depends_on.extend(binder.bind_depends_on(text)?);
                }

                let references = std::mem::take(&mut binder.references);
                debug!(address = %address, references = references.len(), "Resolved instance");

                resolved.index.insert(address.clone(), resolved.resources.len());
                resolved.resources.push(ResolvedResource {
                    provider: block.config.provider_name().to_string(),
                    address,
                    attributes,
                    references,
                    depends_on,
                    lifecycle: block.config.lifecycle.clone(),
                });
            }
        }
    }

    Ok(resolved)
}
