//! Diff engine for comparing desired configuration with recorded state.
//!
//! The engine is schema driven: it conforms the configuration to the
//! resource schema, carries computed values forward, and decides between
//! update and replace from the attributes that cannot change in place.

use std::collections::BTreeSet;
use tracing::debug;

use crate::address::ResourceAddress;
use crate::error::ConfigError;
use crate::provider::{BlockSchema, Nesting, ObjectState, ResourceSchema};
use crate::state::ResourceInstanceState;
use crate::value::{AttrPath, Attributes, PathStep, Value};

use super::change::{Action, AttributeChange, Change, ReplaceReason};

/// Engine for computing per-instance changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffEngine;

/// Inputs of one managed-resource diff.
#[derive(Debug, Clone)]
pub struct DiffRequest<'a> {
    /// Instance being diffed.
    pub address: &'a ResourceAddress,
    /// Provider that owns the instance.
    pub provider: &'a str,
    /// Recorded instance, if any.
    pub prior: Option<&'a ResourceInstanceState>,
    /// Evaluated configuration; `None` if the instance is no longer desired.
    pub desired: Option<Attributes>,
    /// Resource schema.
    pub schema: &'a ResourceSchema,
    /// Attributes whose configured changes are ignored.
    pub ignore_changes: &'a [AttrPath],
    /// Replacement demanded from outside the diff.
    pub force_replace: Option<ReplaceReason>,
}

fn schema_error(address: &ResourceAddress, (path, message): (AttrPath, String)) -> ConfigError {
    ConfigError::SchemaMismatch {
        address: address.clone(),
        attribute: path.to_string(),
        message,
    }
}

fn block_has_sensitive(block: &BlockSchema) -> bool {
    block.attributes.values().any(|a| a.sensitive) || block.blocks.values().any(|b| block_has_sensitive(&b.block))
}

fn block_forces(block: &BlockSchema) -> bool {
    block.attributes.values().any(|a| a.force_new) || block.blocks.values().any(|b| block_forces(&b.block))
}

/// Top-level paths whose values must be masked.
fn sensitive_paths(schema: &BlockSchema, prior: Option<&ResourceInstanceState>) -> BTreeSet<AttrPath> {
    let mut paths: BTreeSet<AttrPath> = schema
        .attributes
        .iter()
        .filter(|(_, a)| a.sensitive)
        .map(|(name, _)| AttrPath::attr(name.clone()))
        .chain(
            schema
                .blocks
                .iter()
                .filter(|(_, b)| block_has_sensitive(&b.block))
                .map(|(name, _)| AttrPath::attr(name.clone())),
        )
        .collect();
    if let Some(prior) = prior {
        paths.extend(prior.sensitive_paths.iter().cloned());
    }
    paths
}

/// Collects paths where a `force_new` attribute differs.
fn forcing_paths(block: &BlockSchema, prior: &Attributes, planned: &Attributes, at: &AttrPath, out: &mut BTreeSet<AttrPath>) {
    let null = Value::Null;

    for (name, attr) in &block.attributes {
        if attr.force_new && prior.get(name).unwrap_or(&null) != planned.get(name).unwrap_or(&null) {
            out.insert(at.join_attr(name.clone()));
        }
    }

    for (name, nested) in &block.blocks {
        let before = prior.get(name).unwrap_or(&null);
        let after = planned.get(name).unwrap_or(&null);
        if before == after {
            continue;
        }
        let path = at.join_attr(name.clone());
        match (nested.nesting, before, after) {
            (Nesting::Single, Value::Object(b), Value::Object(a)) => {
                forcing_paths(&nested.block, b, a, &path, out);
            }
            (Nesting::List, Value::List(b), Value::List(a)) if b.len() == a.len() => {
                for (i, pair) in b.iter().zip(a).enumerate() {
                    if let (Value::Object(bo), Value::Object(ao)) = pair {
                        forcing_paths(&nested.block, bo, ao, &path.join_index(i), out);
                    }
                }
            }
            (Nesting::Map, Value::Map(b), Value::Map(a)) if b.keys().eq(a.keys()) => {
                for (key, bv) in b {
                    if let (Value::Object(bo), Some(Value::Object(ao))) = (bv, a.get(key)) {
                        forcing_paths(&nested.block, bo, ao, &path.join_key(key.clone()), out);
                    }
                }
            }
            _ => {
                if block_forces(&nested.block) {
                    out.insert(path);
                }
            }
        }
    }
}

fn overwrite(target: &mut Value, prior: &Value, steps: &[PathStep]) {
    let Some((step, rest)) = steps.split_first() else {
        *target = prior.clone();
        return;
    };
    match (step, target, prior) {
        (
            PathStep::Attr(name) | PathStep::Key(name),
            Value::Object(t) | Value::Map(t),
            Value::Object(p) | Value::Map(p),
        ) => {
            let Some(pv) = p.get(name) else {
                return;
            };
            if let Some(tv) = t.get_mut(name) {
                overwrite(tv, pv, rest);
            } else if rest.is_empty() {
                t.insert(name.clone(), pv.clone());
            }
        }
        (PathStep::Index(i), Value::List(t), Value::List(p)) => {
            if let (Some(tv), Some(pv)) = (t.get_mut(*i), p.get(*i)) {
                overwrite(tv, pv, rest);
            }
        }
        _ => {}
    }
}

/// Keeps the recorded value at `path`.
fn apply_ignore(planned: &mut Attributes, prior: &Attributes, path: &AttrPath) {
    let Some((PathStep::Attr(root), rest)) = path.steps().split_first() else {
        return;
    };
    let Some(prior_value) = prior.get(root) else {
        return;
    };
    match planned.get_mut(root) {
        Some(value) => overwrite(value, prior_value, rest),
        None => {
            planned.insert(root.clone(), prior_value.clone());
        }
    }
}

/// Marks unset computed attributes as unknown.
fn unknown_computed(block: &BlockSchema, planned: &mut Attributes, configured: &BTreeSet<String>) {
    for (name, attr) in &block.attributes {
        if attr.computed && !configured.contains(name) {
            planned.insert(name.clone(), Value::Unknown(attr.ty.clone()));
        }
    }
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the change for a managed resource instance.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SchemaMismatch`] if the configuration does not
    /// fit the schema.
    pub fn diff(&self, request: DiffRequest<'_>) -> Result<Change, ConfigError> {
        let DiffRequest {
            address,
            provider,
            prior,
            desired,
            schema,
            ignore_changes,
            force_replace,
        } = request;
        let sensitive = sensitive_paths(&schema.block, prior);

        let Some(config) = desired else {
            let Some(prior_state) = prior else {
                return Err(ConfigError::validation_general(format!(
                    "{address} is neither configured nor recorded"
                )));
            };
            debug!(address = %address, "Instance no longer configured, planning delete");
            let object = prior_state.object();
            return Ok(build_change(
                address,
                provider,
                Some(object),
                None,
                Action::Delete,
                &sensitive,
                &BTreeSet::new(),
                &BTreeSet::new(),
                schema.version,
            ));
        };

        let explicit: BTreeSet<String> = config.keys().cloned().collect();
        let configured: BTreeSet<String> = config
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| k.clone())
            .collect();
        let mut planned = schema
            .block
            .conform(config, &AttrPath::default())
            .map_err(|e| schema_error(address, e))?;

        let Some(prior_state) = prior else {
            unknown_computed(&schema.block, &mut planned, &configured);
            return Ok(build_change(
                address,
                provider,
                None,
                Some(planned),
                Action::Create,
                &sensitive,
                &explicit,
                &BTreeSet::new(),
                schema.version,
            ));
        };
        let prior_object = prior_state.object();
        let prior_attrs = &prior_object.attributes;

        for path in ignore_changes {
            apply_ignore(&mut planned, prior_attrs, path);
        }

        let mut replace_paths = BTreeSet::new();
        forcing_paths(&schema.block, prior_attrs, &planned, &AttrPath::default(), &mut replace_paths);
        // Computed values are not configuration; they never force by themselves.
        replace_paths.retain(|p| {
            p.root().is_none_or(|root| {
                schema
                    .block
                    .attributes
                    .get(root)
                    .is_none_or(|a| !a.computed || configured.contains(root))
            })
        });

        let reason = if prior_state.is_tainted() {
            Some(ReplaceReason::Tainted)
        } else if force_replace.is_some() {
            force_replace
        } else if replace_paths.is_empty() {
            None
        } else {
            Some(ReplaceReason::ForcedByAttribute)
        };

        if reason.is_some() {
            unknown_computed(&schema.block, &mut planned, &configured);
        } else {
            for (name, attr) in &schema.block.attributes {
                if !attr.computed || configured.contains(name) {
                    continue;
                }
                let invalidated = attr
                    .invalidated_by
                    .iter()
                    .any(|dep| prior_attrs.get(dep).unwrap_or(&Value::Null) != planned.get(dep).unwrap_or(&Value::Null));
                let value = if invalidated {
                    Value::Unknown(attr.ty.clone())
                } else {
                    prior_attrs.get(name).cloned().unwrap_or(Value::Null)
                };
                planned.insert(name.clone(), value);
            }
        }

        let mut change = build_change(
            address,
            provider,
            Some(prior_object.clone()),
            Some(planned),
            Action::Update,
            &sensitive,
            &explicit,
            &replace_paths,
            schema.version,
        );
        change.replace_reason = reason;
        change.action = if reason.is_some() {
            Action::Replace
        } else if change.changed_attributes().next().is_some() {
            Action::Update
        } else {
            Action::NoOp
        };

        debug!(address = %address, action = %change.action, "Computed diff");
        Ok(change)
    }

    /// Plans a data source read. Attributes the provider computes are
    /// unknown until the read happens.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SchemaMismatch`] if the configuration does not
    /// fit the schema.
    pub fn plan_read(
        &self,
        address: &ResourceAddress,
        provider: &str,
        prior: Option<&ResourceInstanceState>,
        desired: Attributes,
        schema: &ResourceSchema,
    ) -> Result<Change, ConfigError> {
        let explicit: BTreeSet<String> = desired.keys().cloned().collect();
        let configured: BTreeSet<String> = desired
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| k.clone())
            .collect();
        let mut planned = schema
            .block
            .conform(desired, &AttrPath::default())
            .map_err(|e| schema_error(address, e))?;
        unknown_computed(&schema.block, &mut planned, &configured);
        let sensitive = sensitive_paths(&schema.block, prior);
        Ok(build_change(
            address,
            provider,
            prior.map(ResourceInstanceState::object),
            Some(planned),
            Action::Read,
            &sensitive,
            &explicit,
            &BTreeSet::new(),
            schema.version,
        ))
    }

    /// Records a data source that was already read.
    #[must_use]
    pub fn completed_read(
        &self,
        address: &ResourceAddress,
        provider: &str,
        prior: Option<&ResourceInstanceState>,
        result: Attributes,
        schema: &ResourceSchema,
    ) -> Change {
        let sensitive = sensitive_paths(&schema.block, prior);
        let explicit = result.keys().cloned().collect();
        build_change(
            address,
            provider,
            prior.map(ResourceInstanceState::object),
            Some(result),
            Action::Read,
            &sensitive,
            &explicit,
            &BTreeSet::new(),
            schema.version,
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn build_change(
    address: &ResourceAddress,
    provider: &str,
    before: Option<ObjectState>,
    after: Option<Attributes>,
    action: Action,
    sensitive: &BTreeSet<AttrPath>,
    explicit: &BTreeSet<String>,
    replace_paths: &BTreeSet<AttrPath>,
    schema_version: u64,
) -> Change {
    let names: BTreeSet<&String> = before
        .iter()
        .flat_map(|b| b.attributes.keys())
        .chain(after.iter().flat_map(Attributes::keys))
        .collect();

    let attributes = names
        .into_iter()
        .map(|name| {
            let path = AttrPath::attr(name.clone());
            let before_value = before
                .as_ref()
                .map(|b| b.attributes.get(name).cloned().unwrap_or(Value::Null));
            let after_value = after
                .as_ref()
                .map(|a| a.get(name).cloned().unwrap_or(Value::Null));
            AttributeChange {
                before_explicit: before_value.as_ref().is_some_and(|v| !v.is_null()),
                after_explicit: explicit.contains(name),
                unknown_after: after_value.as_ref().is_some_and(Value::contains_unknown),
                sensitive: sensitive.iter().any(|p| p.root() == Some(name.as_str())),
                forces_replacement: replace_paths.iter().any(|p| p.root() == Some(name.as_str())),
                before: before_value,
                after: after_value,
                path,
            }
        })
        .collect();

    Change {
        address: address.clone(),
        provider: provider.to_string(),
        action,
        replace_reason: None,
        attributes,
        replace_paths: replace_paths.clone(),
        sensitive_paths: sensitive.clone(),
        before,
        after,
        depends_on: BTreeSet::new(),
        recorded_dependencies: Vec::new(),
        schema_version,
    }
}
