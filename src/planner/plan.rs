//! Plan construction.
//!
//! The planner walks the resolved configuration in reference order, diffs
//! every instance against recorded state, plans deletions for recorded
//! instances that are no longer configured, and checks guardrails.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::ResourceAddress;
use crate::config::{ResolvedConfig, ResolvedResource};
use crate::context::EngineContext;
use crate::error::{ConfigError, GraphError, PlanError, Result};
use crate::provider::{ProviderFailure, ResourceSchema};
use crate::state::{ResourceInstanceState, StateSnapshot};
use crate::value::{AttrPath, Value};

use super::change::{Action, Change, ReplaceReason};
use super::diff::{DiffEngine, DiffRequest};
use super::graph::{DependencyGraph, topological_order};

/// What a plan aims for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// Converge recorded state towards the configuration.
    Apply,
    /// Delete every recorded instance.
    Destroy,
}

/// Number of changes per action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Instances to create.
    pub create: usize,
    /// Instances to update in place.
    pub update: usize,
    /// Instances to replace.
    pub replace: usize,
    /// Instances to delete.
    pub delete: usize,
    /// Data sources to read.
    pub read: usize,
    /// Instances left alone.
    pub no_op: usize,
}

/// A complete plan.
#[derive(Debug)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Configuration hash this plan is based on.
    pub config_hash: String,
    /// Plan mode.
    pub mode: PlanMode,
    /// Changes and their ordering.
    pub graph: DependencyGraph,
    /// Recorded data sources that are no longer configured.
    pub orphaned_data: Vec<ResourceAddress>,
    /// Counts per action.
    pub summary: PlanSummary,
    /// Guardrail violations.
    pub violations: Vec<PlanError>,
    /// Serial of the state the plan was computed from.
    pub prior_serial: u64,
}

/// Inputs of one planning round.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    /// Expanded configuration.
    pub config: &'a ResolvedConfig,
    /// Recorded state.
    pub state: &'a StateSnapshot,
    /// Plan mode.
    pub mode: PlanMode,
    /// Addresses to replace, and why.
    pub replace: &'a BTreeMap<ResourceAddress, ReplaceReason>,
    /// Hash of the configuration file.
    pub config_hash: &'a str,
    /// Maximum number of deletions and replacements.
    pub max_destroy: Option<usize>,
}

/// Builds plans from configuration and state.
#[derive(Debug)]
pub struct Planner<'a> {
    ctx: &'a EngineContext,
    diff: DiffEngine,
    cancel: CancellationToken,
}

impl PlanSummary {
    fn count(&mut self, action: Action) {
        match action {
            Action::NoOp => self.no_op += 1,
            Action::Create => self.create += 1,
            Action::Update => self.update += 1,
            Action::Delete => self.delete += 1,
            Action::Replace => self.replace += 1,
            Action::Read => self.read += 1,
        }
    }

    /// Number of instances removed, including replacements.
    #[must_use]
    pub const fn destroyed(&self) -> usize {
        self.delete + self.replace
    }
}

impl Plan {
    /// Returns true if no guardrail is violated.
    #[must_use]
    pub fn passes_guardrails(&self) -> bool {
        self.violations.is_empty()
    }

    /// Returns true if applying the plan changes any managed instance.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.graph
            .changes()
            .any(|c| c.action.is_change() && c.action != Action::Read)
    }

    /// Changes in dependency order.
    #[must_use]
    pub fn changes(&self) -> Vec<&Change> {
        self.graph.ordered_changes()
    }
}

fn destroy_check(change: &Change, resource: Option<&ResolvedResource>) -> Option<PlanError> {
    let protected = resource.is_some_and(|r| r.lifecycle.prevent_destroy);
    (protected && change.action.is_destructive()).then(|| PlanError::PreventDestroy {
        address: change.address.clone(),
        action: change.action.to_string(),
    })
}

impl<'a> Planner<'a> {
    /// Creates a planner.
    #[must_use]
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self {
            ctx,
            diff: DiffEngine::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Stops retrying data source reads when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn schema(&self, provider: &str, address: &ResourceAddress) -> std::result::Result<&'a ResourceSchema, ConfigError> {
        self.ctx.registry().resource_schema(provider, address)
    }

    /// Computes a plan.
    ///
    /// No provider operation other than data source reads happens here.
    ///
    /// # Errors
    ///
    /// Returns configuration errors (unknown providers, schema mismatches,
    /// invalid expressions), cycles, and data source read failures.
    /// Guardrail violations are not errors; they are recorded in the plan.
    pub async fn plan(&self, request: PlanRequest<'_>) -> Result<Plan> {
        let PlanRequest {
            config,
            state,
            mode,
            replace,
            config_hash,
            max_destroy,
        } = request;

        for address in replace.keys() {
            if !config.contains(address) && state.get(address).is_none() {
                warn!(address = %address, "Replacement requested for an unknown address");
            }
        }

        let resources = config.resources();
        let positions: HashMap<&ResourceAddress, usize> =
            resources.iter().enumerate().map(|(i, r)| (&r.address, i)).collect();
        let order = topological_order(resources.len(), |i| {
            resources[i]
                .all_dependencies()
                .filter_map(|dep| positions.get(dep).copied())
                .collect()
        })
        .map_err(|cycle| GraphError::CycleDetected {
            cycle: cycle.into_iter().rev().map(|i| resources[i].address.clone()).collect(),
        })?;

        let mut planned: BTreeMap<ResourceAddress, Value> = BTreeMap::new();
        let mut changes = Vec::with_capacity(resources.len());
        let mut orphaned_data = Vec::new();

        for index in order {
            let resource = &resources[index];
            let address = &resource.address;
            let prior = state.get(address);

            if address.is_data() {
                if mode == PlanMode::Destroy {
                    if prior.is_some() {
                        orphaned_data.push(address.clone());
                    }
                    continue;
                }
                let change = self.plan_data(resource, prior, &planned).await?;
                if let Some(value) = change.planned_value() {
                    planned.insert(address.clone(), value);
                }
                changes.push(change);
                continue;
            }

            let desired = match mode {
                PlanMode::Apply => Some(resource.evaluate(&planned)?),
                PlanMode::Destroy if prior.is_none() => continue,
                PlanMode::Destroy => None,
            };
            let ignore_changes = resource
                .lifecycle
                .ignore_changes
                .iter()
                .map(|p| {
                    p.parse::<AttrPath>().map_err(|e| {
                        ConfigError::validation(e, format!("{address}.lifecycle.ignore_changes"))
                    })
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let schema = self.schema(&resource.provider, address)?;
            let mut change = self.diff.diff(DiffRequest {
                address,
                provider: &resource.provider,
                prior,
                desired,
                schema,
                ignore_changes: &ignore_changes,
                force_replace: replace.get(address).copied(),
            })?;
            change.depends_on = resource.all_dependencies().cloned().collect();
            if let Some(prior) = prior {
                change.recorded_dependencies.clone_from(&prior.dependencies);
            }
            if let Some(value) = change.planned_value() {
                planned.insert(address.clone(), value);
            }
            changes.push(change);
        }

        // Recorded instances that are no longer configured
        for (address, instance) in &state.resources {
            if config.contains(address) {
                continue;
            }
            if address.is_data() {
                orphaned_data.push(address.clone());
                continue;
            }
            let schema = self.schema(&instance.provider, address)?;
            let mut change = self.diff.diff(DiffRequest {
                address,
                provider: &instance.provider,
                prior: Some(instance),
                desired: None,
                schema,
                ignore_changes: &[],
                force_replace: None,
            })?;
            change.recorded_dependencies.clone_from(&instance.dependencies);
            changes.push(change);
        }

        let mut summary = PlanSummary::default();
        let mut violations = Vec::new();
        for change in &changes {
            summary.count(change.action);
            violations.extend(destroy_check(change, config.get(&change.address)));
        }
        if let Some(limit) = max_destroy
            && summary.destroyed() > limit
        {
            violations.push(PlanError::DestroyLimitExceeded {
                planned: summary.destroyed(),
                limit,
            });
        }

        let graph = DependencyGraph::build(changes, self.ctx.serialized_providers())?;

        info!(
            create = summary.create,
            update = summary.update,
            replace = summary.replace,
            delete = summary.delete,
            read = summary.read,
            "Plan computed"
        );

        Ok(Plan {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            mode,
            graph,
            orphaned_data,
            summary,
            violations,
            prior_serial: state.serial,
        })
    }

    /// Reads a data source now if its configuration is known, otherwise
    /// defers the read to apply.
    async fn plan_data(
        &self,
        resource: &ResolvedResource,
        prior: Option<&ResourceInstanceState>,
        planned: &BTreeMap<ResourceAddress, Value>,
    ) -> Result<Change> {
        let address = &resource.address;
        let schema = self.schema(&resource.provider, address)?;
        let desired = resource.evaluate(planned)?;
        let known = !desired.values().any(Value::contains_unknown);

        let mut change = self
            .diff
            .plan_read(address, &resource.provider, prior, desired.clone(), schema)?;

        if known {
            let provider = self.ctx.provider(&resource.provider, address)?;
            let object = self
                .ctx
                .retry()
                .run(address, "read", &self.cancel, || {
                    let config = desired.clone();
                    let provider = provider.clone();
                    let address = address.clone();
                    async move { provider.read_data(address, config).await.map_err(ProviderFailure::from) }
                })
                .await
                .map_err(|e| PlanError::ReadFailed {
                    address: address.clone(),
                    message: e.to_string(),
                })?;
            debug!(address = %address, "Read data source during plan");
            change = self
                .diff
                .completed_read(address, &resource.provider, prior, object.attributes, schema);
        }

        change.depends_on = resource.all_dependencies().cloned().collect();
        Ok(change)
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete",
            self.create, self.update, self.replace, self.delete
        )
    }
}

impl fmt::Display for PlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan: {}", self.summary)?;
        for change in self.changes() {
            if change.action.is_change() && change.action != Action::Read {
                writeln!(f, "  {change}")?;
            }
        }

        if !self.violations.is_empty() {
            writeln!(f, "\nGuardrail violations:")?;
            for violation in &self.violations {
                writeln!(f, "  - {violation}")?;
            }
        }

        Ok(())
    }
}
