//! Run orchestration.
//!
//! Every operation that mutates state follows the same cycle: acquire the
//! state lock, read the snapshot, do the work, write the snapshot, release
//! the lock. The lock is released on every path. A failed release is
//! reported alongside the run outcome and never replaces it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::address::ResourceAddress;
use crate::config::{ConfigHasher, DeployConfig, ResolvedConfig, resolve};
use crate::context::EngineContext;
use crate::engine::{
    ApplyExecutor, CancelSignal, NodeStatus, ProgressHook, RetryPolicy, TracingHook, WalkResult,
    Walker,
};
use crate::error::{
    ApplyError, ConfigError, ConvergeError, PlanError, ProviderError, Result, StateError,
};
use crate::planner::{Action, Plan, PlanMode, PlanRequest, Planner, ReplaceReason};
use crate::provider::{ObjectState, ProviderFailure, ProviderRegistry};
use crate::state::{
    HistoryEntry, LockInfo, ResourceInstanceState, RunOperation, StateSnapshot, StateStore,
    WorkingState, acquire_with_wait, generate_holder_id,
};

/// Options for plan, apply and destroy.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Read every recorded instance from its provider before planning.
    pub refresh: bool,
    /// Instances to replace even if their configuration is unchanged.
    pub replace: Vec<ResourceAddress>,
}

/// Outcome of an apply or destroy.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Operation performed.
    pub operation: RunOperation,
    /// Instances created.
    pub created: usize,
    /// Instances updated in place.
    pub updated: usize,
    /// Instances replaced.
    pub replaced: usize,
    /// Instances destroyed.
    pub destroyed: usize,
    /// Data sources read.
    pub read: usize,
    /// Nodes that failed.
    pub errored: usize,
    /// Nodes that never ran.
    pub skipped: usize,
    /// Extra planning rounds caused by providers refusing an update.
    pub replans: u32,
    /// Whether the walk was interrupted.
    pub cancelled: bool,
    /// One line per error, guardrail violation or refresh failure.
    pub diagnostics: Vec<String>,
    /// Serial of the persisted state, if any state exists.
    pub final_serial: Option<u64>,
    /// Set when the state lock could not be released.
    pub lock_diagnostic: Option<String>,
}

/// Outcome of a refresh.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    /// Instances whose recorded attributes changed.
    pub updated: Vec<ResourceAddress>,
    /// Instances that no longer exist and were dropped.
    pub removed: Vec<ResourceAddress>,
    /// Instances that could not be read.
    pub errors: Vec<String>,
    /// Serial of the persisted state.
    pub final_serial: Option<u64>,
    /// Set when the state lock could not be released.
    pub lock_diagnostic: Option<String>,
}

/// How a recorded instance differs from the real object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// Attributes changed outside of converge.
    Changed,
    /// The object no longer exists.
    Missing,
}

/// One drifted instance.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Instance address.
    pub address: ResourceAddress,
    /// Kind of drift.
    pub kind: DriftKind,
    /// Top-level attributes that differ.
    pub attributes: Vec<String>,
}

/// Report of drift detection.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Whether drift was detected.
    pub has_drift: bool,
    /// Drifted instances.
    pub drifted: Vec<DriftEntry>,
    /// Number of managed instances checked.
    pub checked: usize,
    /// Instances that could not be read.
    pub errors: Vec<String>,
}

/// Outcome of import and `state rm`.
#[derive(Debug, Clone, Serialize)]
pub struct StateReport {
    /// Operation performed.
    pub operation: RunOperation,
    /// Addresses affected.
    pub addresses: Vec<ResourceAddress>,
    /// Serial of the persisted state.
    pub final_serial: u64,
    /// Set when the state lock could not be released.
    pub lock_diagnostic: Option<String>,
}

/// Drives runs against one configuration and one state store.
pub struct Orchestrator {
    config: DeployConfig,
    ctx: Arc<EngineContext>,
    store: Arc<dyn StateStore>,
    hook: Arc<dyn ProgressHook>,
    holder: String,
    hasher: ConfigHasher,
}

impl RunReport {
    fn new(operation: RunOperation) -> Self {
        Self {
            operation,
            created: 0,
            updated: 0,
            replaced: 0,
            destroyed: 0,
            read: 0,
            errored: 0,
            skipped: 0,
            replans: 0,
            cancelled: false,
            diagnostics: Vec::new(),
            final_serial: None,
            lock_diagnostic: None,
        }
    }

    /// Returns true if every node converged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.diagnostics.is_empty() && !self.cancelled
    }

    fn add_completed(&mut self, result: &WalkResult) {
        self.created += result.count(Action::Create, NodeStatus::Complete);
        self.updated += result.count(Action::Update, NodeStatus::Complete);
        self.replaced += result.count(Action::Replace, NodeStatus::Complete);
        self.destroyed += result.count(Action::Delete, NodeStatus::Complete);
        self.read += result.count(Action::Read, NodeStatus::Complete);
    }

    fn add_failures(&mut self, result: &WalkResult) {
        self.errored = result.errors.len();
        self.skipped = result.skipped.len();
        self.cancelled = result.cancelled;
        self.diagnostics.extend(result.errors.iter().map(ToString::to_string));
    }
}

impl DriftReport {
    /// Returns true if every instance matches its real object.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift && self.errors.is_empty()
    }
}

fn changed_addresses(before: &StateSnapshot, after: &StateSnapshot) -> Vec<String> {
    let addresses: BTreeSet<&ResourceAddress> =
        before.resources.keys().chain(after.resources.keys()).collect();
    addresses
        .into_iter()
        .filter(|a| before.get(a) != after.get(a))
        .map(ToString::to_string)
        .collect()
}

fn changed_keys(before: &ObjectState, after: &ObjectState) -> Vec<String> {
    let keys: BTreeSet<&String> = before.attributes.keys().chain(after.attributes.keys()).collect();
    keys.into_iter()
        .filter(|k| before.attributes.get(*k) != after.attributes.get(*k))
        .cloned()
        .collect()
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(config: DeployConfig, registry: ProviderRegistry, store: Arc<dyn StateStore>) -> Self {
        let ctx = Arc::new(EngineContext::new(registry, &config));
        Self {
            config,
            ctx,
            store,
            hook: Arc::new(TracingHook),
            holder: generate_holder_id(),
            hasher: ConfigHasher::new(),
        }
    }

    /// Sets the hook that receives node progress.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn ProgressHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Replaces the retry policy built from settings.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.ctx = Arc::new(self.ctx.as_ref().clone().with_retry(retry));
        self
    }

    /// The configuration runs are planned from.
    #[must_use]
    pub const fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    async fn with_lock<T>(
        &self,
        operation: RunOperation,
        body: impl Future<Output = Result<T>>,
    ) -> Result<(T, Option<String>)> {
        let timeout = Duration::from_secs(self.ctx.settings().lock_timeout_secs);
        let lock = acquire_with_wait(self.store.as_ref(), &self.holder, &operation.to_string(), timeout).await?;
        let outcome = body.await;
        let released = self.release(&lock).await;
        outcome.map(|value| (value, released))
    }

    async fn release(&self, lock: &LockInfo) -> Option<String> {
        match self.store.release_lock(&lock.lock_id).await {
            Ok(()) => {
                debug!(lock_id = %lock.lock_id, "Released state lock");
                None
            }
            Err(e) => {
                error!(lock_id = %lock.lock_id, "Failed to release state lock: {e}");
                Some(format!("state lock {} was not released: {e}", lock.lock_id))
            }
        }
    }

    async fn read(&self) -> Result<(StateSnapshot, bool)> {
        Ok(match self.store.read_state().await? {
            Some(snapshot) => (snapshot, true),
            None => (StateSnapshot::new(), false),
        })
    }

    fn replace_map(options: &RunOptions) -> BTreeMap<ResourceAddress, ReplaceReason> {
        options
            .replace
            .iter()
            .map(|a| (a.clone(), ReplaceReason::Requested))
            .collect()
    }

    /// Computes a plan without applying it.
    ///
    /// # Errors
    ///
    /// Returns lock, state, configuration and planning errors.
    pub async fn plan(&self, mode: PlanMode, options: &RunOptions, cancel: &CancelSignal) -> Result<Plan> {
        let operation = match mode {
            PlanMode::Apply => RunOperation::Apply,
            PlanMode::Destroy => RunOperation::Destroy,
        };
        let (plan, released) = self
            .with_lock(operation, async {
                let resolved = resolve(&self.config)?;
                let (mut snapshot, _) = self.read().await?;
                if options.refresh {
                    let refresh = self.refresh_snapshot(&mut snapshot, cancel).await;
                    for problem in &refresh.errors {
                        warn!("Refresh failed: {problem}");
                    }
                }
                let replace = Self::replace_map(options);
                let config_hash = self.hasher.hash_config(&self.config);
                Planner::new(&self.ctx)
                    .with_cancellation(cancel.hard_token().clone())
                    .plan(PlanRequest {
                        config: &resolved,
                        state: &snapshot,
                        mode,
                        replace: &replace,
                        config_hash: &config_hash,
                        max_destroy: self.config.max_destroy(),
                    })
                    .await
            })
            .await?;
        if let Some(problem) = released {
            warn!("{problem}");
        }
        Ok(plan)
    }

    /// Converges real objects and state towards the configuration.
    ///
    /// # Errors
    ///
    /// Returns lock, state, configuration and planning errors. Node
    /// failures are not errors; they are counted in the report.
    pub async fn apply(&self, options: &RunOptions, cancel: &CancelSignal) -> Result<RunReport> {
        self.converge(RunOperation::Apply, PlanMode::Apply, options, cancel).await
    }

    /// Deletes every recorded instance.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::apply`].
    pub async fn destroy(&self, options: &RunOptions, cancel: &CancelSignal) -> Result<RunReport> {
        self.converge(RunOperation::Destroy, PlanMode::Destroy, options, cancel).await
    }

    async fn converge(
        &self,
        operation: RunOperation,
        mode: PlanMode,
        options: &RunOptions,
        cancel: &CancelSignal,
    ) -> Result<RunReport> {
        info!(project = %self.config.project.name, "Starting {operation}");
        let (mut report, released) = self
            .with_lock(operation, self.converge_locked(operation, mode, options, cancel))
            .await?;
        report.lock_diagnostic = released;
        info!(
            created = report.created,
            updated = report.updated,
            replaced = report.replaced,
            destroyed = report.destroyed,
            errored = report.errored,
            "Finished {operation}"
        );
        Ok(report)
    }

    async fn converge_locked(
        &self,
        operation: RunOperation,
        mode: PlanMode,
        options: &RunOptions,
        cancel: &CancelSignal,
    ) -> Result<RunReport> {
        let resolved = Arc::new(resolve(&self.config)?);
        let config_hash = self.hasher.hash_config(&self.config);
        let (mut snapshot, existed) = self.read().await?;
        let recorded = snapshot.clone();
        let mut report = RunReport::new(operation);

        if options.refresh {
            let refresh = self.refresh_snapshot(&mut snapshot, cancel).await;
            report.diagnostics.extend(refresh.errors);
        }

        let working = WorkingState::new(snapshot);
        let outcome = self
            .plan_and_walk(mode, options, cancel, &resolved, &working, &config_hash, &mut report)
            .await;

        // Whatever was applied is persisted, even if a later round failed.
        let mut final_state = working.snapshot().await;
        let changed = changed_addresses(&recorded, &final_state);
        if !changed.is_empty() || report.errored > 0 {
            let entry = if report.is_success() && outcome.is_ok() {
                HistoryEntry::new(operation, &config_hash, changed)
            } else {
                let message = match &outcome {
                    Err(e) => e.to_string(),
                    Ok(()) => report.diagnostics.join("; "),
                };
                HistoryEntry::failed(operation, &config_hash, changed, &message)
            };
            final_state.add_history(entry);
        }

        if existed || !final_state.same_content(&recorded) {
            match self.store.write_state(&final_state).await {
                Ok(serial) => report.final_serial = Some(serial),
                Err(e) => {
                    error!("Failed to persist state: {e}");
                    report.diagnostics.push(format!("state could not be persisted: {e}"));
                }
            }
        }

        outcome.map(|()| report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn plan_and_walk(
        &self,
        mode: PlanMode,
        options: &RunOptions,
        cancel: &CancelSignal,
        resolved: &Arc<ResolvedConfig>,
        working: &WorkingState,
        config_hash: &str,
        report: &mut RunReport,
    ) -> Result<()> {
        let executor = ApplyExecutor::new(
            Arc::clone(&self.ctx),
            Arc::clone(resolved),
            working.clone(),
            cancel.hard_token().clone(),
        );
        let walker = Walker::new(executor, self.ctx.registry().clone(), Arc::clone(&self.hook))
            .with_parallelism(self.ctx.parallelism())
            .with_grace(Duration::from_secs(self.ctx.settings().hard_cancel_grace_secs));
        let planner = Planner::new(&self.ctx).with_cancellation(cancel.hard_token().clone());
        let max_replans = self.ctx.settings().max_replan_attempts;
        let mut replace = Self::replace_map(options);
        let mut round = 0u32;

        loop {
            round += 1;
            let current = working.snapshot().await;
            let plan = planner
                .plan(PlanRequest {
                    config: resolved.as_ref(),
                    state: &current,
                    mode,
                    replace: &replace,
                    config_hash,
                    max_destroy: self.config.max_destroy(),
                })
                .await?;

            if !plan.passes_guardrails() {
                for violation in &plan.violations {
                    error!("{violation}");
                }
                report.diagnostics.extend(plan.violations.iter().map(ToString::to_string));
                return Ok(());
            }

            for address in &plan.orphaned_data {
                working.remove(address).await;
            }
            info!("{}", plan.summary);

            let result = walker.walk(&plan.graph, cancel).await;
            report.add_completed(&result);

            let replan = result.replan_addresses();
            let only_replans = !replan.is_empty() && replan.len() == result.errors.len();
            if !only_replans || result.cancelled {
                report.add_failures(&result);
                return Ok(());
            }
            if round > max_replans {
                report.add_failures(&result);
                report
                    .diagnostics
                    .push(PlanError::ReplanExhausted { attempts: round }.to_string());
                return Ok(());
            }

            info!(round, "Re-planning {} instances as replacements", replan.len());
            report.replans += 1;
            for address in replan {
                replace.insert(address, ReplaceReason::ProviderRequested);
            }
        }
    }

    /// Reads every recorded instance from its provider and records what
    /// it finds. Instances that no longer exist are dropped.
    ///
    /// # Errors
    ///
    /// Returns lock and state errors. Instances that cannot be read are
    /// listed in the report and keep their recorded attributes.
    pub async fn refresh(&self, cancel: &CancelSignal) -> Result<RefreshReport> {
        let (mut report, released) = self
            .with_lock(RunOperation::Refresh, async {
                let (mut snapshot, existed) = self.read().await?;
                let recorded = snapshot.clone();
                let mut report = self.refresh_snapshot(&mut snapshot, cancel).await;
                let changed = changed_addresses(&recorded, &snapshot);
                if !changed.is_empty() {
                    let hash = self.hasher.hash_config(&self.config);
                    snapshot.add_history(HistoryEntry::new(RunOperation::Refresh, &hash, changed));
                }
                if existed {
                    report.final_serial = Some(self.store.write_state(&snapshot).await?);
                }
                Ok::<_, ConvergeError>(report)
            })
            .await?;
        report.lock_diagnostic = released;
        Ok(report)
    }

    async fn refresh_snapshot(&self, snapshot: &mut StateSnapshot, cancel: &CancelSignal) -> RefreshReport {
        let mut report = RefreshReport::default();
        let addresses: Vec<ResourceAddress> = snapshot.managed_addresses().cloned().collect();

        for address in addresses {
            if cancel.is_cancelled() {
                report.errors.push(format!("{address}: refresh cancelled"));
                continue;
            }
            let Some(mut instance) = snapshot.get(&address).cloned() else {
                continue;
            };
            match self.read_instance(&address, &instance, cancel).await {
                Ok(Some(object)) => {
                    if object.attributes != instance.attributes || object.private != instance.private {
                        debug!(address = %address, "Recorded attributes changed remotely");
                        instance.set_object(object);
                        snapshot.insert(address.clone(), instance);
                        report.updated.push(address);
                    }
                }
                Ok(None) => {
                    warn!(address = %address, "Object no longer exists, dropping it from state");
                    snapshot.remove(&address);
                    report.removed.push(address);
                }
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        report
    }

    async fn read_instance(
        &self,
        address: &ResourceAddress,
        instance: &ResourceInstanceState,
        cancel: &CancelSignal,
    ) -> Result<Option<ObjectState>> {
        let provider = self.ctx.provider(&instance.provider, address)?;
        let current = instance.object();
        let object = self
            .ctx
            .retry()
            .run(address, "read", cancel.hard_token(), || {
                let provider = Arc::clone(&provider);
                let address = address.clone();
                let current = current.clone();
                async move { provider.read(address, current).await.map_err(ProviderFailure::from) }
            })
            .await?;
        Ok(object)
    }

    /// Compares recorded instances with their real objects without
    /// writing anything.
    ///
    /// # Errors
    ///
    /// Returns state read errors.
    pub async fn drift(&self, cancel: &CancelSignal) -> Result<DriftReport> {
        let (mut snapshot, _) = self.read().await?;
        let recorded = snapshot.clone();
        let refresh = self.refresh_snapshot(&mut snapshot, cancel).await;

        let mut drifted = Vec::new();
        for address in refresh.updated {
            let attributes = match (recorded.get(&address), snapshot.get(&address)) {
                (Some(before), Some(after)) => changed_keys(&before.object(), &after.object()),
                _ => Vec::new(),
            };
            drifted.push(DriftEntry {
                address,
                kind: DriftKind::Changed,
                attributes,
            });
        }
        drifted.extend(refresh.removed.into_iter().map(|address| DriftEntry {
            address,
            kind: DriftKind::Missing,
            attributes: Vec::new(),
        }));

        Ok(DriftReport {
            has_drift: !drifted.is_empty(),
            drifted,
            checked: recorded.managed_addresses().count(),
            errors: refresh.errors,
        })
    }

    /// Adopts an existing object into state under `address`.
    ///
    /// # Errors
    ///
    /// Fails if the address is not configured or already recorded, or if
    /// the provider cannot find the object.
    pub async fn import(&self, address: &ResourceAddress, id: &str, cancel: &CancelSignal) -> Result<StateReport> {
        let (final_serial, released) = self
            .with_lock(RunOperation::Import, async {
                let resolved = resolve(&self.config)?;
                let resource = resolved.get(address).ok_or_else(|| {
                    ConfigError::validation(format!("{address} is not declared in the configuration"), "import")
                })?;
                if address.is_data() {
                    return Err(ConfigError::validation("data sources cannot be imported", "import").into());
                }

                let (mut snapshot, _) = self.read().await?;
                if snapshot.get(address).is_some() {
                    return Err(StateError::AlreadyManaged {
                        address: address.clone(),
                    }
                    .into());
                }

                let provider = self.ctx.provider(&resource.provider, address)?;
                let schema = self.ctx.registry().resource_schema(&resource.provider, address)?;
                let token = cancel.hard_token();
                let imported = self
                    .ctx
                    .retry()
                    .run(address, "import", token, || {
                        let provider = Arc::clone(&provider);
                        let resource_type = address.resource_type().to_string();
                        let id = id.to_string();
                        async move {
                            provider
                                .import_state(resource_type, id)
                                .await
                                .map_err(ProviderFailure::from)
                        }
                    })
                    .await?;

                let mut instance = ResourceInstanceState::new(&resource.provider, schema.version, imported);
                let object = self
                    .read_instance(address, &instance, cancel)
                    .await?
                    .ok_or_else(|| ApplyError::OperationFailed {
                        address: address.clone(),
                        operation: "import",
                        source: ProviderError::NotFound,
                        partial: None,
                    })?;
                instance.set_object(object);
                instance.dependencies = resource
                    .all_dependencies()
                    .cloned()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();

                info!(address = %address, id, "Imported existing object");
                snapshot.insert(address.clone(), instance);
                let hash = self.hasher.hash_config(&self.config);
                snapshot.add_history(HistoryEntry::new(RunOperation::Import, &hash, vec![address.to_string()]));
                self.store.write_state(&snapshot).await
            })
            .await?;

        Ok(StateReport {
            operation: RunOperation::Import,
            addresses: vec![address.clone()],
            final_serial,
            lock_diagnostic: released,
        })
    }

    /// Forgets instances without touching their real objects.
    ///
    /// # Errors
    ///
    /// Fails without changing anything if any address is not recorded.
    pub async fn state_rm(&self, addresses: &[ResourceAddress]) -> Result<StateReport> {
        let (final_serial, released) = self
            .with_lock(RunOperation::StateRm, async {
                let (mut snapshot, _) = self.read().await?;
                if let Some(missing) = addresses.iter().find(|a| snapshot.get(a).is_none()) {
                    return Err(StateError::InstanceNotFound {
                        address: missing.clone(),
                    }
                    .into());
                }
                for address in addresses {
                    snapshot.remove(address);
                    info!(address = %address, "Removed from state");
                }
                let hash = self.hasher.hash_config(&self.config);
                let removed = addresses.iter().map(ToString::to_string).collect();
                snapshot.add_history(HistoryEntry::new(RunOperation::StateRm, &hash, removed));
                self.store.write_state(&snapshot).await
            })
            .await?;

        Ok(StateReport {
            operation: RunOperation::StateRm,
            addresses: addresses.to_vec(),
            final_serial,
            lock_diagnostic: released,
        })
    }

    /// Reads the persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns backend and deserialization errors.
    pub async fn show(&self) -> Result<Option<StateSnapshot>> {
        self.store.read_state().await
    }

    /// Current lock holder, if any.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    pub async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.store.get_lock_info().await
    }

    /// Removes a lock left behind by another process.
    ///
    /// # Errors
    ///
    /// Fails if the state is not locked or `lock_id` does not match.
    pub async fn force_unlock(&self, lock_id: &str) -> Result<()> {
        self.store.force_unlock(lock_id).await?;
        warn!(lock_id, "State lock forcibly removed");
        Ok(())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.cancelled {
            "cancelled"
        } else if self.is_success() {
            "complete"
        } else {
            "failed"
        };
        writeln!(f, "{} {status}:", capitalize(&self.operation.to_string()))?;
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Replaced: {}", self.replaced)?;
        writeln!(f, "  Destroyed: {}", self.destroyed)?;
        writeln!(f, "  Errored: {}", self.errored)?;
        writeln!(f, "  Skipped: {}", self.skipped)?;
        if let Some(serial) = self.final_serial {
            writeln!(f, "  State serial: {serial}")?;
        }

        if !self.diagnostics.is_empty() {
            writeln!(f, "  Errors:")?;
            for diagnostic in &self.diagnostics {
                writeln!(f, "    - {diagnostic}")?;
            }
        }
        if let Some(lock) = &self.lock_diagnostic {
            writeln!(f, "  Warning: {lock}")?;
        }

        Ok(())
    }
}

impl fmt::Display for RefreshReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Refresh: {} updated, {} removed, {} failed",
            self.updated.len(),
            self.removed.len(),
            self.errors.len()
        )?;
        for address in &self.updated {
            writeln!(f, "  ~ {address}")?;
        }
        for address in &self.removed {
            writeln!(f, "  - {address}")?;
        }
        for problem in &self.errors {
            writeln!(f, "  ! {problem}")?;
        }
        Ok(())
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_drift {
            writeln!(f, "Drift detected:")?;
            for entry in &self.drifted {
                match entry.kind {
                    DriftKind::Changed => writeln!(f, "  ~ {} ({})", entry.address, entry.attributes.join(", "))?,
                    DriftKind::Missing => writeln!(f, "  - {} (no longer exists)", entry.address)?,
                }
            }
        } else {
            writeln!(f, "No drift detected across {} instances", self.checked)?;
        }
        for problem in &self.errors {
            writeln!(f, "  ! {problem}")?;
        }
        Ok(())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars
        .next()
        .map(|c| c.to_uppercase().chain(chars).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::provider::Provider;
    use crate::state::{InstanceStatus, MemoryStateStore};
    use crate::testing::{FakeProvider, ReadOnlyStore};
    use crate::value::{Attributes, Value};

    const TWO: &str = "
project:
  name: demo
resources:
  - type: null_resource
    name: a
    attributes:
      size: 1
  - type: null_resource
    name: b
    attributes:
      name: \"${null_resource.a.id}\"
";

    fn setup(yaml: &str, fake: &Arc<FakeProvider>, store: &Arc<MemoryStateStore>) -> Orchestrator {
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register("null", Arc::clone(fake) as Arc<dyn Provider>);
        let retry = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..RetryPolicy::default()
        };
        Orchestrator::new(config, registry, Arc::clone(store) as Arc<dyn StateStore>).with_retry(retry)
    }

    fn addr(name: &str) -> ResourceAddress {
        ResourceAddress::new("null_resource", name)
    }

    #[tokio::test]
    async fn test_apply_then_reapply_is_noop() {
        let fake = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = setup(TWO, &fake, &store);

        let report = orchestrator.apply(&RunOptions::default(), &CancelSignal::new()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.created, 2);
        assert_eq!(report.final_serial, Some(1));

        let state = store.read_state().await.unwrap().unwrap();
        let b = state.get(&addr("b")).unwrap();
        assert_eq!(b.attributes.get("name"), Some(&Value::string("id-a")));
        assert_eq!(state.history.len(), 1);

        let calls = fake.total_calls();
        let again = orchestrator.apply(&RunOptions::default(), &CancelSignal::new()).await.unwrap();
        assert!(again.is_success());
        assert_eq!(again.created + again.updated + again.replaced, 0);
        assert_eq!(again.final_serial, Some(1));
        assert_eq!(fake.total_calls(), calls);
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_create_is_persisted_tainted() {
        let fake = Arc::new(FakeProvider::new().fail_with_partial("null_resource.a"));
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = setup(TWO, &fake, &store);

        let report = orchestrator.apply(&RunOptions::default(), &CancelSignal::new()).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.errored, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(fake.calls_for("null_resource.b"), 0);

        let state = store.read_state().await.unwrap().unwrap();
        let a = state.get(&addr("a")).unwrap();
        assert_eq!(a.attributes.get("id"), Some(&Value::string("partial")));
        assert_eq!(a.status, InstanceStatus::Tainted);
        assert!(state.get(&addr("b")).is_none());
        assert!(!state.history.last().unwrap().success);
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_provider_replace_request_triggers_replan() {
        let fake = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        setup(TWO, &fake, &store)
            .apply(&RunOptions::default(), &CancelSignal::new())
            .await
            .unwrap();

        let fake = Arc::new(FakeProvider::new().require_replace_once("null_resource.a"));
        let changed = TWO.replace("size: 1", "size: 2");
        let report = setup(&changed, &fake, &store)
            .apply(&RunOptions::default(), &CancelSignal::new())
            .await
            .unwrap();

        assert!(report.is_success(), "{report}");
        assert_eq!(report.replans, 1);
        assert_eq!(report.replaced, 1);
        assert_eq!(fake.calls("delete"), 1);
        let state = store.read_state().await.unwrap().unwrap();
        assert_eq!(state.get(&addr("a")).unwrap().attributes.get("size"), Some(&Value::Number(2.0)));
    }

    #[tokio::test]
    async fn test_replan_gives_up_after_limit() {
        let store = Arc::new(MemoryStateStore::new());
        let fake = Arc::new(FakeProvider::new());
        setup(TWO, &fake, &store)
            .apply(&RunOptions::default(), &CancelSignal::new())
            .await
            .unwrap();

        let fake = Arc::new(FakeProvider::new().require_replace_once("null_resource.a"));
        let changed = TWO.replace("size: 1", "size: 2").replace("name: demo", "name: demo\nsettings:\n  max_replan_attempts: 0");
        let report = setup(&changed, &fake, &store)
            .apply(&RunOptions::default(), &CancelSignal::new())
            .await
            .unwrap();
        assert!(!report.is_success());
        assert!(report.diagnostics.iter().any(|d| d.contains("Replanning gave up")));
    }

    #[tokio::test]
    async fn test_replacing_a_chain_destroys_dependents_first() {
        let fake = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = setup(TWO, &fake, &store);
        orchestrator.apply(&RunOptions::default(), &CancelSignal::new()).await.unwrap();

        let before = fake.call_log().len();
        let options = RunOptions {
            replace: vec![addr("a"), addr("b")],
            ..RunOptions::default()
        };
        let report = orchestrator.apply(&options, &CancelSignal::new()).await.unwrap();
        assert!(report.is_success(), "{report}");
        assert_eq!(report.replaced, 2);
        assert_eq!(report.destroyed, 0);

        let log: Vec<String> = fake.call_log()[before..]
            .iter()
            .map(|(op, address)| format!("{op} {address}"))
            .collect();
        let position = |entry: &str| log.iter().position(|l| l == entry).unwrap();
        assert!(position("delete null_resource.b") < position("delete null_resource.a"));
        assert!(position("delete null_resource.a") < position("create null_resource.a"));
        assert!(position("create null_resource.a") < position("create null_resource.b"));

        let state = store.read_state().await.unwrap().unwrap();
        assert_eq!(state.get(&addr("b")).unwrap().dependencies, vec![addr("a")]);
    }

    #[tokio::test]
    async fn test_failed_state_write_keeps_report() {
        let fake = Arc::new(FakeProvider::new().fail("null_resource.b"));
        let store = Arc::new(ReadOnlyStore::default());
        let config = ConfigParser::new().parse_yaml(TWO, None).unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register("null", Arc::clone(&fake) as Arc<dyn Provider>);
        let orchestrator = Orchestrator::new(config, registry, Arc::clone(&store) as Arc<dyn StateStore>);

        let report = orchestrator.apply(&RunOptions::default(), &CancelSignal::new()).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.created, 1);
        assert_eq!(report.errored, 1);
        assert_eq!(report.final_serial, None);
        assert!(report.diagnostics.iter().any(|d| d.contains("null_resource.b")));
        assert!(report.diagnostics.iter().any(|d| d.contains("state could not be persisted")));
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_flaky_provider_is_retried() {
        let fake = Arc::new(FakeProvider::new().flaky("null_resource.a", 2));
        let store = Arc::new(MemoryStateStore::new());
        let report = setup(TWO, &fake, &store)
            .apply(&RunOptions::default(), &CancelSignal::new())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(fake.calls_for("null_resource.a"), 3);
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let fake = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = setup(TWO, &fake, &store);
        orchestrator.apply(&RunOptions::default(), &CancelSignal::new()).await.unwrap();

        let report = orchestrator.destroy(&RunOptions::default(), &CancelSignal::new()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.destroyed, 2);
        let state = store.read_state().await.unwrap().unwrap();
        assert!(state.resources.is_empty());
        assert_eq!(state.serial, 2);
    }

    #[tokio::test]
    async fn test_prevent_destroy_blocks_destroy() {
        let yaml = "
project:
  name: demo
resources:
  - type: null_resource
    name: a
    lifecycle:
      prevent_destroy: true
";
        let fake = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = setup(yaml, &fake, &store);
        orchestrator.apply(&RunOptions::default(), &CancelSignal::new()).await.unwrap();

        let report = orchestrator.destroy(&RunOptions::default(), &CancelSignal::new()).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(fake.calls("delete"), 0);
        assert!(report.diagnostics[0].contains("prevent_destroy"));
    }

    #[tokio::test]
    async fn test_held_lock_aborts_before_provider_calls() {
        let fake = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let held = store.acquire_lock("someone-else", "apply").await.unwrap();

        let err = setup(TWO, &fake, &store)
            .apply(&RunOptions::default(), &CancelSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::LockedByOther { .. })));
        assert_eq!(fake.total_calls(), 0);
        assert_eq!(store.get_lock_info().await.unwrap().unwrap().lock_id, held.lock_id);
    }

    #[tokio::test]
    async fn test_refresh_drops_missing_objects() {
        let fake = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = setup(TWO, &fake, &store);
        orchestrator.apply(&RunOptions::default(), &CancelSignal::new()).await.unwrap();

        fake.drop_remote("id-b");
        let report = orchestrator.refresh(&CancelSignal::new()).await.unwrap();
        assert_eq!(report.removed, vec![addr("b")]);
        assert_eq!(report.final_serial, Some(2));
        let state = store.read_state().await.unwrap().unwrap();
        assert!(state.get(&addr("b")).is_none());
        assert!(state.get(&addr("a")).is_some());
    }

    #[tokio::test]
    async fn test_drift_reports_without_writing() {
        let fake = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = setup(TWO, &fake, &store);
        orchestrator.apply(&RunOptions::default(), &CancelSignal::new()).await.unwrap();

        let recorded = store.read_state().await.unwrap().unwrap();
        let mut changed = recorded.get(&addr("a")).unwrap().attributes.clone();
        changed.insert("size".to_string(), Value::Number(9.0));
        fake.put_remote("id-a", changed);

        let report = orchestrator.drift(&CancelSignal::new()).await.unwrap();
        assert!(report.has_drift);
        assert_eq!(report.drifted.len(), 1);
        assert_eq!(report.drifted[0].address, addr("a"));
        assert_eq!(report.drifted[0].attributes, vec!["size".to_string()]);
        assert_eq!(store.read_state().await.unwrap().unwrap().serial, 1);
    }

    #[tokio::test]
    async fn test_import_adopts_existing_object() {
        let fake = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = setup(TWO, &fake, &store);

        let mut remote = Attributes::new();
        remote.insert("id".to_string(), Value::string("existing"));
        remote.insert("size".to_string(), Value::Number(1.0));
        fake.put_remote("existing", remote);

        let report = orchestrator.import(&addr("a"), "existing", &CancelSignal::new()).await.unwrap();
        assert_eq!(report.final_serial, 1);
        let state = store.read_state().await.unwrap().unwrap();
        assert_eq!(state.get(&addr("a")).unwrap().attributes.get("id"), Some(&Value::string("existing")));

        let err = orchestrator.import(&addr("a"), "existing", &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::AlreadyManaged { .. })));
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_state_rm_is_all_or_nothing() {
        let fake = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = setup(TWO, &fake, &store);
        orchestrator.apply(&RunOptions::default(), &CancelSignal::new()).await.unwrap();

        let err = orchestrator.state_rm(&[addr("a"), addr("zzz")]).await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::InstanceNotFound { .. })));
        assert_eq!(store.read_state().await.unwrap().unwrap().resources.len(), 2);

        let report = orchestrator.state_rm(&[addr("b")]).await.unwrap();
        assert_eq!(report.final_serial, 2);
        assert_eq!(fake.calls("delete"), 0);
        assert!(store.read_state().await.unwrap().unwrap().get(&addr("b")).is_none());
    }

    #[tokio::test]
    async fn test_force_unlock_requires_matching_id() {
        let fake = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = setup(TWO, &fake, &store);
        let held = store.acquire_lock("crashed-run", "apply").await.unwrap();

        assert!(orchestrator.force_unlock("wrong").await.is_err());
        assert_eq!(orchestrator.lock_info().await.unwrap().unwrap().holder, "crashed-run");
        orchestrator.force_unlock(&held.lock_id).await.unwrap();
        assert!(orchestrator.lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_plan_leaves_state_untouched() {
        let fake = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = setup(TWO, &fake, &store);

        let plan = orchestrator
            .plan(PlanMode::Apply, &RunOptions::default(), &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(plan.summary.create, 2);
        assert_eq!(fake.total_calls(), 0);
        assert!(store.read_state().await.unwrap().is_none());
        assert!(!store.is_locked().await.unwrap());
    }
}
