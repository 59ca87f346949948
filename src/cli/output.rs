//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::engine::{NodeStatus, ProgressEvent, ProgressHook};
use crate::orchestrator::{DriftKind, DriftReport, RefreshReport, RunReport, StateReport};
use crate::planner::{Action, Change, Plan};
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct PlanChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Recorded instance row for table display.
#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn json<T: Serialize + ?Sized>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&PlanJson::from(plan)),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &Plan) -> String {
        if !plan.has_changes() {
            return format!("{} No changes required - infrastructure is up to date.\n", "✓".green());
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan ({})\n", plan.mode);
        let _ = write!(
            output,
            "   Config hash: {}\n\n",
            &plan.config_hash[..8.min(plan.config_hash.len())]
        );

        let changes: Vec<&Change> = plan
            .changes()
            .into_iter()
            .filter(|c| c.action.is_change() && c.action != Action::Read)
            .collect();
        let rows: Vec<PlanChangeRow> = changes
            .iter()
            .enumerate()
            .map(|(i, c)| PlanChangeRow {
                index: i + 1,
                action: Self::format_action(c.action),
                address: c.address.to_string(),
                reason: c.replace_reason.map(|r| r.to_string()).unwrap_or_default(),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        for change in changes.iter().filter(|c| c.changed_attributes().next().is_some()) {
            let _ = writeln!(output, "\n  {} {}", change.action.symbol(), change.address.to_string().bold());
            for attr in change.changed_attributes() {
                let before = attr.render_before().unwrap_or_else(|| String::from("null"));
                let after = attr.render_after().unwrap_or_else(|| String::from("null"));
                let marker = if attr.forces_replacement {
                    " # forces replacement".red().to_string()
                } else {
                    String::new()
                };
                let _ = writeln!(output, "      {}: {before} -> {after}{marker}", attr.path);
            }
        }

        let summary = &plan.summary;
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().yellow(),
            summary.delete.to_string().red()
        );

        if !plan.passes_guardrails() {
            let _ = write!(output, "\n{} Guardrail violations:\n", "⚠".yellow());
            for violation in &plan.violations {
                let _ = writeln!(output, "   - {violation}");
            }
        }

        output
    }

    /// Formats the outcome of apply or destroy.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                let operation = report.operation.to_string();
                let status = if report.cancelled {
                    format!("{} {operation} cancelled", "⚠".yellow())
                } else if report.is_success() {
                    format!("{} {operation} complete", "✓".green())
                } else {
                    format!("{} {operation} failed", "✗".red())
                };

                let mut output = format!("\n{status}\n\n");
                let _ = writeln!(output, "   Created: {}", report.created);
                let _ = writeln!(output, "   Updated: {}", report.updated);
                let _ = writeln!(output, "   Replaced: {}", report.replaced);
                let _ = writeln!(output, "   Destroyed: {}", report.destroyed);
                let _ = writeln!(output, "   Errored: {}", report.errored);
                let _ = writeln!(output, "   Skipped: {}", report.skipped);
                if report.replans > 0 {
                    let _ = writeln!(output, "   Re-planned: {}", report.replans);
                }
                if let Some(serial) = report.final_serial {
                    let _ = writeln!(output, "   State serial: {serial}");
                }

                if !report.diagnostics.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for diagnostic in &report.diagnostics {
                        let _ = writeln!(output, "   - {diagnostic}");
                    }
                }
                if let Some(lock) = &report.lock_diagnostic {
                    let _ = writeln!(output, "\n{} {lock}", "⚠".yellow());
                }

                output
            }
        }
    }

    /// Formats a refresh report.
    #[must_use]
    pub fn format_refresh(&self, report: &RefreshReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                let mut output = report.to_string();
                if let Some(serial) = report.final_serial {
                    let _ = writeln!(output, "State serial: {serial}");
                }
                if let Some(lock) = &report.lock_diagnostic {
                    let _ = writeln!(output, "{} {lock}", "⚠".yellow());
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected across {} instances.\n",
                        "✓".green(),
                        report.checked
                    );
                }

                let mut output = String::new();
                if report.has_drift {
                    let _ = write!(output, "{} Drift detected:\n\n", "⚠".yellow());
                    for entry in &report.drifted {
                        match entry.kind {
                            DriftKind::Changed => {
                                let _ = writeln!(
                                    output,
                                    "   ~ {} ({})",
                                    entry.address,
                                    entry.attributes.join(", ")
                                );
                            }
                            DriftKind::Missing => {
                                let _ = writeln!(output, "   - {} (no longer exists)", entry.address);
                            }
                        }
                    }
                    let _ = write!(
                        output,
                        "\n{}/{} instances have drifted.\n",
                        report.drifted.len(),
                        report.checked
                    );
                }
                for problem in &report.errors {
                    let _ = writeln!(output, "{} {problem}", "✗".red());
                }
                output
            }
        }
    }

    /// Formats the outcome of import or `state rm`.
    #[must_use]
    pub fn format_state_report(&self, report: &StateReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                let addresses: Vec<String> = report.addresses.iter().map(ToString::to_string).collect();
                let mut output = format!(
                    "{} {} {} (state serial {})\n",
                    "✓".green(),
                    report.operation,
                    addresses.join(", "),
                    report.final_serial
                );
                if let Some(lock) = &report.lock_diagnostic {
                    let _ = writeln!(output, "{} {lock}", "⚠".yellow());
                }
                output
            }
        }
    }

    /// Formats a state snapshot.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => Self::json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState {}\n\n", state.lineage);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Instances: {}\n", state.resources.len());

                if !state.resources.is_empty() {
                    let rows: Vec<InstanceRow> = state
                        .resources
                        .iter()
                        .map(|(address, instance)| InstanceRow {
                            address: address.to_string(),
                            provider: instance.provider.clone(),
                            status: instance.status.to_string(),
                            id: instance
                                .attributes
                                .get("id")
                                .and_then(|v| v.as_str())
                                .map(|id| Self::truncate(id, 24))
                                .unwrap_or_default(),
                            updated: instance.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats the recorded addresses, one per line.
    #[must_use]
    pub fn format_state_list(&self, state: &StateSnapshot) -> String {
        let addresses: Vec<String> = state.resources.keys().map(ToString::to_string).collect();
        match self.format {
            OutputFormat::Json => Self::json(&addresses),
            OutputFormat::Text => addresses.iter().fold(String::new(), |mut out, a| {
                let _ = writeln!(out, "{a}");
                out
            }),
        }
    }

    /// Formats the current lock holder.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&lock),
            OutputFormat::Text => match lock {
                None => format!("{} State is not locked.\n", "✓".green()),
                Some(lock) => {
                    let mut output = format!("{} State is locked\n\n", "⚠".yellow());
                    let _ = writeln!(output, "   ID: {}", lock.lock_id);
                    let _ = writeln!(output, "   Holder: {}", lock.holder);
                    let _ = writeln!(output, "   Operation: {}", lock.operation);
                    let _ = writeln!(output, "   Acquired: {} ({}s ago)", lock.acquired_at, lock.age_secs());
                    if lock.is_stale() {
                        let _ = writeln!(
                            output,
                            "\n   The lock looks stale. If no run is active, remove it with\n   `converge state unlock {}`",
                            lock.lock_id
                        );
                    }
                    output
                }
            },
        }
    }

    /// Formats validation findings.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "valid": result.errors.is_empty(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.errors.is_empty() {
                    let _ = writeln!(output, "{} Configuration is valid!", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Configuration is invalid:", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\nWarnings:");
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats an action with color.
    fn format_action(action: Action) -> String {
        let label = format!("{}{action}", action.symbol());
        match action {
            Action::Create => label.green().to_string(),
            Action::Update => label.yellow().to_string(),
            Action::Replace => label.magenta().to_string(),
            Action::Delete => label.red().to_string(),
            Action::Read => label.cyan().to_string(),
            Action::NoOp => label.dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum length.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

/// Progress hook that prints node transitions to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleHook;

impl ProgressHook for ConsoleHook {
    fn on_event(&self, event: &ProgressEvent) {
        let address = event.address.to_string();
        let line = match event.status {
            NodeStatus::Pending | NodeStatus::Ready => return,
            NodeStatus::Running => format!("{} {address}: {}...", "…".dimmed(), event.action),
            NodeStatus::Complete => {
                if !event.action.is_change() {
                    return;
                }
                let elapsed = event.duration.unwrap_or_default();
                format!("{} {address}: {} complete after {elapsed:.1?}", "✓".green(), event.action)
            }
            NodeStatus::Errored => format!(
                "{} {address}: {}",
                "✗".red(),
                event.error.as_deref().unwrap_or("failed")
            ),
            NodeStatus::Skipped => format!(
                "{} {address}: skipped ({})",
                "-".yellow(),
                event.error.as_deref().unwrap_or("walk stopped")
            ),
        };
        eprintln!("{line}");
    }
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson<'a> {
    mode: String,
    config_hash: &'a str,
    prior_serial: u64,
    passes_guardrails: bool,
    summary: crate::planner::PlanSummary,
    changes: Vec<&'a Change>,
    violations: Vec<String>,
}

impl<'a> From<&'a Plan> for PlanJson<'a> {
    fn from(plan: &'a Plan) -> Self {
        Self {
            mode: plan.mode.to_string(),
            config_hash: &plan.config_hash,
            prior_serial: plan.prior_serial,
            passes_guardrails: plan.passes_guardrails(),
            summary: plan.summary,
            changes: plan.changes().into_iter().filter(|c| c.action.is_change()).collect(),
            violations: plan.violations.iter().map(ToString::to_string).collect(),
        }
    }
}
