//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::json_to_text;
use crate::planner::{DependencyGraph, DiffResult, DiffType, OutcomeStatus, ResourceOutcome};
use crate::reconciler::RunReport;
use crate::state::{LockInfo, ResourceStatus, StateSnapshot};

use super::commands::{GraphFormat, OutputFormat};

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Diff row for table display.
#[derive(Tabled)]
struct DiffRow {
    #[tabled(rename = "")]
    symbol: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Handle")]
    handle: String,
}

/// Run outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Result")]
    status: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Resource status row for table display.
#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Handle")]
    handle: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats the dependency graph.
    #[must_use]
    pub fn format_graph(&self, graph: &DependencyGraph, format: GraphFormat) -> String {
        if format == GraphFormat::Dot {
            return graph.to_dot();
        }

        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "apply_order": graph.apply_order(),
                    "waves": graph.waves(),
                    "edges": graph.edge_count(),
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                if format == GraphFormat::Waves {
                    for (depth, wave) in graph.waves().iter().enumerate() {
                        let _ = writeln!(output, "{} {}", format!("wave {depth}:").bold(), wave.join(", "));
                    }
                } else {
                    for (position, id) in graph.apply_order().iter().enumerate() {
                        let dependencies = graph.dependencies(id);
                        if dependencies.is_empty() {
                            let _ = writeln!(output, "{:>3}. {id}", position + 1);
                        } else {
                            let _ = writeln!(
                                output,
                                "{:>3}. {id} {}",
                                position + 1,
                                format!("<- {}", dependencies.join(", ")).dimmed()
                            );
                        }
                    }
                }
                output
            }
        }
    }

    /// Formats a diff for display.
    #[must_use]
    pub fn format_diff(&self, diff: &DiffResult, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&DiffJson::from(diff)).unwrap_or_default(),
            OutputFormat::Text => Self::format_diff_text(diff, detailed),
        }
    }

    /// Formats a diff as text.
    fn format_diff_text(diff: &DiffResult, detailed: bool) -> String {
        if !diff.has_changes() && diff.changed == 0 && diff.orphans == 0 {
            return format!(
                "{} No changes required - recorded state matches the plan.\n",
                "✓".green()
            );
        }

        let rows: Vec<DiffRow> = diff
            .diffs
            .iter()
            .filter(|d| detailed || d.diff_type != DiffType::NoChange)
            .map(|d| DiffRow {
                symbol: Self::color_diff(d.diff_type, d.diff_type.symbol()),
                resource: d.id.clone(),
                kind: d.kind.to_string(),
                action: Self::color_diff(d.diff_type, &d.diff_type.to_string()),
                handle: d.handle.as_deref().map(|h| Self::truncate(h, 48)).unwrap_or_default(),
            })
            .collect();

        let mut output = String::new();
        output.push('\n');
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to resume, {} to delete, {} unchanged\n",
            diff.creates.to_string().green(),
            diff.resumes.to_string().yellow(),
            diff.deletes.to_string().red(),
            diff.unchanged
        );

        if diff.changed > 0 {
            let _ = writeln!(
                output,
                "{} {} declaration(s) changed since they were realized; destroy them to recreate.",
                "⚠".yellow(),
                diff.changed
            );
        }
        if diff.orphans > 0 {
            let _ = writeln!(
                output,
                "{} {} recorded resource(s) are no longer declared; destroy removes them.",
                "⚠".yellow(),
                diff.orphans
            );
        }

        output
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&ReportJson::from(report)).unwrap_or_default(),
            OutputFormat::Text => {
                let rows: Vec<OutcomeRow> = report
                    .execution
                    .outcomes
                    .iter()
                    .filter(|o| o.status != OutcomeStatus::Unchanged)
                    .map(|o| OutcomeRow {
                        resource: o.id.clone(),
                        kind: o.kind.to_string(),
                        action: o.action.to_string(),
                        status: Self::format_outcome_status(o.status),
                        detail: Self::outcome_detail(o),
                    })
                    .collect();

                let mut output = String::new();
                if !rows.is_empty() {
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let headline = if report.success() {
                    format!("{} {}", "✓".green(), report.execution)
                } else if report.execution.cancelled {
                    format!("{} {}", "⚠".yellow(), report.execution)
                } else {
                    format!("{} {}", "✗".red(), report.execution)
                };
                let _ = writeln!(output, "\n{headline}");

                if !report.output_errors.is_empty() {
                    let _ = write!(output, "\n{} Unresolved outputs:\n", "⚠".yellow());
                    for error in &report.output_errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                if !report.outputs.is_empty() {
                    output.push_str("\nOutputs:\n");
                    output.push_str(&Self::format_outputs_text(&report.outputs));
                }

                output
            }
        }
    }

    /// Formats resolved outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, JsonValue>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outputs).unwrap_or_default(),
            OutputFormat::Text => Self::format_outputs_text(outputs),
        }
    }

    /// Formats a single output value.
    #[must_use]
    pub fn format_output_value(&self, value: &JsonValue) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(value).unwrap_or_default(),
            OutputFormat::Text => match value {
                JsonValue::Array(items) => items.iter().map(json_to_text).collect::<Vec<_>>().join("\n"),
                other => json_to_text(other),
            },
        }
    }

    fn format_outputs_text(outputs: &BTreeMap<String, JsonValue>) -> String {
        let mut output = String::new();
        for (name, value) in outputs {
            let rendered = match value {
                JsonValue::Array(items) => {
                    format!("[{}]", items.iter().map(json_to_text).collect::<Vec<_>>().join(", "))
                }
                other => json_to_text(other),
            };
            let _ = writeln!(output, "   {} = {rendered}", name.bold());
        }
        output
    }

    /// Formats recorded resource status.
    #[must_use]
    pub fn format_status(&self, state: &StateSnapshot, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&state.resources).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(output, "\nProject: {}/{}\n\n", state.project, state.environment);

                if state.resources.is_empty() {
                    output.push_str("   No resources recorded.\n");
                    return output;
                }

                let rows: Vec<StatusRow> = state
                    .resources
                    .values()
                    .map(|r| StatusRow {
                        resource: r.id.clone(),
                        kind: r.kind.to_string(),
                        status: Self::format_resource_status(r.status),
                        handle: r.handle.as_deref().map(|h| Self::truncate(h, 48)).unwrap_or_default(),
                        error: r.error.as_deref().map(|e| Self::truncate(e, 40)).unwrap_or_default(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let counts: Vec<String> = state
                    .status_counts()
                    .iter()
                    .map(|(status, count)| format!("{count} {status}"))
                    .collect();
                let _ = writeln!(output, "\nResources: {}", counts.join(", "));

                if detailed {
                    for record in state.resources.values().filter(|r| !r.attributes.is_empty()) {
                        let _ = writeln!(output, "\n{}", record.id.bold());
                        for (name, value) in &record.attributes {
                            let _ = writeln!(output, "   {name} = {}", json_to_text(value));
                        }
                    }
                }

                output
            }
        }
    }

    /// Formats the state snapshot summary.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Plan hash: {}", state.plan_hash.get(..8).unwrap_or(&state.plan_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());
                let _ = writeln!(output, "   Outputs: {}", state.outputs.len());

                if let Some(lock) = lock {
                    let _ = writeln!(
                        output,
                        "   Locked by: {} ({}, {}s left, id {})",
                        lock.holder,
                        lock.operation,
                        lock.remaining_secs(),
                        lock.lock_id
                    );
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} succeeded, {} failed, {} skipped){}",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.succeeded,
                            entry.failed,
                            entry.skipped,
                            entry.error.as_deref().map(|e| format!(": {e}")).unwrap_or_default()
                        );
                    }
                }

                output
            }
        }
    }

    fn color_diff(diff_type: DiffType, text: &str) -> String {
        match diff_type {
            DiffType::Create => text.green().to_string(),
            DiffType::Resume | DiffType::Changed | DiffType::Orphan => text.yellow().to_string(),
            DiffType::Delete => text.red().to_string(),
            DiffType::NoChange => text.dimmed().to_string(),
        }
    }

    fn format_outcome_status(status: OutcomeStatus) -> String {
        match status {
            OutcomeStatus::Succeeded => "succeeded".green().to_string(),
            OutcomeStatus::Unchanged => "unchanged".dimmed().to_string(),
            OutcomeStatus::Failed => "failed".red().to_string(),
            OutcomeStatus::Skipped | OutcomeStatus::Cancelled => status.to_string().yellow().to_string(),
        }
    }

    fn outcome_detail(outcome: &ResourceOutcome) -> String {
        outcome.error.as_deref().map_or_else(
            || outcome.handle.as_deref().map(|h| Self::truncate(h, 48)).unwrap_or_default(),
            |e| Self::truncate(e, 60),
        )
    }

    /// Formats a resource status with color.
    fn format_resource_status(status: ResourceStatus) -> String {
        match status {
            ResourceStatus::Ready => "ready".green().to_string(),
            ResourceStatus::Pending => "pending".dimmed().to_string(),
            ResourceStatus::Creating | ResourceStatus::Deleting => status.to_string().yellow().to_string(),
            ResourceStatus::Failed => "failed".red().to_string(),
            ResourceStatus::Deleted => "deleted".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

// JSON serialization helpers

#[derive(serde::Serialize)]
struct DiffJson {
    creates: usize,
    resumes: usize,
    deletes: usize,
    changed: usize,
    orphans: usize,
    unchanged: usize,
    resources: Vec<DiffEntryJson>,
}

#[derive(serde::Serialize)]
struct DiffEntryJson {
    id: String,
    kind: String,
    action: String,
    handle: Option<String>,
}

impl From<&DiffResult> for DiffJson {
    fn from(diff: &DiffResult) -> Self {
        Self {
            creates: diff.creates,
            resumes: diff.resumes,
            deletes: diff.deletes,
            changed: diff.changed,
            orphans: diff.orphans,
            unchanged: diff.unchanged,
            resources: diff
                .diffs
                .iter()
                .map(|d| DiffEntryJson {
                    id: d.id.clone(),
                    kind: d.kind.to_string(),
                    action: d.diff_type.to_string(),
                    handle: d.handle.clone(),
                })
                .collect(),
        }
    }
}

#[derive(serde::Serialize)]
struct ReportJson {
    operation: String,
    success: bool,
    cancelled: bool,
    succeeded: usize,
    unchanged: usize,
    failed: usize,
    skipped: usize,
    resources: Vec<OutcomeJson>,
    outputs: BTreeMap<String, JsonValue>,
    output_errors: Vec<String>,
}

#[derive(serde::Serialize)]
struct OutcomeJson {
    id: String,
    kind: String,
    action: String,
    status: String,
    handle: Option<String>,
    error: Option<String>,
}

impl From<&RunReport> for ReportJson {
    fn from(report: &RunReport) -> Self {
        let execution = &report.execution;
        Self {
            operation: execution.operation.to_string(),
            success: report.success(),
            cancelled: execution.cancelled,
            succeeded: execution.succeeded,
            unchanged: execution.unchanged,
            failed: execution.failed,
            skipped: execution.skipped,
            resources: execution
                .outcomes
                .iter()
                .map(|o| OutcomeJson {
                    id: o.id.clone(),
                    kind: o.kind.to_string(),
                    action: o.action.to_string(),
                    status: o.status.to_string(),
                    handle: o.handle.clone(),
                    error: o.error.clone(),
                })
                .collect(),
            outputs: report.outputs.clone(),
            output_errors: report.output_errors.clone(),
        }
    }
}
