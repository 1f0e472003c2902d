//! Statistics reports and JSON exports

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::hooks::error::{HookError, ManageResult};
use crate::hooks::stats::CategoryTotals;
use crate::hooks::{
    GlobalTotals, HookCategory, HookId, HookPriority, HookState, HookStatsSnapshot,
};

use super::Orchestrator;

/// Export errors
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize export: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-hook line of a [`StatisticsReport`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookStatsEntry {
    pub id: HookId,
    pub category: HookCategory,
    pub priority: HookPriority,
    pub state: HookState,
    pub enabled: bool,
    pub stats: HookStatsSnapshot,
}

/// Structured statistics snapshot
///
/// Maps are keyed by the enums' string forms so the JSON is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsReport {
    pub generated_at_ns: u64,
    pub totals: GlobalTotals,
    pub hooks_by_state: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, CategoryTotals>,
    pub hooks: Vec<HookStatsEntry>,
}

impl Orchestrator {
    /// Snapshot of global, per-category and per-hook statistics
    pub fn statistics(&self) -> StatisticsReport {
        let infos = self.hooks();

        let mut hooks_by_state = BTreeMap::new();
        let mut by_category: BTreeMap<String, CategoryTotals> = BTreeMap::new();
        let mut hooks = Vec::with_capacity(infos.len());

        for info in infos {
            *hooks_by_state
                .entry(info.state.as_str().to_string())
                .or_insert(0) += 1;
            by_category
                .entry(info.category.as_str().to_string())
                .or_default()
                .add(&info.stats, info.state.is_active());
            hooks.push(HookStatsEntry {
                id: info.id,
                category: info.category,
                priority: info.priority,
                state: info.state,
                enabled: info.enabled,
                stats: info.stats,
            });
        }

        StatisticsReport {
            generated_at_ns: self.now_ns(),
            totals: self.shared.stats.snapshot(),
            hooks_by_state,
            by_category,
            hooks,
        }
    }

    pub fn hook_statistics(&self, id: &str) -> Option<HookStatsSnapshot> {
        self.table
            .read()
            .get_by_id(id)
            .map(|entry| entry.stats.snapshot())
    }

    /// Zero one hook's call counters without touching its state
    pub fn reset_performance_stats(&self, id: &str) -> ManageResult<()> {
        let table = self.table.read();
        let entry = table
            .get_by_id(id)
            .ok_or_else(|| HookError::NotFound(HookId::new(id)))?;
        entry.stats.reset();
        Ok(())
    }

    /// Zero every hook's call counters and the global call counters
    pub fn reset_all_performance_stats(&self) {
        let table = self.table.read();
        for (_, entry) in table.iter() {
            entry.stats.reset();
        }
        self.shared.stats.reset_performance();
        tracing::debug!("Performance statistics reset");
    }

    /// Zero the orchestrator-wide counters, lifecycle counts included
    ///
    /// Per-hook counters are left alone; see [`Self::reset_all_performance_stats`].
    pub fn reset_statistics(&self) {
        self.shared.stats.reset();
        tracing::debug!("Global statistics reset");
    }

    /// Human-readable statistics summary
    pub fn statistics_report(&self) -> String {
        let report = self.statistics();
        let totals = &report.totals;
        let mut out = String::new();

        let _ = writeln!(out, "=== Hook Statistics ===");
        let _ = writeln!(out, "Registered: {}", totals.hooks_registered);
        let _ = writeln!(out, "Installed:  {}", totals.hooks_installed);
        let _ = writeln!(out, "Removed:    {}", totals.hooks_removed);
        let _ = writeln!(out, "Failed:     {}", totals.hooks_failed);
        let _ = writeln!(
            out,
            "Calls: {} ({} errors, {} without original)",
            totals.total_calls, totals.total_errors, totals.missed_originals
        );
        let _ = writeln!(
            out,
            "Average install: {}ns, average removal: {}ns",
            totals.average_install_ns, totals.average_removal_ns
        );
        let _ = writeln!(
            out,
            "Integrity: {} check(s), {} mismatch(es)",
            totals.integrity_checks, totals.integrity_mismatches
        );

        if !report.by_category.is_empty() {
            let _ = writeln!(out, "\n--- By category ---");
            for (category, stats) in &report.by_category {
                let _ = writeln!(
                    out,
                    "{:<12} hooks={} installed={} calls={} errors={}",
                    category, stats.hooks, stats.installed, stats.call_count, stats.error_count
                );
            }
        }

        if !report.hooks.is_empty() {
            let _ = writeln!(out, "\n--- Hooks ---");
            for hook in &report.hooks {
                let _ = writeln!(
                    out,
                    "{} [{}/{}] {}{} calls={} errors={} slow={} avg={}ns max={}ns",
                    hook.id,
                    hook.category,
                    hook.priority,
                    hook.state,
                    if hook.enabled { "" } else { " (disabled)" },
                    hook.stats.call_count,
                    hook.stats.error_count,
                    hook.stats.slow_calls,
                    hook.stats.average_ns,
                    hook.stats.max_ns
                );
            }
        }

        out
    }

    /// Write [`Self::statistics`] to `path` as pretty JSON
    pub fn export_statistics(&self, path: &Path) -> Result<(), ExportError> {
        write_json(path, &self.statistics())?;
        tracing::info!("Exported hook statistics to {:?}", path);
        Ok(())
    }

    /// Write every hook's [`HookInfo`](crate::hooks::HookInfo) to `path` as pretty JSON
    pub fn export_hook_list(&self, path: &Path) -> Result<(), ExportError> {
        write_json(path, &self.hooks())?;
        tracing::info!("Exported hook list to {:?}", path);
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}
