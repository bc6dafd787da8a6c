use chrono::{DateTime, Utc};
use colored::Colorize;

use crate::recovery::OfflineRunSummary;
use crate::sync::{
    ConflictData, OperationStatus, PassSummary, QueueHealth, QueueMetrics, QueuedOperation,
};

fn age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(since);
    if age.num_hours() > 0 {
        format!("{} hours ago", age.num_hours())
    } else if age.num_minutes() > 0 {
        format!("{} minutes ago", age.num_minutes())
    } else {
        "just now".to_string()
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

/// Format queue metrics as a status block
#[must_use]
pub fn format_metrics_pretty(metrics: &QueueMetrics, device_id: &str, durable: bool) -> String {
    let mut lines = Vec::new();

    lines.push("Sync Queue Status".bold().to_string());
    lines.push("─".repeat(40));

    let health = match metrics.queue_health {
        QueueHealth::Healthy => "healthy".green(),
        QueueHealth::Warning => "warning".yellow(),
        QueueHealth::Error => "error".red(),
    };
    lines.push(format!("  Health:     {health}"));
    lines.push(format!("  Total:      {}", metrics.total_operations));
    lines.push(format!(
        "  Pending:    {} {}",
        metrics.pending_operations,
        if metrics.pending_operations > 0 {
            "operations waiting".dimmed()
        } else {
            "".dimmed()
        }
    ));
    lines.push(format!(
        "  Completed:  {} {}",
        metrics.completed_operations,
        "operations".dimmed()
    ));
    lines.push(format!(
        "  Failed:     {} {}",
        metrics.failed_operations,
        if metrics.failed_operations > 0 {
            "operations need attention".red()
        } else {
            "".normal()
        }
    ));
    lines.push(format!("  Retries:    {:.1} avg", metrics.average_retry_count));

    if let Some(oldest) = metrics.oldest_pending_operation {
        lines.push(format!("  Oldest:     {}", age(oldest, Utc::now()).dimmed()));
    }
    lines.push(format!("  Device:     {}", device_id.dimmed()));
    if !durable {
        lines.push(format!(
            "  {}",
            "Storage unavailable: operations are kept in memory only".yellow()
        ));
    }

    if metrics.pending_operations > 0 {
        lines.push(String::new());
        lines.push(
            "Run 'habitsync run' to submit pending operations"
                .dimmed()
                .to_string(),
        );
    }

    lines.join("\n")
}

/// Format operations as a table
#[must_use]
pub fn format_operations_pretty(operations: &[QueuedOperation], title: &str) -> String {
    if operations.is_empty() {
        return format!("{title} (0 items)\n  No operations");
    }

    let mut lines = Vec::new();
    lines.push(format!("{} ({} items)", title.bold(), operations.len()));
    lines.push("─".repeat(78));
    lines.push(format!(
        "{:<3} {:<38} {:<16} {:<9} {:<7} {}",
        "", "ID", "Type", "Priority", "Tries", "Created"
    ));
    lines.push("─".repeat(78));

    for op in operations {
        let icon = match op.status {
            OperationStatus::Pending => "…".normal(),
            OperationStatus::Syncing => "▶".cyan(),
            OperationStatus::Completed => "✓".green(),
            OperationStatus::Failed => "✗".red(),
        };
        lines.push(format!(
            "{:<3} {:<38} {:<16} {:<9} {:<7} {}",
            icon,
            op.id,
            op.operation_type.as_str(),
            op.priority.to_string(),
            format!("{}/{}", op.retry_count, op.max_retries),
            op.timestamp.format("%Y-%m-%d %H:%M")
        ));

        if let Some(error) = &op.error {
            lines.push(format!(
                "    {}",
                truncate(&format!("{}: {}", error.code, error.message), 70).red()
            ));
        }
    }

    lines.join("\n")
}

/// Format open conflicts
#[must_use]
pub fn format_conflicts_pretty(conflicts: &[ConflictData]) -> String {
    if conflicts.is_empty() {
        return "No open conflicts.".to_string();
    }

    let mut lines = Vec::new();
    lines.push(format!("{} ({})", "Open Conflicts".bold(), conflicts.len()));
    lines.push("─".repeat(60));

    for conflict in conflicts {
        lines.push(format!(
            "{}  {}  {}",
            conflict.id.bold(),
            conflict.conflict_type.yellow(),
            age(conflict.detected_at, Utc::now()).dimmed()
        ));
        lines.push(format!(
            "  {}: {}",
            "server".dimmed(),
            truncate(&conflict.server_data.to_string(), 60)
        ));
        lines.push(format!(
            "  {}: {}",
            "client".dimmed(),
            truncate(&conflict.client_data.to_string(), 60)
        ));
    }

    lines.push(String::new());
    lines.push(
        "Resolve with 'habitsync conflicts resolve <id> <client|server|merge>'"
            .dimmed()
            .to_string(),
    );
    lines.join("\n")
}

/// Format the outcome of a sync run
#[must_use]
pub fn format_run_pretty(pass: &PassSummary, requests: &OfflineRunSummary) -> String {
    if pass.skipped {
        return "Sync skipped: offline or already running.".yellow().to_string();
    }

    let mut lines = Vec::new();
    lines.push("Sync Results".bold().to_string());
    lines.push("─".repeat(40));
    lines.push(format!("  {} {} completed", "✓".green(), pass.processed));
    if pass.retrying > 0 {
        lines.push(format!("  {} {} will be retried", "↻".yellow(), pass.retrying));
    }
    if pass.failed > 0 {
        lines.push(format!("  {} {} failed", "✗".red(), pass.failed));
    }
    if pass.conflicts > 0 {
        lines.push(format!("  {} {} conflicts", "!".yellow(), pass.conflicts));
    }
    if pass.deferred > 0 {
        lines.push(format!(
            "  {} {} waiting on dependencies",
            "…".dimmed(),
            pass.deferred
        ));
    }
    if pass.aborted {
        lines.push(format!("  {}", "Pass aborted".yellow()));
    }
    if let Some(action) = pass.action {
        let mut line = format!("  Recovery:   {action}");
        if let Some(delay) = pass.retry_after {
            line.push_str(&format!(" (retry in {}s)", delay.as_secs()));
        }
        lines.push(line.dimmed().to_string());
    }

    if requests.sent + requests.retained + requests.dropped > 0 {
        lines.push(format!(
            "  Requests:   {} sent, {} retained, {} dropped",
            requests.sent, requests.retained, requests.dropped
        ));
    }

    lines.join("\n")
}
