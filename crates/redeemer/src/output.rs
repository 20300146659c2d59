//! Plain-text and JSON rendering for CLI results.
//!
//! Key values are always shown masked.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;

use redeemer_core::catalog::Catalog;
use redeemer_core::engine::{ClassifiedKey, Disposition, RunPlan, RunSummary};
use redeemer_core::ledger::{CleanupReport, LedgerCounts, LedgerRow};
use redeemer_core::model::{KeyRecord, redact_key};
use redeemer_core::resolver::Resolution;

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn resolution_text(resolution: &Resolution) -> String {
    match (&resolution.matched_name, resolution.app_id) {
        (Some(name), Some(app_id)) => format!(
            "{} -> {name} (app {app_id}, score {:.0})",
            resolution.decision, resolution.score
        ),
        (None, Some(app_id)) => format!("{} -> app {app_id}", resolution.decision),
        _ => resolution.decision.to_string(),
    }
}

fn describe(item: &ClassifiedKey) -> String {
    let detail = match &item.disposition {
        Disposition::Friend { friend } => {
            format!("{} ({:.0}%)", friend.reason, friend.confidence * 100.0)
        }
        Disposition::AlreadyTerminal { outcome } => outcome.to_string(),
        Disposition::Deferred { resolution }
        | Disposition::Owned { resolution }
        | Disposition::Unknown { resolution }
        | Disposition::Redeem { resolution } => resolution_text(resolution),
        Disposition::CompletedBundle
        | Disposition::Unclaimed
        | Disposition::OtherPlatform
        | Disposition::Expired => String::new(),
    };
    let mut line = format!(
        "{:<17} {}  {}",
        item.disposition.label(),
        item.gamekey,
        item.title
    );
    if !detail.is_empty() {
        line.push_str(&format!("  [{detail}]"));
    }
    if let Some(friend) = &item.uncertain_friend {
        line.push_str(&format!(
            "  (possible friend key: {}, {:.0}%)",
            friend.reason,
            friend.confidence * 100.0
        ));
    }
    line
}

pub fn classification(plan: &RunPlan, json: bool) -> Result<()> {
    if json {
        return print_json(&plan.keys);
    }
    for item in &plan.keys {
        println!("{}", describe(item));
    }
    Ok(())
}

pub fn plan(plan: &RunPlan, json: bool) -> Result<()> {
    if json {
        return print_json(plan);
    }
    for item in &plan.keys {
        println!("{}", describe(item));
    }
    println!();
    for (label, count) in plan.counts() {
        println!("  {label:<17} {count}");
    }
    if !plan.problematic.is_empty() {
        println!("Errored keys to retry: {}", plan.problematic.len());
        for title in &plan.problematic {
            println!("  - {title}");
        }
    }
    for failure in &plan.source_failures {
        println!("Skipped key file entry: {failure}");
    }
    Ok(())
}

pub fn summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        return print_json(summary);
    }
    if summary.cancelled {
        println!("Run cancelled; re-run to resume.");
    } else {
        println!("Run finished.");
    }
    let rows = [
        ("redeemed", summary.redeemed),
        ("already owned", summary.already_owned),
        ("errored", summary.errored),
        ("expired", summary.expired),
        ("friend", summary.friend),
        ("owned, skipped", summary.owned_skipped),
        ("unknown", summary.unknown),
        ("possible friend", summary.uncertain_friend),
        ("already recorded", summary.skipped_terminal),
        ("completed bundles", summary.skipped_bundles),
        ("retried errored", summary.problematic_attempted),
        ("source failures", summary.source_failures),
    ];
    for (label, count) in rows {
        if count > 0 {
            println!("  {label:<18} {count}");
        }
    }
    if summary.rate_limit_events > 0 {
        println!(
            "  rate limited {} time(s), waited {}s",
            summary.rate_limit_events, summary.rate_limit_wait_secs
        );
    }
    if !summary.unknown_titles.is_empty() {
        println!("No confident catalog match (not redeemed):");
        for title in &summary.unknown_titles {
            println!("  - {title}");
        }
    }
    for bundle in &summary.completed_bundles {
        println!("Bundle complete: {bundle}");
    }
    Ok(())
}

pub fn catalog(catalog: &Catalog, path: &Path, json: bool) -> Result<()> {
    if json {
        return print_json(&json!({
            "entries": catalog.len(),
            "owned": catalog.owned_count(),
            "path": path.display().to_string(),
        }));
    }
    println!(
        "Catalog rebuilt: {} entries, {} owned ({})",
        catalog.len(),
        catalog.owned_count(),
        path.display()
    );
    Ok(())
}

pub fn cleanup(report: &CleanupReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    println!(
        "Errored rows: {} -> {} ({} already resolved, {} duplicates removed)",
        report.before, report.after, report.removed_superseded, report.removed_duplicates
    );
    Ok(())
}

pub fn problematic(queue: &[KeyRecord], json: bool) -> Result<()> {
    if json {
        let rows: Vec<_> = queue
            .iter()
            .map(|k| {
                json!({
                    "gamekey": k.gamekey,
                    "title": k.name,
                    "key": redact_key(k.revealed().unwrap_or_default()),
                })
            })
            .collect();
        return print_json(&rows);
    }
    if queue.is_empty() {
        println!("No errored keys to retry.");
    }
    for key in queue {
        println!(
            "{}  {}  {}",
            key.gamekey,
            key.name,
            redact_key(key.revealed().unwrap_or_default())
        );
    }
    Ok(())
}

pub fn promoted(rows: &[LedgerRow], json: bool) -> Result<()> {
    if json {
        let rows: Vec<_> = rows
            .iter()
            .map(|r| {
                json!({
                    "gamekey": r.gamekey,
                    "title": r.human_name,
                    "reason": r.reason,
                    "confidence": r.confidence,
                })
            })
            .collect();
        return print_json(&rows);
    }
    println!("Moved {} friend key(s) out of errored.", rows.len());
    for row in rows {
        println!("  - {} ({})", row.human_name, row.reason);
    }
    Ok(())
}

pub fn status(
    dir: &Path,
    counts: &LedgerCounts,
    problematic: usize,
    completed: &[&str],
    json: bool,
) -> Result<()> {
    if json {
        return print_json(&json!({
            "data_dir": dir.display().to_string(),
            "ledger": counts,
            "problematic": problematic,
            "completed_bundles": completed,
        }));
    }
    println!("Ledger in {}", dir.display());
    println!("  redeemed       {}", counts.redeemed);
    println!("  already owned  {}", counts.already_owned);
    println!("  expired        {}", counts.expired);
    println!("  friend         {}", counts.friend);
    println!("  errored        {} ({problematic} retryable)", counts.errored);
    if !completed.is_empty() {
        println!("Completed bundles: {}", completed.join(", "));
    }
    Ok(())
}

pub fn exported(rows: usize, path: &Path, json: bool) -> Result<()> {
    if json {
        return print_json(&json!({"rows": rows, "path": path.display().to_string()}));
    }
    println!("Wrote {rows} row(s) to {}", path.display());
    Ok(())
}
