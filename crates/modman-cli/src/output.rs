//! Table and JSON rendering of command results.

use anyhow::Result;
use serde::Serialize;

use modman_core::coordinator::{BundleStateReport, OperationResult};
use modman_core::inventory::{ReconcileReport, ScanReport};
use modman_core::model::Operation;
use modman_core::processor::ProcessSummary;
use modman_core::runtime::PackageSummary;

use crate::OutputFormat;

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_operation_result(result: &OperationResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            println!("{} '{}'", result.action, result.bundle);
            for outcome in &result.nodes {
                match (&outcome.operation, &outcome.error) {
                    (Some(name), None) => println!("  ✓ {:<16} queued as {}", outcome.node, name),
                    (_, Some(error)) => println!("  ✗ {:<16} {}", outcome.node, error),
                    (None, None) => println!("  • {:<16} no record", outcome.node),
                }
            }
            if result.all_accepted() {
                println!("Run 'modman state {}' to follow progress", result.bundle);
            }
            Ok(())
        }
        OutputFormat::Json => print_json(result),
    }
}

pub fn print_state_report(report: &BundleStateReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            if report.nodes.values().all(|bundles| bundles.is_empty()) {
                println!("No bundles tracked.");
                return Ok(());
            }
            println!("{:<16} {:<32} {:<12} Pending", "Node", "Bundle", "State");
            println!("{}", "-".repeat(76));
            for (node, bundles) in &report.nodes {
                for (name, entry) in bundles {
                    let pending = entry
                        .pending
                        .as_ref()
                        .map(|p| format!("{} ({})", p.action, p.state))
                        .unwrap_or_default();
                    println!(
                        "{:<16} {:<32} {:<12} {}",
                        node,
                        name,
                        entry.state.as_deref().unwrap_or("-"),
                        pending
                    );
                }
            }
            Ok(())
        }
        OutputFormat::Json => print_json(report),
    }
}

pub fn print_operations(node: &str, operations: &[Operation], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            if operations.is_empty() {
                println!("No operations queued for {}.", node);
                return Ok(());
            }
            println!(
                "{:<40} {:<10} {:<28} {:<11} Reason",
                "Operation", "Action", "Bundle", "State"
            );
            println!("{}", "-".repeat(100));
            for operation in operations {
                println!(
                    "{:<40} {:<10} {:<28} {:<11} {}",
                    operation.name().unwrap_or("-"),
                    operation.action().as_str(),
                    operation.bundle(),
                    operation.state().as_str(),
                    operation.reason().unwrap_or("")
                );
            }
            Ok(())
        }
        OutputFormat::Json => print_json(operations),
    }
}

pub fn print_process_summary(node: &str, summary: &ProcessSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            println!(
                "{}: {} done, {} failed",
                node,
                summary.done.len(),
                summary.failed.len()
            );
            for name in &summary.failed {
                println!("  ✗ {}", name);
            }
            if summary.unrecorded > 0 {
                println!("  ⚠ {} outcomes could not be recorded", summary.unrecorded);
            }
            Ok(())
        }
        OutputFormat::Json => print_json(summary),
    }
}

pub fn print_scan_report(report: &ScanReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            if report.bundles.is_empty() {
                println!("No managed bundles loaded.");
            } else {
                println!("{:<32} {:<12} Checksum", "Bundle", "State");
                println!("{}", "-".repeat(76));
                for (name, scanned) in &report.bundles {
                    println!(
                        "{:<32} {:<12} {}",
                        name,
                        scanned.state,
                        scanned.bundle.checksum().unwrap_or("-")
                    );
                }
            }
            for issue in &report.issues {
                println!(
                    "  ⚠ package {} {}: {:?} ({})",
                    issue.package_id,
                    issue.name.as_deref().unwrap_or("?"),
                    issue.kind,
                    issue.detail
                );
            }
            Ok(())
        }
        OutputFormat::Json => print_json(report),
    }
}

pub fn print_packages(packages: &[PackageSummary], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            if packages.is_empty() {
                println!("No packages loaded.");
                return Ok(());
            }
            println!("{:<6} {:<32} State", "Id", "Name");
            println!("{}", "-".repeat(50));
            for package in packages {
                println!(
                    "{:<6} {:<32} {}",
                    package.id,
                    package.name.as_deref().unwrap_or("-"),
                    package.state
                );
            }
            Ok(())
        }
        OutputFormat::Json => print_json(packages),
    }
}

pub fn print_reconcile_report(report: &ReconcileReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            println!("Catalog updated: {}", report.catalog_updated.len());
            println!("Node entries updated: {}", report.node_updated.len());
            println!("Node entries removed: {}", report.node_removed.len());
            for name in &report.skipped_in_flight {
                println!("  • {} skipped, operation in flight", name);
            }
            for issue in &report.issues {
                println!("  ⚠ package {}: {}", issue.package_id, issue.detail);
            }
            Ok(())
        }
        OutputFormat::Json => print_json(report),
    }
}

pub fn print_compacted(node: &str, removed: usize, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            println!("Removed {} finished operations from {}", removed, node);
            Ok(())
        }
        OutputFormat::Json => print_json(&serde_json::json!({ "node": node, "removed": removed })),
    }
}
