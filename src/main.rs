//! tiervault operator CLI
//!
//! ## Usage
//!
//! ```text
//! tiervault load <doc-key>
//! tiervault heal <doc-key>
//! tiervault backup [description] [--protected]
//! tiervault list
//! tiervault show <backup-id>
//! tiervault restore <backup-id> [--include-users]
//! tiervault verify <backup-id>
//! tiervault stats
//! ```
//!
//! Storage is configured from the environment (see `StorageConfig::from_env`).
//! Results go to stdout as JSON; logs go to stderr.

use serde_json::json;
use tiervault::backup::ItemStatus;
use tiervault::observability::{init_tracing, LogConfig};
use tiervault::{PerTierResult, PersistenceService, RestoreOptions, StorageConfig};

const USAGE: &str = "usage: tiervault <load|heal|backup|list|show|restore|verify|stats> [args]";

fn tier_summary(result: &PerTierResult) -> serde_json::Value {
    json!({
        "docKey": result.doc_key.as_str(),
        "succeeded": result.succeeded(),
        "failed": result
            .failed()
            .iter()
            .map(|(tier, e)| json!({"tier": tier, "error": e.to_string()}))
            .collect::<Vec<_>>(),
    })
}

fn required_arg<'a>(command: &str, positional: &[&'a str], what: &str) -> &'a str {
    match positional.first().copied() {
        Some(value) => value,
        None => {
            eprintln!("{}: missing <{}>", command, what);
            std::process::exit(2);
        }
    }
}

fn status_label(status: &ItemStatus) -> String {
    match status {
        ItemStatus::Intact => "intact".to_string(),
        ItemStatus::ChecksumMismatch { .. } => "checksum-mismatch".to_string(),
        ItemStatus::Missing(reason) => format!("missing: {}", reason),
    }
}

fn print(value: &serde_json::Value) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing(&LogConfig::from_env())?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, rest) = match args.split_first() {
        Some((command, rest)) => (command.as_str(), rest),
        None => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };
    let flag = |name: &str| rest.iter().any(|a| a == name);
    let positional: Vec<&str> = rest
        .iter()
        .filter(|a| !a.starts_with("--"))
        .map(String::as_str)
        .collect();
    let required = |what: &str| required_arg(command, &positional, what);

    let service = PersistenceService::open(&StorageConfig::from_env()).await?;

    match command {
        "load" => {
            let payload = service.load_document(required("doc-key")).await?;
            print(&payload.unwrap_or(serde_json::Value::Null))?;
        }
        "heal" => {
            let report = service.heal_document(required("doc-key")).await?;
            print(&json!({
                "docKey": report.outcome.doc_key.as_str(),
                "found": report.outcome.is_found(),
                "staleBefore": report.outcome.stale_tiers(),
                "repair": report.repair.as_ref().map(tier_summary),
            }))?;
        }
        "backup" => {
            let description = positional.first().copied().unwrap_or("Manual backup");
            let manifest = if flag("--protected") {
                service.create_protected_backup(description).await?
            } else {
                service.create_backup(description).await?
            };
            print(&serde_json::to_value(&manifest)?)?;
        }
        "list" => {
            let backups = service.list_backups().await?;
            print(&serde_json::to_value(&backups)?)?;
        }
        "show" => {
            let manifest = service.get_backup(required("backup-id")).await?;
            print(&serde_json::to_value(&manifest)?)?;
        }
        "restore" => {
            let options = RestoreOptions {
                include_users: flag("--include-users"),
            };
            let result = service.restore_backup_with(required("backup-id"), options).await?;
            print(&json!({
                "backupId": result.backup_id,
                "safetyBackupId": result.safety_backup_id,
                "restored": result.restored.iter().map(|r| json!({
                    "docKey": r.doc_key.as_str(),
                    "tiers": r.tiers,
                    "complete": r.complete,
                })).collect::<Vec<_>>(),
                "skipped": result.skipped,
                "failed": result.failed.iter().map(|f| json!({"item": f.item, "reason": f.reason})).collect::<Vec<_>>(),
                "integrityWarnings": result.warnings.iter().map(|w| w.item.clone()).collect::<Vec<_>>(),
            }))?;
        }
        "verify" => {
            let report = service.verify_backup(required("backup-id")).await?;
            print(&json!({
                "backupId": report.backup_id,
                "intact": report.is_intact(),
                "manifestProblem": report.manifest_problem,
                "items": report.items.iter().map(|i| json!({
                    "name": i.name,
                    "status": status_label(&i.status),
                })).collect::<Vec<_>>(),
            }))?;
        }
        "stats" => {
            let stats = service.get_storage_stats().await?;
            print(&serde_json::to_value(&stats)?)?;
        }
        other => {
            eprintln!("unknown command {:?}\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
    Ok(())
}
