use std::fmt::Write;

use fleetschema_catalog::AvailableVersion;
use fleetschema_ledger::CurrentVersionInformation;

use crate::{GlobalArgs, OutputFormat};

use super::{build_orchestrator, load_config};

pub async fn current_schema(global: &GlobalArgs) -> anyhow::Result<()> {
    let config = load_config(global)?;
    let current = build_orchestrator(&config)?.current_schema().await?;
    match global.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&current)?),
        OutputFormat::Text => print!("{}", format_current(&current)),
    }
    Ok(())
}

pub async fn available_schema(global: &GlobalArgs) -> anyhow::Result<()> {
    let config = load_config(global)?;
    let available = build_orchestrator(&config)?.available_schema().await?;
    match global.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&available)?),
        OutputFormat::Text => print!("{}", format_available(&available)),
    }
    Ok(())
}

fn format_current(current: &[CurrentVersionInformation]) -> String {
    if current.is_empty() {
        return "No live instances\n".to_string();
    }
    let mut out = format!("{:<8} {:<10} {}\n", "VERSION", "STATUS", "INSTANCES");
    for group in current {
        let status = group.status.map_or("-", |s| s.as_str());
        let _ = writeln!(out, "{:<8} {:<10} {}", group.id, status, group.servers.join(", "));
    }
    out
}

fn format_available(available: &[AvailableVersion]) -> String {
    let mut out = format!("{:<8} {:<9} {}\n", "VERSION", "SNAPSHOT", "DIFF");
    for (i, version) in available.iter().enumerate() {
        let mark = |uri: &Option<String>| if uri.is_some() { "yes" } else { "-" };
        let id = if i == 0 {
            format!("{} *", version.id)
        } else {
            version.id.to_string()
        };
        let _ = writeln!(
            out,
            "{:<8} {:<9} {}",
            id,
            mark(&version.snapshot_uri),
            mark(&version.diff_uri)
        );
    }
    out
}
