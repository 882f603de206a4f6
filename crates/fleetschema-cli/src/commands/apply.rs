use fleetschema_migrate::{ApplyOutcome, TargetSelector};

use crate::{GlobalArgs, OutputFormat};

use super::{build_orchestrator, load_config, shutdown_on_ctrl_c};

pub async fn apply_schema(
    global: &GlobalArgs,
    selector: TargetSelector,
    force: bool,
) -> anyhow::Result<()> {
    let config = load_config(global)?;
    let orchestrator = build_orchestrator(&config)?;
    let shutdown = shutdown_on_ctrl_c();

    let outcome = orchestrator.apply_schema(selector, force, &shutdown).await?;

    match global.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Text => println!("{}", describe(&outcome)),
    }
    Ok(())
}

fn describe(outcome: &ApplyOutcome) -> String {
    match outcome {
        ApplyOutcome::UpToDate { current } => {
            format!("Schema is up to date at version {current}")
        }
        ApplyOutcome::Applied {
            from,
            to,
            full_snapshot: true,
            ..
        } => format!("Upgraded schema {from} → {to} from a full snapshot"),
        ApplyOutcome::Applied {
            from, to, applied, ..
        } => {
            let steps: Vec<String> = applied.iter().map(|v| v.to_string()).collect();
            format!("Upgraded schema {from} → {to} (applied {})", steps.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_outcomes() {
        assert_eq!(
            describe(&ApplyOutcome::UpToDate { current: 4 }),
            "Schema is up to date at version 4"
        );
        assert_eq!(
            describe(&ApplyOutcome::Applied {
                from: 2,
                to: 4,
                applied: vec![3, 4],
                full_snapshot: false,
            }),
            "Upgraded schema 2 → 4 (applied 3, 4)"
        );
        assert!(
            describe(&ApplyOutcome::Applied {
                from: 0,
                to: 3,
                applied: vec![3],
                full_snapshot: true,
            })
            .contains("full snapshot")
        );
    }
}
