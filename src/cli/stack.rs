use anyhow::{Context, Result};
use comfy_table::Cell;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

use super::{new_table, Workspace};
use crate::build::outputs as image_outputs;
use crate::controller::{ServiceController, ServiceTarget};
use crate::provision::plan::Action;
use crate::settings::BuilderKind;
use crate::stack::OUTPUT_API_BASE_URL;

/// Show what a deploy would change
pub async fn handle_plan(builder: Option<BuilderKind>) -> Result<()> {
    let workspace = Workspace::open().await?;
    let provisioner = workspace.provisioner(builder).await?;
    let plan = provisioner.plan(&workspace.stack.graph).await?;
    let waves = workspace.stack.graph.waves()?;

    if !plan.has_changes() {
        println!("No changes. Stack '{}' is up to date.", workspace.stack.name);
        print_review_findings(&workspace);
        return Ok(());
    }

    let mut table = new_table(&["WAVE", "RESOURCE", "ACTION", "REASON"]);
    for (index, wave) in waves.iter().enumerate() {
        for id in wave {
            let Some(change) = plan.change(id) else {
                continue;
            };
            table.add_row(vec![
                Cell::new(index + 1),
                Cell::new(id),
                Cell::new(change.action),
                Cell::new(&change.reason),
            ]);
        }
    }
    for change in plan.changes.iter().filter(|c| c.action == Action::Delete) {
        table.add_row(vec![
            Cell::new("-"),
            Cell::new(&change.id),
            Cell::new(change.action),
            Cell::new(&change.reason),
        ]);
    }
    println!("{table}");

    let summary = plan
        .summary()
        .into_iter()
        .map(|(action, count)| format!("{} {}", count, action))
        .collect::<Vec<_>>()
        .join(", ");
    println!("Plan: {}", summary);

    print_review_findings(&workspace);
    Ok(())
}

fn print_review_findings(workspace: &Workspace) {
    let findings = workspace.stack.review_findings();
    if findings.is_empty() {
        return;
    }
    println!();
    println!("Grants to review before rollout:");
    let mut table = new_table(&["ROLE", "STATEMENT", "RESOURCE", "NOTE"]);
    for finding in findings {
        table.add_row(vec![
            Cell::new(finding.role),
            Cell::new(finding.statement),
            Cell::new(finding.resource),
            Cell::new(finding.note),
        ]);
    }
    println!("{table}");
}

/// Provision the stack, then run the service until it converges
pub async fn handle_deploy(builder: Option<BuilderKind>, skip_rollout: bool) -> Result<()> {
    let workspace = Workspace::open().await?;
    let mut provisioner = workspace.provisioner(builder).await?;

    let report = provisioner
        .apply(&workspace.stack.graph, None)
        .await
        .map_err(|e| {
            let context = if e.is_image_failure() {
                "Image publish failed; nothing that references the image was changed"
            } else {
                "Stack deployment failed"
            };
            anyhow::Error::new(e).context(context)
        })?;
    info!(changed = report.changed(), "Stack resources are up to date");

    if skip_rollout {
        warn!("Skipping service rollout; instances are not reconciled");
    } else {
        let target = ServiceTarget::resolve(&workspace.stack, provisioner.state())?;
        let mut controller = ServiceController::new(workspace.cloud.clone(), target);
        let clock = workspace.cloud.clock();
        controller.adopt(clock.now()).await?;

        let controller_settings = &workspace.settings.controller;
        controller
            .run_until_converged(
                clock.as_ref(),
                Duration::from_millis(controller_settings.reconcile_interval_ms),
                Duration::from_secs(controller_settings.convergence_timeout_secs),
            )
            .await?;
    }

    let outputs = workspace
        .stack
        .stack_outputs(provisioner.state().outputs(&workspace.stack.ids.load_balancer));
    match outputs.get(OUTPUT_API_BASE_URL) {
        Some(url) => println!("{} = {}", OUTPUT_API_BASE_URL, url),
        None => warn!("Load balancer has no DNS name; {} is unknown", OUTPUT_API_BASE_URL),
    }
    Ok(())
}

/// Tear the stack down, keeping resources marked for retention
pub async fn handle_destroy(builder: Option<BuilderKind>) -> Result<()> {
    let workspace = Workspace::open().await?;
    let mut provisioner = workspace.provisioner(builder).await?;

    let report = provisioner
        .destroy(&workspace.stack.graph)
        .await
        .context("Stack teardown failed")?;

    let mut table = new_table(&["RESOURCE", "ACTION"]);
    for (id, action) in &report.applied {
        let action = match action {
            Action::Unchanged => "retained".to_string(),
            other => other.to_string(),
        };
        table.add_row(vec![Cell::new(id), Cell::new(action)]);
    }
    println!("{table}");
    println!("✓ Stack '{}' destroyed", workspace.stack.name);
    Ok(())
}

/// Build and publish the gateway image without touching the rest of the stack
pub async fn handle_publish(builder: Option<BuilderKind>) -> Result<()> {
    let workspace = Workspace::open().await?;
    let mut provisioner = workspace.provisioner(builder).await?;
    let deployment_id = &workspace.stack.ids.image_deployment;

    let mut only: BTreeSet<_> = workspace.stack.graph.ancestors(deployment_id);
    only.insert(deployment_id.clone());
    provisioner
        .apply(&workspace.stack.graph, Some(&only))
        .await
        .context("Image publish failed")?;

    let outputs = provisioner
        .state()
        .outputs(deployment_id)
        .with_context(|| format!("{} recorded no outputs", deployment_id))?;
    let uri = outputs
        .get(image_outputs::IMAGE_URI)
        .map(String::as_str)
        .unwrap_or("-");
    let digest = outputs
        .get(image_outputs::IMAGE_DIGEST)
        .map(String::as_str)
        .unwrap_or("-");
    println!("✓ Published {}", uri);
    println!("  Digest: {}", digest);
    Ok(())
}

/// Print every recorded output plus the stack-level outputs
pub async fn handle_outputs() -> Result<()> {
    let workspace = Workspace::open().await?;
    let state = workspace.load_state()?;

    if state.is_empty() {
        println!("Stack '{}' has not been deployed", workspace.stack.name);
        return Ok(());
    }

    let mut table = new_table(&["RESOURCE", "KEY", "VALUE"]);
    for (id, resource) in &state.resources {
        for (key, value) in &resource.outputs {
            table.add_row(vec![Cell::new(id), Cell::new(key), Cell::new(value)]);
        }
    }
    let stack_outputs = workspace
        .stack
        .stack_outputs(state.outputs(&workspace.stack.ids.load_balancer));
    for (key, value) in &stack_outputs {
        table.add_row(vec![
            Cell::new(format!("stack/{}", workspace.stack.name)),
            Cell::new(key),
            Cell::new(value),
        ]);
    }
    println!("{table}");
    Ok(())
}
