use anyhow::{bail, Context, Result};
use comfy_table::Cell;
use std::time::Duration;
use tracing::debug;

use super::{new_table, Workspace};
use crate::controller::{ServiceController, ServiceTarget};
use crate::stack::OUTPUT_API_BASE_URL;

/// Show the managed service's instances as the platform reports them
pub async fn handle_status() -> Result<()> {
    let workspace = Workspace::open().await?;
    let state = workspace.load_state()?;
    let target = ServiceTarget::resolve(&workspace.stack, &state)?;
    let desired = target.desired_count;

    let mut controller = ServiceController::new(workspace.cloud.clone(), target);
    controller.adopt(workspace.cloud.clock().now()).await?;

    let current_revision = controller
        .target()
        .workload_arn
        .rsplit_once(':')
        .map(|(_, rev)| rev.to_string())
        .unwrap_or_default();

    let mut table = new_table(&["INSTANCE", "TASK", "IP", "REVISION", "STATE", "TARGET HEALTH"]);
    for instance in controller.instances() {
        let revision = if instance.revision() == current_revision {
            instance.revision().to_string()
        } else {
            format!("{} (old)", instance.revision())
        };
        table.add_row(vec![
            Cell::new(instance.id),
            Cell::new(instance.task_id.as_deref().unwrap_or("-")),
            Cell::new(instance.ip.as_deref().unwrap_or("-")),
            Cell::new(revision),
            Cell::new(instance.state),
            Cell::new(
                instance
                    .target_health
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }
    println!("{table}");

    let summary = controller.summary();
    println!(
        "Service {}: {}/{} in service on revision {}, {} draining",
        controller.target().service_name,
        summary.current_in_service,
        desired,
        current_revision,
        summary.draining
    );
    if controller.is_converged() {
        println!("✓ Converged");
    } else {
        println!("… Not converged");
    }
    Ok(())
}

/// GET `<APIBaseUrl>/health` on the deployed gateway
pub async fn handle_health(timeout_secs: u64) -> Result<()> {
    let workspace = Workspace::open().await?;
    let state = workspace.load_state()?;
    let outputs = workspace
        .stack
        .stack_outputs(state.outputs(&workspace.stack.ids.load_balancer));
    let Some(base_url) = outputs.get(OUTPUT_API_BASE_URL) else {
        bail!("Stack '{}' has no {} yet; deploy it first", workspace.stack.name, OUTPUT_API_BASE_URL);
    };

    let url = format!("{}/health", base_url.trim_end_matches("/api/v1"));
    debug!("Checking {}", url);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    let status = response.status();
    if status.is_success() {
        println!("✓ {} responded {}", url, status);
        Ok(())
    } else {
        let body = response.text().await.unwrap_or_default();
        bail!("{} responded {}: {}", url, status, body);
    }
}
