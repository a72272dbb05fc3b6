// Docker/Podman CLI operations

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

/// Fail early if the container CLI is not installed
pub(crate) fn check_cli(container_cli: &str) -> Result<()> {
    let cli_check = Command::new(container_cli).arg("--version").output();
    if cli_check.is_err() {
        bail!(
            "{} CLI not found. Please install Docker or Podman, or use the static builder.",
            container_cli
        );
    }
    Ok(())
}

/// Build an image from a staged context
pub(crate) fn build_image(
    container_cli: &str,
    context_dir: &Path,
    build_file: &str,
    platform: &str,
    image_tag: &str,
) -> Result<()> {
    check_cli(container_cli)?;

    info!("Building image with {}: {}", container_cli, image_tag);

    let mut cmd = Command::new(container_cli);
    cmd.arg("build")
        .arg("-f")
        .arg(context_dir.join(build_file))
        .arg("--platform")
        .arg(platform)
        .arg("-t")
        .arg(image_tag)
        .arg(context_dir);

    debug!("Executing command: {:?}", cmd);

    let status = cmd
        .status()
        .with_context(|| format!("Failed to execute {} build", container_cli))?;

    if !status.success() {
        bail!("{} build failed with status: {}", container_cli, status);
    }

    Ok(())
}

/// Local image id of a tag
pub(crate) fn image_id(container_cli: &str, image_tag: &str) -> Result<String> {
    let output = Command::new(container_cli)
        .args(["image", "inspect", "--format", "{{.Id}}"])
        .arg(image_tag)
        .output()
        .with_context(|| format!("Failed to execute {} image inspect", container_cli))?;

    if !output.status.success() {
        bail!(
            "{} image inspect {} failed: {}",
            container_cli,
            image_tag,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if id.is_empty() {
        bail!("{} reported no image id for {}", container_cli, image_tag);
    }
    Ok(id)
}

/// Point `target` at the image tagged `source`
pub(crate) fn tag_image(container_cli: &str, source: &str, target: &str) -> Result<()> {
    let mut cmd = Command::new(container_cli);
    cmd.arg("tag").arg(source).arg(target);

    debug!("Executing command: {:?}", cmd);

    let status = cmd
        .status()
        .with_context(|| format!("Failed to execute {} tag", container_cli))?;

    if !status.success() {
        bail!("{} tag failed with status: {}", container_cli, status);
    }

    Ok(())
}

/// Push image to container registry
pub(crate) fn docker_push(container_cli: &str, image_tag: &str) -> Result<()> {
    info!("Pushing image to registry: {}", image_tag);

    let mut cmd = Command::new(container_cli);
    cmd.arg("push").arg(image_tag);

    debug!("Executing command: {:?}", cmd);

    let status = cmd
        .status()
        .with_context(|| format!("Failed to execute {} push", container_cli))?;

    if !status.success() {
        bail!("{} push failed with status: {}", container_cli, status);
    }

    Ok(())
}

/// Login to container registry
pub(crate) fn docker_login(
    container_cli: &str,
    registry: &str,
    username: &str,
    password: &str,
) -> Result<()> {
    debug!(
        "Executing: {} login {} --username {} --password-stdin",
        container_cli, registry, username
    );

    let status = Command::new(container_cli)
        .arg("login")
        .arg(registry)
        .arg("--username")
        .arg(username)
        .arg("--password-stdin")
        .stdin(std::process::Stdio::piped())
        .spawn()
        .and_then(|mut child| {
            use std::io::Write;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(password.as_bytes())?;
            }
            child.wait()
        })
        .with_context(|| format!("Failed to execute {} login", container_cli))?;

    if !status.success() {
        bail!("{} login failed with status: {}", container_cli, status);
    }

    Ok(())
}
