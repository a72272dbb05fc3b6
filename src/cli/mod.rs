// Command handlers
//
// Every command works on a `Workspace`: validated settings, the assembled
// stack, and the local cloud inventory and registry persisted in the state
// directory so separate invocations see the same world.

pub mod service;
pub mod stack;

use anyhow::{bail, Context, Result};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Attribute, Cell, Table};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::build::{DockerBuilder, ImageBuilder, ImagePublisher, StaticBuilder};
use crate::cloud::SimulatedCloud;
use crate::provision::state::StackState;
use crate::provision::{ImagePipeline, ProvisionOptions, Provisioner};
use crate::registry::{MemoryRegistry, RegistryApi};
use crate::settings::{BuilderKind, RegistryDriver, Settings};
use crate::stack::{ContainerEnvironment, EnvKey, GatewayStack, ValueSource};

pub use service::{handle_health, handle_status};
pub use stack::{handle_deploy, handle_destroy, handle_outputs, handle_plan, handle_publish};

pub struct Workspace {
    pub settings: Settings,
    pub stack: GatewayStack,
    pub cloud: Arc<SimulatedCloud>,
    state_dir: PathBuf,
}

impl Workspace {
    /// Load settings, resolve the container environment and assemble the stack
    pub async fn open() -> Result<Self> {
        let mut settings = Settings::new().context("Failed to load configuration")?;

        if settings.registry.driver == RegistryDriver::Ecr && settings.stack.account_id.is_empty()
        {
            settings.stack.account_id = resolve_account_id(&settings.stack.region).await?;
        }

        let environment = ContainerEnvironment::from_process_env()?;
        let stack = GatewayStack::build(&settings, environment)?;
        let state_dir = PathBuf::from(&settings.stack.state_dir);
        let cloud = SimulatedCloud::open(
            &state_dir.join("cloud.json"),
            &settings.stack.region,
            &settings.stack.account_id,
            settings.controller.time_scale,
        )?;
        debug!(
            stack = %stack.name,
            state_dir = %state_dir.display(),
            "Opened workspace"
        );

        Ok(Self {
            settings,
            stack,
            cloud: Arc::new(cloud),
            state_dir,
        })
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn load_state(&self) -> Result<StackState> {
        StackState::load(&self.state_path(), &self.stack.name)
    }

    async fn registry(&self) -> Result<Arc<dyn RegistryApi>> {
        match self.settings.registry.driver {
            RegistryDriver::Memory => Ok(Arc::new(MemoryRegistry::open(
                &self.state_dir.join("registry.json"),
                &self.settings.stack.region,
                &self.settings.stack.account_id,
            )?)),
            #[cfg(feature = "aws")]
            RegistryDriver::Ecr => Ok(Arc::new(
                crate::registry::EcrRegistry::new(
                    &self.settings.stack.region,
                    &self.settings.stack.account_id,
                    &self.stack.name,
                )
                .await?,
            )),
            #[cfg(not(feature = "aws"))]
            RegistryDriver::Ecr => bail!("The ecr registry driver requires the 'aws' feature"),
        }
    }

    /// Image pipeline using `builder` or the configured builder
    pub async fn pipeline(&self, builder: Option<BuilderKind>) -> Result<Arc<dyn ImagePipeline>> {
        let kind = builder.unwrap_or(self.settings.image.builder);
        let builder: Arc<dyn ImageBuilder> = match kind {
            BuilderKind::Docker => Arc::new(DockerBuilder::new(Some(
                self.settings.image.container_cli.as_str(),
            ))),
            BuilderKind::Static => Arc::new(StaticBuilder),
        };
        info!("Using {} image builder", builder.name());
        let base_dir = std::env::current_dir().context("Failed to get current directory")?;
        Ok(Arc::new(ImagePublisher::new(
            builder,
            self.registry().await?,
            &base_dir,
        )))
    }

    pub async fn provisioner(&self, builder: Option<BuilderKind>) -> Result<Provisioner> {
        let pipeline = self.pipeline(builder).await?;
        Ok(Provisioner::new(
            self.cloud.clone(),
            pipeline,
            self.load_state()?,
            ProvisionOptions::from(&self.settings.controller),
        )
        .with_state_path(self.state_path()))
    }
}

#[cfg(feature = "aws")]
async fn resolve_account_id(region: &str) -> Result<String> {
    crate::registry::ecr::caller_account_id(region).await
}

#[cfg(not(feature = "aws"))]
async fn resolve_account_id(_region: &str) -> Result<String> {
    bail!("stack.account_id is empty and the 'aws' feature is not enabled to look it up")
}

/// Table with the house style
pub(crate) fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
                .collect::<Vec<_>>(),
        );
    table
}

/// The container's five settings with their value, origin and effect
fn environment_table(environment: &ContainerEnvironment) -> Table {
    let mut table = new_table(&["KEY", "VALUE", "SOURCE", "EFFECT"]);
    for key in EnvKey::ALL {
        let source = environment.source(key);
        let source_cell = match source {
            ValueSource::Override => Cell::new(source).add_attribute(Attribute::Bold),
            ValueSource::Default => Cell::new(source),
        };
        table.add_row(vec![
            Cell::new(key),
            Cell::new(environment.get(key)),
            source_cell,
            Cell::new(key.effect()),
        ]);
    }
    table
}

/// Check the configuration and print any problem
pub fn handle_check_config() -> Result<()> {
    println!("Checking stack configuration...");
    match Settings::new() {
        Ok(settings) => {
            let environment = ContainerEnvironment::from_process_env()?;
            let stack = GatewayStack::build(&settings, environment)?;
            stack.graph.validate()?;
            println!(
                "✓ Configuration is valid ({} resources in stack '{}')",
                stack.graph.len(),
                stack.name
            );
            println!("  Region: {}  Account: {}", stack.region, stack.account_id);

            let mut parts = new_table(&["PART", "RESOURCE"]);
            for (part, id) in stack.ids.parts() {
                parts.add_row(vec![Cell::new(part), Cell::new(id)]);
            }
            println!("{parts}");
            println!("{}", environment_table(&stack.environment));
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_table_shows_overrides() {
        let environment = ContainerEnvironment::resolve(|key| {
            (key == "DEBUG").then(|| "true".to_string())
        })
        .unwrap();
        let rendered = environment_table(&environment).to_string();
        assert!(rendered.contains("API_KEY_PARAM_NAME"));
        assert!(rendered.contains("/bedrock-api/BedrockProxyAPIKey"));
        assert!(rendered.contains("override"));
        assert!(rendered.contains("verbose logging in the gateway"));
        assert_eq!(rendered.matches("default").count(), 4);
    }

    #[test]
    fn test_table_has_bold_headers() {
        let mut table = new_table(&["RESOURCE", "ACTION"]);
        table.add_row(vec!["network/GatewayVpc", "create"]);
        let rendered = table.to_string();
        assert!(rendered.contains("RESOURCE"));
        assert!(rendered.contains("network/GatewayVpc"));
    }
}
