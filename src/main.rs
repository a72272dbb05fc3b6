use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod build;
mod cli;
mod cloud;
mod controller;
mod error;
mod graph;
mod provision;
mod registry;
mod resources;
mod settings;
mod stack;

use settings::BuilderKind;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what a deploy would create, update or delete
    Plan {
        /// Image builder to use instead of the configured one
        #[arg(long, value_enum)]
        builder: Option<BuilderKind>,
    },
    /// Provision the stack and roll the service out to its desired count
    #[command(visible_alias = "up")]
    Deploy {
        /// Image builder to use instead of the configured one
        #[arg(long, value_enum)]
        builder: Option<BuilderKind>,
        /// Provision resources only; do not wait for the service to converge
        #[arg(long)]
        skip_rollout: bool,
    },
    /// Tear the stack down (retained resources are kept)
    Destroy {
        /// Image builder to use instead of the configured one
        #[arg(long, value_enum)]
        builder: Option<BuilderKind>,
    },
    /// Build and publish the gateway image only
    Publish {
        /// Image builder to use instead of the configured one
        #[arg(long, value_enum)]
        builder: Option<BuilderKind>,
    },
    /// Show the service's instances and whether it has converged
    #[command(visible_alias = "ps")]
    Status,
    /// Show recorded resource outputs and the API base URL
    Outputs,
    /// Call the gateway's health endpoint through the load balancer
    Health {
        /// Request timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Validate configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for all commands
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { builder } => cli::handle_plan(builder).await,
        Commands::Deploy {
            builder,
            skip_rollout,
        } => cli::handle_deploy(builder, skip_rollout).await,
        Commands::Destroy { builder } => cli::handle_destroy(builder).await,
        Commands::Publish { builder } => cli::handle_publish(builder).await,
        Commands::Status => cli::handle_status().await,
        Commands::Outputs => cli::handle_outputs().await,
        Commands::Health { timeout } => cli::handle_health(timeout).await,
        Commands::CheckConfig => cli::handle_check_config(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_deploy_with_builder() {
        let cli = Cli::try_parse_from(["gateway-stack", "deploy", "--builder", "static"]).unwrap();
        match cli.command {
            Commands::Deploy {
                builder,
                skip_rollout,
            } => {
                assert_eq!(builder, Some(BuilderKind::Static));
                assert!(!skip_rollout);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_unknown_builder_is_rejected() {
        assert!(Cli::try_parse_from(["gateway-stack", "publish", "--builder", "kaniko"]).is_err());
    }

    #[test]
    fn test_status_alias() {
        let cli = Cli::try_parse_from(["gateway-stack", "ps"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));
    }
}
