//! Burrow command line
//!
//! Inspects a topology configuration (validate it, print the provisioning
//! plan, list connection URLs, check that the configured vhosts exist) or
//! applies it to a running broker with `provision` and `nuke`.

use burrow::config::BrokerConfig;
use burrow::management::{vhost_request, HttpManagementClient, VhostAction};
use burrow::observability::init_default_logging;
use burrow::topology::plan::TopologyPlan;
use burrow::topology::ResolvedTopology;
use burrow::transport::connection::REDACTED_PASSWORD;
use burrow::transport::LapinTransport;
use burrow::Broker;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

/// Declarative AMQP topology manager
#[derive(Parser)]
#[command(name = "burrow")]
#[command(about = "Declarative AMQP topology manager")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration
    Validate {
        /// Print the parsed configuration with passwords redacted
        #[arg(long)]
        show: bool,
    },
    /// Print the provisioning and teardown plan for every vhost
    Plan,
    /// Print the connection URL of every vhost
    Connections,
    /// Check that every configured vhost exists
    CheckVhosts,
    /// Provision the topology on the broker and leave it in place
    Provision,
    /// Provision the topology, then delete every object it asserts
    Nuke,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var_os("LOG_LEVEL").is_none() {
        let level = if cli.verbose > 1 { "TRACE" } else { "DEBUG" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Validate { show } => handle_validate(&config, show),
        Commands::Plan => handle_plan(&config),
        Commands::Connections => handle_connections(&config),
        Commands::CheckVhosts => handle_check_vhosts(&config).await,
        Commands::Provision => handle_provision(&config).await,
        Commands::Nuke => handle_nuke(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BrokerConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BrokerConfig::load_from_file(path)?);
    }

    for candidate in ["burrow.toml", "config/burrow.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BrokerConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create burrow.toml".into())
}

fn redacted(config: &BrokerConfig) -> BrokerConfig {
    let mut config = config.clone();
    for vhost in &mut config.vhosts {
        vhost.connection.password = REDACTED_PASSWORD.to_string();
        if vhost.connection.management.password.is_some() {
            vhost.connection.management.password = Some(REDACTED_PASSWORD.to_string());
        }
    }
    config
}

fn handle_validate(config: &BrokerConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    ResolvedTopology::resolve(config)?;
    if show {
        println!("{}", serde_json::to_string_pretty(&redacted(config))?);
    }
    info!("Configuration valid: {} vhost(s)", config.vhosts.len());
    Ok(())
}

fn handle_plan(config: &BrokerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let topology = ResolvedTopology::resolve(config)?;
    for vhost in topology.vhosts() {
        let plan = TopologyPlan::for_vhost(vhost);
        println!("vhost {} ({})", vhost.name, vhost.connection_url.redacted());
        println!("  provision:");
        for step in plan.provision_steps() {
            println!("    {step}");
        }
        println!("  teardown:");
        for step in plan.teardown_steps() {
            println!("    {step}");
        }
    }
    Ok(())
}

fn handle_connections(config: &BrokerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let topology = ResolvedTopology::resolve(config)?;
    for vhost in topology.vhosts() {
        println!("{}\t{}", vhost.name, vhost.connection_url.redacted());
    }
    Ok(())
}

async fn handle_check_vhosts(config: &BrokerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let topology = ResolvedTopology::resolve(config)?;
    let client = HttpManagementClient::new();

    let mut failures = 0usize;
    for vhost in topology.vhosts() {
        match vhost_request(&client, &vhost.management, VhostAction::Check, &vhost.name).await {
            Ok(status) => println!("ok\t{}\t{}", vhost.name, status),
            Err(e) => {
                failures += 1;
                println!("failed\t{}\t{}", vhost.name, e);
            }
        }
    }

    if failures > 0 {
        return Err(format!("{failures} vhost check(s) failed").into());
    }
    Ok(())
}

/// Create a broker over the network, nuking whatever was provisioned on failure
async fn connect_broker(config: &BrokerConfig) -> Result<Broker, Box<dyn std::error::Error>> {
    let created = Broker::create(
        config,
        Arc::new(LapinTransport::new()),
        Arc::new(HttpManagementClient::new()),
    )
    .await;
    match created {
        Ok(broker) => Ok(broker),
        Err(e) => {
            let (error, partial) = e.into_parts();
            if let Err(cleanup) = partial.nuke().await {
                error!("Cleanup after failed provisioning also failed: {}", cleanup);
            }
            Err(error.into())
        }
    }
}

async fn handle_provision(config: &BrokerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let broker = connect_broker(config).await?;
    for connection in broker.get_connections() {
        println!("provisioned\t{}\t{}", connection.vhost, connection.connection_url);
    }
    broker.shutdown().await?;
    Ok(())
}

async fn handle_nuke(config: &BrokerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let broker = connect_broker(config).await?;
    broker.nuke().await?;
    for vhost in &config.vhosts {
        println!("nuked\t{}", vhost.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_hides_every_password() {
        let config = BrokerConfig::from_toml_str(
            r#"
[[vhosts]]
name = "v1"

[vhosts.connection]
password = "amqp-secret"

[vhosts.connection.management]
password = "http-secret"

[[vhosts]]
name = "v2"
"#,
        )
        .unwrap();

        let shown = redacted(&config);
        let json = serde_json::to_string(&shown).unwrap();
        assert!(!json.contains("amqp-secret"));
        assert!(!json.contains("http-secret"));
        assert_eq!(shown.vhosts[1].connection.password, "***");
        assert_eq!(shown.vhosts[1].connection.management.password, None);
        assert_eq!(config.vhosts[0].connection.password, "amqp-secret");
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_provisioning() {
        let config = BrokerConfig::from_toml_str(
            r#"
[[vhosts]]
name = "v1"

[vhosts.connection]
hostname = "127.0.0.1"
port = 1
timeout_ms = 500

[vhosts.connection.retry]
attempts = 1
"#,
        )
        .unwrap();

        assert!(connect_broker(&config).await.is_err());
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let path = Some(PathBuf::from("/nonexistent/burrow.toml"));
        assert!(load_configuration(&path).is_err());
    }
}
