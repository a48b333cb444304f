#![deny(unsafe_code)]

//! gnlink CLI: drives the `echo_demo` and `nlctrl` families against an
//! in-process responder.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use gnlink_config::AppConfig;
use gnlink_core::ipc::{Client, ClientError, MemoryEndpoint};
use gnlink_core::{Attribute, FamilyId, LocalNode, Message, demo};

/// gnlink: attribute-oriented request/response over datagrams.
#[derive(Debug, Parser)]
#[command(name = "gnlink", version = gnlink_core::build_info::VERSION, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "gnlink.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send a message to the echo command and print the reply.
    Echo {
        /// Text to echo.
        message: String,
    },

    /// Call the command that always answers with an error.
    Fail {
        /// Optional text attached to the request.
        message: Option<String>,
    },

    /// Run a dump and print every part.
    Dump,

    /// Resolve a family name through the control family.
    Resolve {
        /// Family name, e.g. `echo_demo` or `nlctrl`.
        name: String,
    },

    /// List every registered family.
    Families,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// Print version and build information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config).await?;

    let filter = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
    if !found {
        debug!(path = %cli.config.display(), "config file not found, using defaults");
    }

    match cli.command {
        Commands::Config { show } => cmd_config(&cli.config, &config, show),
        Commands::Version => {
            println!("gnlink {}", gnlink_core::build_info::version_string());
            Ok(())
        }
        command => run_against_node(&config, command).await,
    }
}

async fn run_against_node(config: &AppConfig, command: Commands) -> Result<()> {
    let (node, _) = LocalNode::demo(config).context("failed to start local responder")?;
    let mut client = node.client()?;

    let outcome = match command {
        Commands::Echo { message } => cmd_echo(&mut client, &message).await,
        Commands::Fail { message } => cmd_fail(&mut client, message.as_deref()).await,
        Commands::Dump => cmd_dump(&mut client).await,
        Commands::Resolve { name } => cmd_resolve(&mut client, &name).await,
        Commands::Families => cmd_families(&mut client).await,
        Commands::Config { .. } | Commands::Version => Ok(()),
    };

    drop(client);
    node.shutdown().await?;
    outcome
}

/// Resolve the demo family the way an external requester would.
async fn demo_family(client: &mut Client<MemoryEndpoint>) -> Result<FamilyId> {
    let id = client
        .resolve_family(demo::FAMILY_NAME)
        .await
        .context("failed to resolve echo_demo")?;
    debug!(id, "resolved {}", demo::FAMILY_NAME);
    Ok(id)
}

async fn cmd_echo(client: &mut Client<MemoryEndpoint>, message: &str) -> Result<()> {
    let family = demo_family(client).await?;
    let request = Message::request(family, demo::CMD_ECHO, demo::VERSION)
        .with_attribute(Attribute::string(demo::ATTR_MSG, message)?);
    let reply = client.request(request).await?;
    info!(sequence = reply.sequence, "echo reply");
    println!("{}", reply.attributes.get_str(demo::ATTR_MSG)?);
    Ok(())
}

async fn cmd_fail(client: &mut Client<MemoryEndpoint>, message: Option<&str>) -> Result<()> {
    let family = demo_family(client).await?;
    let mut request = Message::request(family, demo::CMD_ECHO_FAIL, demo::VERSION);
    if let Some(message) = message {
        request = request.with_attribute(Attribute::string(demo::ATTR_MSG, message)?);
    }
    match client.request(request).await {
        Err(ClientError::Remote { code }) => {
            println!("responder answered with error {code}");
            Ok(())
        }
        Ok(reply) => bail!("expected an error frame, got {}", reply.kind),
        Err(err) => Err(err.into()),
    }
}

async fn cmd_dump(client: &mut Client<MemoryEndpoint>) -> Result<()> {
    let family = demo_family(client).await?;
    let parts = client
        .dump(Message::request(family, demo::CMD_ECHO_DUMP, demo::VERSION))
        .await?;
    for part in &parts {
        println!("[{}] {}", part.sequence, part.attributes.get_str(demo::ATTR_MSG)?);
    }
    println!("{} parts, done", parts.len());
    Ok(())
}

async fn cmd_resolve(client: &mut Client<MemoryEndpoint>, name: &str) -> Result<()> {
    let info = client.family_info(name).await?;
    println!(
        "{}: id={:#06x} version={} max_attr={}",
        info.name, info.id, info.version, info.max_attr
    );
    Ok(())
}

async fn cmd_families(client: &mut Client<MemoryEndpoint>) -> Result<()> {
    let families = client.list_families().await?;
    println!("{:<8} {:<16} {:>7} {:>8}", "ID", "NAME", "VERSION", "MAX_ATTR");
    for info in families {
        println!(
            "{:<#8x} {:<16} {:>7} {:>8}",
            info.id, info.name, info.version, info.max_attr
        );
    }
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        println!("{}", config.to_toml()?);
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Load the config file, or defaults if it does not exist.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("invalid config at {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_echo() {
        let cli = Cli::try_parse_from(["gnlink", "-vv", "echo", "hello"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Echo { ref message } if message == "hello"));
    }

    #[test]
    fn test_parse_config_path() {
        let cli = Cli::try_parse_from(["gnlink", "--config", "/tmp/x.toml", "dump"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/x.toml"));
        assert!(matches!(cli.command, Commands::Dump));
    }

    #[test]
    fn test_echo_requires_message() {
        assert!(Cli::try_parse_from(["gnlink", "echo"]).is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_config_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let (config, found) = load_config(&dir.path().join("absent.toml")).await.unwrap();
        assert!(!found);
        assert_eq!(config, AppConfig::default());
    }

    #[test_log::test(tokio::test)]
    async fn test_node_commands_succeed() {
        let config = AppConfig::default();
        run_against_node(&config, Commands::Echo { message: "hi".into() })
            .await
            .unwrap();
        run_against_node(&config, Commands::Fail { message: None })
            .await
            .unwrap();
        run_against_node(&config, Commands::Dump).await.unwrap();
        run_against_node(&config, Commands::Families).await.unwrap();
        assert!(
            run_against_node(&config, Commands::Resolve { name: "nope".into() })
                .await
                .is_err()
        );
    }
}
