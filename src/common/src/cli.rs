use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared by every command
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(
        short,
        long,
        global = true,
        help = "Enable quiet mode (minimal output)"
    )]
    pub quiet: bool,
}

/// Commands that inspect configuration without touching the store
#[derive(Subcommand, Debug, Clone)]
pub enum CommonCommands {
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Initialize logging based on CLI arguments
    ///
    /// `RUST_LOG` wins when set; otherwise the flags pick the level.
    pub fn init_logging(args: &CommonArgs) {
        let level = if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        // Logs go to stderr so reports on stdout stay machine readable.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("Catalog Reconcile Configuration:");
            println!("================================");
            println!("Database DSN: {}", config.database.dsn);
            println!("Max connections: {}", config.database.max_connections);
            println!("Max retries: {}", config.reconcile.max_retries);
            println!("Base delay: {}ms", config.reconcile.base_delay_ms);
            println!(
                "Max concurrent groups: {}",
                config.reconcile.max_concurrent_groups
            );
            match config.reconcile.run_timeout {
                Some(timeout) => println!("Run timeout: {timeout:?}"),
                None => println!("Run timeout: none"),
            }
            println!("Dry run: {}", config.reconcile.dry_run);

            for (name, entity) in &config.entities {
                let key = entity
                    .natural_key
                    .iter()
                    .map(|k| {
                        if k.null_safe {
                            format!("{} (null-safe)", k.column)
                        } else {
                            k.column.clone()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let relations = entity
                    .relations
                    .iter()
                    .map(|r| format!("{}.{}", r.table, r.column))
                    .collect::<Vec<_>>()
                    .join(", ");
                println!(
                    "Entity {name}: table={} id={} key=[{key}] relations=[{relations}]",
                    entity.table, entity.id_column
                );
            }
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");
        config.validate()?;
        log::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Handle the configuration-only commands
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<()> {
        match command {
            CommonCommands::Config { json } => display_config(config, *json),
            CommonCommands::Validate => validate_config(config),
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(())
            }
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}
