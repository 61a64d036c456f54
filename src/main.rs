use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::Configuration;
use reconciler::RunReport;
use reconciler::command::{self, MergeOptions};
use tokio::sync::watch;

/// Exit status for errors that stop a run before any group is processed.
const EXIT_SYSTEMIC: i32 = 2;

#[derive(Parser)]
#[command(name = "catalog-reconcile")]
#[command(about = "Merge duplicate catalog rows and repoint their references")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge categories sharing a name and repoint their products
    MergeCategories(MergeArgs),
    /// Merge products sharing a name and category (a missing category matches)
    MergeProducts(MergeArgs),
    /// Merge any entity configured under [entities.<name>]
    Merge {
        /// Entity name
        entity: String,
        #[command(flatten)]
        args: MergeArgs,
    },
    /// Compare an entity's relation registry with the schema's foreign keys
    Relations {
        /// Entity name
        entity: String,
        #[arg(long, help = "Print the audit as JSON")]
        json: bool,
    },
    #[command(flatten)]
    Common(CommonCommands),
}

#[derive(Args, Debug, Clone, Copy)]
struct MergeArgs {
    #[arg(long, help = "Run every merge, then roll it back")]
    dry_run: bool,

    #[arg(long, help = "Print the run report as JSON")]
    json: bool,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

/// Spawn the signal listener; the receiver flips to `true` on shutdown.
fn shutdown_channel() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                log::warn!("Shutdown requested, finishing in-flight groups");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => log::error!("Signal handling unavailable: {e:#}"),
        }
    });
    shutdown_rx
}

async fn merge(config: &Configuration, entity: &str, args: MergeArgs) -> Result<i32> {
    let options = MergeOptions {
        dry_run: args.dry_run,
    };
    let report = command::merge_entity(config, entity, options, shutdown_channel()).await?;
    print_report(&report, args.json)?;
    Ok(report.exit_code())
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        let json =
            serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
        println!("{json}");
    } else {
        print!("{}", report.summary());
    }
    Ok(())
}

async fn relations(config: &Configuration, entity: &str, json: bool) -> Result<i32> {
    let audit = command::audit_relations(config, entity).await?;

    if json {
        let json = serde_json::to_string_pretty(&audit).context("Failed to serialize audit")?;
        println!("{json}");
    } else {
        println!("Relations of {}:", audit.entity);
        for relation in &audit.registered {
            let status = if audit.undeclared.contains(relation) {
                "registered, no schema foreign key"
            } else {
                "registered"
            };
            println!("  {}.{} ({status})", relation.table, relation.foreign_key_column);
        }
        for relation in &audit.unregistered {
            println!(
                "  {}.{} (schema only, MISSING from registry)",
                relation.table, relation.foreign_key_column
            );
        }
        if audit.is_complete() {
            println!("Registry covers every schema foreign key.");
        }
    }

    Ok(if audit.is_complete() { 0 } else { 1 })
}

async fn run(cli: Cli) -> Result<i32> {
    let config = utils::load_config(cli.common.config.as_ref())?;

    match cli.command {
        Commands::MergeCategories(args) => merge(&config, "categories", args).await,
        Commands::MergeProducts(args) => merge(&config, "products", args).await,
        Commands::Merge { entity, args } => merge(&config, &entity, args).await,
        Commands::Relations { entity, json } => relations(&config, &entity, json).await,
        Commands::Common(common_cmd) => {
            utils::handle_common_command(&common_cmd, &config)?;
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging based on CLI arguments
    utils::init_logging(&cli.common);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            std::process::exit(EXIT_SYSTEMIC);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_merge_flags_parse() {
        let cli = Cli::try_parse_from(["catalog-reconcile", "merge-products", "--dry-run", "-q"])
            .unwrap();
        assert!(cli.common.quiet);
        match cli.command {
            Commands::MergeProducts(args) => {
                assert!(args.dry_run);
                assert!(!args.json);
            }
            _ => panic!("expected merge-products"),
        }
    }

    #[test]
    fn test_generic_merge_takes_entity_name() {
        let cli = Cli::try_parse_from(["catalog-reconcile", "merge", "brands", "--json"]).unwrap();
        match cli.command {
            Commands::Merge { entity, args } => {
                assert_eq!(entity, "brands");
                assert!(args.json);
            }
            _ => panic!("expected merge"),
        }
    }

    #[test]
    fn test_common_commands_are_available() {
        let cli = Cli::try_parse_from(["catalog-reconcile", "config", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Common(CommonCommands::Config { json: true })
        ));
    }
}
