//! guardbench CLI — runs the child-safety benchmark and guardrail
//! synthesis pipeline from the terminal.

use clap::Parser;
use guardbench_core::{
    dataset, load_config, BenchScheduler, CriteriaRegistry, GatewayFactory, GuardbenchError,
    PersonaSet,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// guardbench: child-safety benchmarking for conversational LLMs
#[derive(Parser, Debug)]
#[command(name = "guardbench", version, about, long_about = None)]
struct Cli {
    /// Configuration file path (default: ./guardbench.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the benchmark over a records file
    Run {
        /// JSON file with input records
        #[arg(short, long)]
        records: PathBuf,

        /// Output directory (default: from config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Execution mode override: phased or inline
        #[arg(long)]
        mode: Option<String>,

        /// Prompt framing override: attack or defensive
        #[arg(long)]
        prompt_mode: Option<String>,

        /// Re-run records whose artifacts already exist
        #[arg(long)]
        force_reprocess: bool,
    },
    /// Inspect criteria assets
    Criteria {
        #[command(subcommand)]
        action: CriteriaAction,
    },
    /// Show the effective configuration
    Config,
}

#[derive(clap::Subcommand, Debug)]
enum CriteriaAction {
    /// List registered criteria and presets
    List,
    /// Resolve a selection expression against the registry
    Resolve {
        /// Selection expression (preset, category glob, or comma list)
        expression: String,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default_level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("guardbench={default_level},guardbench_core={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Run failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<(), GuardbenchError> {
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            records,
            output,
            mode,
            prompt_mode,
            force_reprocess,
        } => {
            if let Some(mode) = mode {
                config.execution.mode = match mode.as_str() {
                    "phased" => guardbench_core::ExecutionMode::Phased,
                    "inline" => guardbench_core::ExecutionMode::Inline,
                    other => {
                        return Err(guardbench_core::error::ConfigError::Invalid {
                            message: format!("unknown execution mode '{other}'"),
                        }
                        .into())
                    }
                };
            }
            if let Some(prompt_mode) = prompt_mode {
                config.execution.prompt_mode = match prompt_mode.as_str() {
                    "attack" => guardbench_core::PromptMode::Attack,
                    "defensive" => guardbench_core::PromptMode::Defensive,
                    other => {
                        return Err(guardbench_core::error::ConfigError::Invalid {
                            message: format!("unknown prompt mode '{other}'"),
                        }
                        .into())
                    }
                };
            }
            if force_reprocess {
                config.execution.force_reprocess = true;
            }
            let out_dir = output.unwrap_or_else(|| config.execution.output_dir.clone());

            let registry =
                CriteriaRegistry::load(&config.assets.manifest, &config.assets.rubric_root)?;
            let personas = PersonaSet::load(&config.assets.personas)?;
            let records = dataset::load_records(&records)?;

            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received; finishing the current record and unloading");
                    ctrl_c_cancel.cancel();
                }
            });

            let factory = Arc::new(GatewayFactory::new(&config));
            let scheduler = BenchScheduler::new(config, registry, personas, factory, cancel);
            let summary = scheduler.run(&records, &out_dir).await?;

            info!(
                processed = summary.processed,
                failed = summary.failed,
                partial = summary.partial,
                guardrail_bundles = summary.guardrail_bundles,
                output = %out_dir.display(),
                "Benchmark finished"
            );
            println!(
                "{} records processed ({} failed, {} partial), {} guardrail bundles -> {}",
                summary.processed,
                summary.failed,
                summary.partial,
                summary.guardrail_bundles,
                out_dir.display()
            );
            Ok(())
        }
        Commands::Criteria { action } => {
            let registry =
                CriteriaRegistry::load(&config.assets.manifest, &config.assets.rubric_root)?;
            match action {
                CriteriaAction::List => {
                    for criterion in registry.criteria() {
                        println!(
                            "{:<64} {}.{}",
                            criterion.id, criterion.category, criterion.subcategory
                        );
                    }
                    let presets = registry.preset_names();
                    if !presets.is_empty() {
                        println!("\npresets: {}", presets.join(", "));
                    }
                }
                CriteriaAction::Resolve { expression } => {
                    for id in registry.resolve_selection(&expression)? {
                        println!("{id}");
                    }
                }
            }
            Ok(())
        }
        Commands::Config => {
            let rendered = serde_json::to_string_pretty(&config)?;
            println!("{rendered}");
            Ok(())
        }
    }
}
