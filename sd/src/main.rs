//! studiod CLI entry point

use clap::Parser;
use eyre::{Context, Result};

use studiod::cli::{Cli, Command};
use studiod::config::Config;
use studiod::render::Validator;
use studiod::store::JobStore;

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => studiod::daemon::run(config).await,
        Command::Check => {
            println!("studiod v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "  kv: {}",
                config.kv.url.as_deref().unwrap_or("(in-memory only)")
            );
            println!(
                "  llm: {} (max {} concurrent, queue {})",
                config.llm.command, config.llm.max_concurrent, config.llm.max_queue_size
            );
            println!(
                "  render: max {}s at {} concurrent, queue {}",
                config.render.max_duration_secs, config.render.max_concurrent, config.render.max_queue_size
            );
            println!("  orchestration: {} parallel steps", config.orchestration.max_parallel_steps);
            Ok(())
        }
        Command::Validate { file } => {
            let source = std::fs::read_to_string(&file)
                .context(format!("Failed to read pattern from {}", file.display()))?;
            let store = JobStore::new(std::sync::Arc::new(kvstore::MemoryKv::new()));
            let validator = Validator::new(store, config.render.max_pattern_length);
            let outcome = validator.validate(&source).await;

            if outcome.report.is_valid {
                println!("valid ({} ms)", outcome.report.validation_time_ms);
                for warning in &outcome.report.warnings {
                    println!("warning: {}", warning);
                }
                Ok(())
            } else {
                for issue in &outcome.report.errors {
                    match (issue.line, issue.column) {
                        (Some(line), Some(column)) => {
                            eprintln!("error at {}:{}: {}", line, column, issue.message)
                        }
                        _ => eprintln!("error: {}", issue.message),
                    }
                }
                std::process::exit(1);
            }
        }
    }
}
