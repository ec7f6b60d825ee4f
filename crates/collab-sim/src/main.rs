//! collab-sim: replay collaborative editing scenarios from the command line.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use collab_core::SessionConfig;

#[derive(Parser, Debug)]
#[command(name = "collab-sim")]
#[command(about = "Replay collaborative editing scenarios and check convergence")]
struct Args {
    /// Scenario files (.json, .yaml or .yml)
    #[arg(required = true)]
    scenarios: Vec<PathBuf>,

    /// Print the converged value of each scenario as JSON
    #[arg(long)]
    print: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,collab_core=debug,collab_sim=debug"
    } else {
        "info,collab_core=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = SessionConfig::from_env().context("Invalid session configuration")?;

    let mut failed = 0;
    for path in &args.scenarios {
        let scenario =
            collab_sim::load(path).with_context(|| format!("Failed to load scenario {}", path.display()))?;
        match collab_sim::replay(&scenario, &config) {
            Ok(report) => {
                info!(
                    "{:?} converged after {} deliveries ({} warning(s))",
                    path,
                    report.delivered,
                    report.warnings.len()
                );
                if args.print {
                    println!("{}", serde_json::to_string_pretty(&report.value)?);
                }
            }
            Err(e) => {
                error!("{:?} failed: {}", path, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} scenario(s) failed", failed, args.scenarios.len());
    }
    Ok(())
}
