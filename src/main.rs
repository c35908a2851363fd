use anyhow::{ensure, Context, Result};
use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use tile_seg_rs::{
    cli::{Cli, Command},
    run_predict, ModelRegistry,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Predict(args) => {
            ensure!(args.tiles.is_dir(), "Tiles directory does not exist");

            let registry = ModelRegistry::with_builtins();
            let report = run_predict(&args, &registry).with_context(|| {
                format!("Prediction over {} failed", args.tiles.display())
            })?;
            println!(
                "{} masks written to {}",
                report.written.len(),
                args.out.display()
            );
        }
    }

    Ok(())
}
