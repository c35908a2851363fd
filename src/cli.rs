use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::device::DevicePreference;

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Predict masks, from given inputs and an already trained model
    Predict(PredictArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PredictArgs {
    /// Tiles directory path
    pub tiles: PathBuf,

    /// Output directory path
    pub out: PathBuf,

    /// Path to the trained model to use
    #[arg(long)]
    pub checkpoint: PathBuf,

    /// Path to the configuration file
    #[arg(long)]
    pub config: PathBuf,

    /// Tile pixels overlap
    #[arg(long = "tile_overlap", default_value_t = 64)]
    pub tile_overlap: u32,

    /// If set, override tile size value from config file
    #[arg(long = "tile_size", value_parser = positive::<u32>)]
    pub tile_size: Option<u32>,

    /// Path to a directory of extension model manifests
    #[arg(long = "ext_path")]
    pub ext_path: Option<PathBuf>,

    /// Number of workers to load images
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// If set, override batch_size value from config file
    #[arg(long = "batch_size", value_parser = positive::<usize>)]
    pub batch_size: Option<usize>,

    /// Activate Web UI output
    #[arg(long = "web_ui")]
    pub web_ui: bool,

    /// Alternate Web UI base URL
    #[arg(long = "web_ui_base_url")]
    pub web_ui_base_url: Option<String>,

    /// Alternate Web UI template path
    #[arg(long = "web_ui_template")]
    pub web_ui_template: Option<PathBuf>,

    /// Compute device
    #[arg(long, value_enum, default_value_t = DevicePreference::Auto)]
    pub device: DevicePreference,

    /// Accelerator device id
    #[arg(long = "device_id", default_value_t = 0)]
    pub device_id: i32,
}

fn positive<T>(s: &str) -> Result<T, String>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value: T = s.parse().map_err(|e| format!("`{s}` is not a number: {e}"))?;
    if value > T::default() {
        Ok(value)
    } else {
        Err(format!("`{s}` must be greater than zero"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<PredictArgs, clap::Error> {
        let cli = Cli::try_parse_from(args)?;
        let Command::Predict(args) = cli.command;
        Ok(args)
    }

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() -> Result<(), clap::Error> {
        let args = parse(&[
            "tile-seg",
            "predict",
            "tiles",
            "out",
            "--checkpoint",
            "model.onnx",
            "--config",
            "config.toml",
        ])?;
        assert_eq!(args.tiles, PathBuf::from("tiles"));
        assert_eq!(args.out, PathBuf::from("out"));
        assert_eq!(args.tile_overlap, 64);
        assert_eq!(args.workers, 0);
        assert_eq!(args.tile_size, None);
        assert_eq!(args.batch_size, None);
        assert!(!args.web_ui);
        assert_eq!(args.device, DevicePreference::Auto);
        Ok(())
    }

    #[test]
    fn test_snake_case_flags() -> Result<(), clap::Error> {
        let args = parse(&[
            "tile-seg",
            "predict",
            "tiles",
            "out",
            "--checkpoint",
            "model.onnx",
            "--config",
            "config.toml",
            "--tile_overlap",
            "32",
            "--tile_size",
            "256",
            "--batch_size",
            "4",
            "--workers",
            "2",
            "--web_ui",
            "--web_ui_base_url",
            "https://example.com",
            "--device",
            "cpu",
        ])?;
        assert_eq!(args.tile_overlap, 32);
        assert_eq!(args.tile_size, Some(256));
        assert_eq!(args.batch_size, Some(4));
        assert_eq!(args.workers, 2);
        assert!(args.web_ui);
        assert_eq!(args.web_ui_base_url.as_deref(), Some("https://example.com"));
        assert_eq!(args.device, DevicePreference::Cpu);
        Ok(())
    }

    #[test]
    fn test_required_and_positive_arguments() {
        assert!(parse(&["tile-seg", "predict", "tiles", "out", "--config", "c.toml"]).is_err());
        assert!(parse(&[
            "tile-seg",
            "predict",
            "tiles",
            "out",
            "--checkpoint",
            "m.onnx",
            "--config",
            "c.toml",
            "--batch_size",
            "0",
        ])
        .is_err());
    }
}
