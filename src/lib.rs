pub mod cli;
pub mod colors;
pub mod config;
pub mod dataset;
pub mod device;
pub mod errors;
pub mod loader;
pub mod mocks;
pub mod model;
pub mod onnx;
pub mod predict;
pub mod tiles;
pub mod web_ui;

use tracing::info;

pub use cli::PredictArgs;
pub use config::Config;
pub use dataset::TileDataset;
pub use device::{Device, DevicePreference};
pub use errors::{Result, TileSegError};
pub use model::{ModelFactory, ModelRegistry, ModelSpec, SegmentationNetwork};
pub use predict::{PredictReport, Predictor};
pub use tiles::Tile;

/// Runs the `predict` subcommand.
///
/// The config is loaded and the model resolved before anything is written,
/// so a bad config, an unknown model or an incompatible checkpoint leave
/// `args.out` untouched.
pub fn run_predict(args: &PredictArgs, registry: &ModelRegistry) -> Result<PredictReport> {
    let config = Config::from_path(&args.config)?.with_overrides(args.tile_size, args.batch_size);

    let mut registry = registry.clone();
    if let Some(ext_path) = &args.ext_path {
        let count = registry.load_extensions(ext_path)?;
        info!(count, path = %ext_path.display(), "extension models loaded");
    }

    let device = Device::resolve(args.device, args.device_id);
    let spec = ModelSpec::from_config(&config);
    let network = registry.resolve(&spec, &args.checkpoint, &device)?;

    let dataset = TileDataset::new(
        &args.tiles,
        &config,
        config.model.tile_size,
        args.tile_overlap,
    )?;
    let report = Predictor::new(network.as_ref(), &dataset, &args.out, &config.colors())?
        .run(config.model.batch_size, args.workers)?;

    if args.web_ui {
        let base_url = args.web_ui_base_url.as_deref().unwrap_or("./");
        web_ui::web_ui(
            &args.out,
            base_url,
            &report.tiles,
            "png",
            args.web_ui_template.as_deref(),
        )?;
    }

    Ok(report)
}
