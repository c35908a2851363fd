use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use ndarray::prelude::*;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    config::Config,
    device::Device,
    errors::{Result, TileSegError},
    onnx::OnnxNetwork,
};

/// A segmentation network in inference mode.
///
/// Maps a `(n, C, H, W)` image batch to `(n, K, H, W)` per-pixel class
/// logits, `C` being [`Self::num_channels`] and `K` [`Self::num_classes`].
pub trait SegmentationNetwork: Send + Sync {
    fn forward(&self, images: ArrayView4<f32>) -> Result<Array4<f32>>;

    fn num_channels(&self) -> usize;

    fn num_classes(&self) -> usize;
}

/// What a factory needs to know to build a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub num_classes: usize,
    pub num_channels: usize,
    pub encoder: Option<String>,
    pub pretrained: bool,
}

impl ModelSpec {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.model.name.clone(),
            num_classes: config.num_classes(),
            num_channels: config.num_channels(),
            encoder: config.model.encoder.clone(),
            pretrained: config.model.pretrained,
        }
    }
}

/// Builds a network for `spec` from the checkpoint at the given path, bound
/// to `device`.
pub type ModelFactory =
    Arc<dyn Fn(&ModelSpec, &Path, &Device) -> Result<Box<dyn SegmentationNetwork>> + Send + Sync>;

/// Model name to factory lookup, filled at startup.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    factories: BTreeMap<String, ModelFactory>,
}

/// Manifest of an extension model, one `*.toml` per model in the
/// extension directory.
#[derive(Debug, Deserialize)]
struct ExtensionManifest {
    name: String,
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    output: Option<String>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the ONNX-backed built-in models.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for name in ["albunet", "unet"] {
            registry.register(name, onnx_factory(None, None));
        }
        registry
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    /// Names are case-insensitive.
    pub fn register(&mut self, name: &str, factory: ModelFactory) -> &mut Self {
        self.factories.insert(name.to_lowercase(), factory);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Registers every `*.toml` model manifest found in `dir`.
    pub fn load_extensions(&mut self, dir: &Path) -> Result<usize> {
        let entries = fs::read_dir(dir).map_err(|e| TileSegError::FileSystem {
            path: dir.to_path_buf(),
            operation: "extension directory read".to_string(),
            source: e,
        })?;

        let mut manifests: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        manifests.sort();

        for path in &manifests {
            let raw = fs::read_to_string(path).map_err(|e| TileSegError::FileSystem {
                path: path.clone(),
                operation: "extension manifest read".to_string(),
                source: e,
            })?;
            let manifest: ExtensionManifest =
                toml::from_str(&raw).map_err(|e| TileSegError::Config {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            debug!(name = %manifest.name, manifest = %path.display(), "extension model registered");
            self.register(
                &manifest.name,
                onnx_factory(manifest.input, manifest.output),
            );
        }

        Ok(manifests.len())
    }

    /// Builds the network named by `spec` and checks it against the
    /// config's channel and class counts.
    pub fn resolve(
        &self,
        spec: &ModelSpec,
        checkpoint: &Path,
        device: &Device,
    ) -> Result<Box<dyn SegmentationNetwork>> {
        let factory = self
            .factories
            .get(&spec.name.to_lowercase())
            .ok_or_else(|| TileSegError::ModelNotFound {
                name: spec.name.clone(),
                known: self.names().join(", "),
            })?;

        if !checkpoint.is_file() {
            return Err(TileSegError::checkpoint(
                checkpoint,
                "checkpoint file does not exist",
            ));
        }

        let network = factory(spec, checkpoint, device)?;
        if network.num_channels() != spec.num_channels {
            return Err(TileSegError::checkpoint(
                checkpoint,
                format!(
                    "network takes {} input channels, config declares {}",
                    network.num_channels(),
                    spec.num_channels
                ),
            ));
        }
        if network.num_classes() != spec.num_classes {
            return Err(TileSegError::checkpoint(
                checkpoint,
                format!(
                    "network predicts {} classes, config declares {}",
                    network.num_classes(),
                    spec.num_classes
                ),
            ));
        }

        info!(
            model = %spec.name,
            channels = spec.num_channels,
            classes = spec.num_classes,
            %device,
            "model loaded"
        );
        Ok(network)
    }
}

fn onnx_factory(input: Option<String>, output: Option<String>) -> ModelFactory {
    Arc::new(move |spec: &ModelSpec, checkpoint: &Path, device: &Device| {
        let network = OnnxNetwork::load(
            checkpoint,
            device,
            spec.num_classes,
            input.as_deref(),
            output.as_deref(),
        )?;
        Ok(Box::new(network) as Box<dyn SegmentationNetwork>)
    })
}
