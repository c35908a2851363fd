use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{de, Deserialize, Deserializer};

use crate::{
    colors::Color,
    errors::{Result, TileSegError},
};

/// Prediction config, loaded once from TOML and never mutated.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub classes: Vec<Class>,
    pub channels: Vec<Channel>,
    pub model: ModelParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Class {
    #[serde(alias = "label")]
    pub title: String,
    pub color: Color,
}

/// A group of bands read from one tile source.
#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    /// Sub directory of the tiles root holding this source. `None` reads the
    /// root itself.
    #[serde(default, alias = "name")]
    pub sub: Option<String>,
    pub bands: Vec<Band>,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelParams {
    pub name: String,
    #[serde(default)]
    pub encoder: Option<String>,
    #[serde(default)]
    pub pretrained: bool,
    pub batch_size: usize,
    pub tile_size: u32,
}

/// A band of a decoded tile, stored as a zero-based RGBA index.
///
/// Deserializes from a 1-based integer (`1..=4`) or a band letter
/// (`R`, `G`, `B`, `A`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Band(usize);

impl Band {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl<'de> Deserialize<'de> for Band {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Index(i64),
            Letter(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Index(i @ 1..=4) => Ok(Self(i as usize - 1)),
            Raw::Index(i) => Err(de::Error::custom(format!(
                "band {i} is out of range, expected 1..=4"
            ))),
            Raw::Letter(s) => match s.to_ascii_uppercase().as_str() {
                "R" => Ok(Self(0)),
                "G" => Ok(Self(1)),
                "B" => Ok(Self(2)),
                "A" => Ok(Self(3)),
                _ => Err(de::Error::custom(format!(
                    "unknown band `{s}`, expected R, G, B or A"
                ))),
            },
        }
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| TileSegError::Config {
            path: path.to_path_buf(),
            message: format!("unable to read config: {e}"),
        })?;
        Self::from_toml(&raw, path)
    }

    /// Parses and validates `raw`; `origin` only labels errors.
    pub fn from_toml(raw: &str, origin: &Path) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| TileSegError::Config {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate(origin)?;
        Ok(config)
    }

    fn validate(&self, origin: &Path) -> Result<()> {
        let fail = |message: String| {
            Err(TileSegError::Config {
                path: origin.to_path_buf(),
                message,
            })
        };

        if self.classes.len() < 2 {
            return fail(format!(
                "at least 2 classes are required, found {}",
                self.classes.len()
            ));
        }
        if self.channels.is_empty() {
            return fail("at least one channel is required".to_string());
        }
        for (i, channel) in self.channels.iter().enumerate() {
            if channel.bands.is_empty() {
                return fail(format!("channels[{i}] has no bands"));
            }
            if channel.mean.len() != channel.bands.len() || channel.std.len() != channel.bands.len()
            {
                return fail(format!(
                    "channels[{i}] has {} bands but {} mean and {} std values",
                    channel.bands.len(),
                    channel.mean.len(),
                    channel.std.len()
                ));
            }
            if let Some(std) = channel.std.iter().find(|s| !s.is_finite() || **s <= 0.0) {
                return fail(format!("channels[{i}] std must be positive, got {std}"));
            }
        }
        if self.model.name.trim().is_empty() {
            return fail("model.name is empty".to_string());
        }
        if self.model.batch_size == 0 {
            return fail("model.batch_size must be at least 1".to_string());
        }
        if self.model.tile_size == 0 {
            return fail("model.tile_size must be at least 1".to_string());
        }
        Ok(())
    }

    /// Applies the CLI overrides; `None` keeps the config value.
    pub fn with_overrides(mut self, tile_size: Option<u32>, batch_size: Option<usize>) -> Self {
        if let Some(tile_size) = tile_size.filter(|t| *t > 0) {
            self.model.tile_size = tile_size;
        }
        if let Some(batch_size) = batch_size.filter(|b| *b > 0) {
            self.model.batch_size = batch_size;
        }
        self
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Total input channels of the network: every band of every channel.
    pub fn num_channels(&self) -> usize {
        self.channels.iter().map(|c| c.bands.len()).sum()
    }

    pub fn colors(&self) -> Vec<Color> {
        self.classes.iter().map(|c| c.color).collect()
    }

    /// Directory holding the tiles of `channel` below `root`.
    pub fn channel_dir(root: &Path, channel: &Channel) -> PathBuf {
        match &channel.sub {
            Some(sub) => root.join(sub),
            None => root.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUILDINGS: &str = r#"
        [[classes]]
        title = "background"
        color = "white"

        [[classes]]
        title = "building"
        color = "deeppink"

        [[channels]]
        bands = ["R", "G", "B"]
        mean = [0.5, 0.5, 0.5]
        std = [0.25, 0.25, 0.25]

        [model]
        name = "albunet"
        encoder = "resnet50"
        pretrained = true
        batch_size = 2
        tile_size = 256
    "#;

    fn parse(raw: &str) -> Result<Config> {
        Config::from_toml(raw, Path::new("test.toml"))
    }

    #[test]
    fn test_parse_valid_config() -> Result<()> {
        let config = parse(BUILDINGS)?;
        assert_eq!(config.num_classes(), 2);
        assert_eq!(config.num_channels(), 3);
        assert_eq!(config.classes[1].title, "building");
        assert_eq!(config.colors()[0], Color([255, 255, 255]));
        assert_eq!(config.model.encoder.as_deref(), Some("resnet50"));
        assert!(config.model.pretrained);
        assert_eq!(
            config.channels[0]
                .bands
                .iter()
                .map(|b| b.index())
                .collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        Ok(())
    }

    #[test]
    fn test_numeric_bands_and_label_alias() -> Result<()> {
        let raw = BUILDINGS
            .replace(r#"bands = ["R", "G", "B"]"#, "bands = [3, 2, 1]")
            .replace(r#"title = "building""#, r#"label = "building""#);
        let config = parse(&raw)?;
        assert_eq!(config.channels[0].bands[0].index(), 2);
        assert_eq!(config.classes[1].title, "building");
        Ok(())
    }

    #[test]
    fn test_missing_model_block_is_config_error() {
        let raw = BUILDINGS.split("[model]").next().unwrap_or_default();
        assert!(matches!(parse(raw), Err(TileSegError::Config { .. })));
    }

    #[test]
    fn test_missing_channels_is_config_error() {
        let raw = r#"
            [[classes]]
            title = "a"
            color = "white"
            [[classes]]
            title = "b"
            color = "black"
            [model]
            name = "albunet"
            batch_size = 1
            tile_size = 256
        "#;
        assert!(matches!(parse(raw), Err(TileSegError::Config { .. })));
    }

    #[test]
    fn test_mismatched_statistics_rejected() {
        let raw = BUILDINGS.replace("mean = [0.5, 0.5, 0.5]", "mean = [0.5, 0.5]");
        assert!(matches!(parse(&raw), Err(TileSegError::Config { .. })));
    }

    #[test]
    fn test_bad_band_and_color_rejected() {
        let raw = BUILDINGS.replace(r#"bands = ["R", "G", "B"]"#, "bands = [1, 2, 9]");
        assert!(matches!(parse(&raw), Err(TileSegError::Config { .. })));

        let raw = BUILDINGS.replace(r#"color = "deeppink""#, r#"color = "nope""#);
        assert!(matches!(parse(&raw), Err(TileSegError::Config { .. })));
    }

    #[test]
    fn test_single_class_rejected() {
        let raw = BUILDINGS.replacen(
            "[[classes]]\n        title = \"background\"\n        color = \"white\"\n",
            "",
            1,
        );
        assert!(matches!(parse(&raw), Err(TileSegError::Config { .. })));
    }

    #[test]
    fn test_overrides() -> Result<()> {
        let config = parse(BUILDINGS)?.with_overrides(Some(512), None);
        assert_eq!(config.model.tile_size, 512);
        assert_eq!(config.model.batch_size, 2);
        Ok(())
    }

    #[test]
    fn test_unreadable_config_file() {
        let err = Config::from_path(Path::new("/definitely/not/here.toml"));
        assert!(matches!(err, Err(TileSegError::Config { .. })));
    }
}
