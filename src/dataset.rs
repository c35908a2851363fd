use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use image::{imageops, imageops::FilterType, GenericImageView, RgbaImage};
use ndarray::prelude::*;
use tracing::debug;

use crate::{
    config::{Channel, Config},
    errors::{Result, TileSegError},
    tiles::{tiles_from_slippy_map, Tile},
};

struct Source {
    channel: Channel,
    tiles: HashMap<Tile, PathBuf>,
}

/// Slippy-map tiles buffered with their neighbours' edges.
///
/// Every tile is read into a canvas of `tile_size + 2 * overlap` pixels:
/// the tile in the middle, and the facing `overlap`-wide strips of its eight
/// neighbours around it. A neighbour that is not on disk (tileset edge or
/// map edge) leaves its part of the border black; the black pixels are then
/// normalized like any other pixel.
pub struct TileDataset {
    sources: Vec<Source>,
    tiles: Vec<Tile>,
    tile_size: u32,
    overlap: u32,
    num_channels: usize,
}

impl TileDataset {
    pub fn new(root: &Path, config: &Config, tile_size: u32, overlap: u32) -> Result<Self> {
        if overlap > tile_size {
            return Err(TileSegError::Validation {
                field: "tile_overlap".to_string(),
                reason: format!("{overlap} must not exceed tile size {tile_size}"),
            });
        }
        if !root.is_dir() {
            return Err(TileSegError::FileSystem {
                path: root.to_path_buf(),
                operation: "tiles directory lookup".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "tiles directory does not exist",
                ),
            });
        }

        let sources: Vec<_> = config
            .channels
            .iter()
            .map(|channel| {
                let dir = Config::channel_dir(root, channel);
                Source {
                    channel: channel.clone(),
                    tiles: tiles_from_slippy_map(&dir).into_iter().collect(),
                }
            })
            .collect();

        let mut tiles: Vec<_> = sources
            .first()
            .map(|s| s.tiles.keys().copied().collect())
            .unwrap_or_default();
        tiles.sort_unstable();

        for source in sources.iter().skip(1) {
            if let Some(tile) = tiles.iter().find(|t| !source.tiles.contains_key(*t)) {
                return Err(TileSegError::FileSystem {
                    path: tile.path_in(&Config::channel_dir(root, &source.channel), "*"),
                    operation: "tile lookup".to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("tile {tile} missing from source {:?}", source.channel.sub),
                    ),
                });
            }
        }
        debug!(tiles = tiles.len(), sources = sources.len(), "indexed tile sources");

        Ok(Self {
            sources,
            tiles,
            tile_size,
            overlap,
            num_channels: config.num_channels(),
        })
    }

    /// Tiles to predict, sorted.
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Side length of a buffered tile.
    pub const fn buffered_size(&self) -> u32 {
        self.tile_size + 2 * self.overlap
    }

    /// Reads `tile` and its neighbours into a normalized `(C, S, S)` tensor,
    /// `S` being [`Self::buffered_size`].
    pub fn load(&self, tile: Tile) -> Result<Array3<f32>> {
        let size = self.buffered_size() as usize;
        let mut tensor = Array3::<f32>::zeros((self.num_channels, size, size));

        let mut offset = 0;
        for source in &self.sources {
            let canvas = self.buffer(source, tile)?;
            let channel = &source.channel;
            for (i, band) in channel.bands.iter().enumerate() {
                let (mean, std) = (channel.mean[i], channel.std[i]);
                let mut plane = tensor.index_axis_mut(Axis(0), offset + i);
                for (x, y, pixel) in canvas.enumerate_pixels() {
                    let value = f32::from(pixel.0[band.index()]) / 255.0;
                    plane[[y as usize, x as usize]] = (value - mean) / std;
                }
            }
            offset += channel.bands.len();
        }

        Ok(tensor)
    }

    /// Crops the overlap border off a `(K, S, S)` buffered output, giving
    /// `(K, tile_size, tile_size)`.
    pub fn unbuffer(&self, buffered: ArrayView3<f32>) -> Array3<f32> {
        let o = self.overlap as usize;
        let t = self.tile_size as usize;
        buffered.slice(s![.., o..o + t, o..o + t]).to_owned()
    }

    fn buffer(&self, source: &Source, tile: Tile) -> Result<RgbaImage> {
        let path = source
            .tiles
            .get(&tile)
            .ok_or_else(|| TileSegError::FileSystem {
                path: PathBuf::from(tile.to_string()),
                operation: "tile lookup".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("tile missing from source {:?}", source.channel.sub),
                ),
            })?;

        let (t, o) = (self.tile_size, self.overlap);
        let mut canvas = RgbaImage::new(t + 2 * o, t + 2 * o);
        imageops::replace(&mut canvas, &self.read(path)?, i64::from(o), i64::from(o));
        if o == 0 {
            return Ok(canvas);
        }

        for dy in -1..=1 {
            for dx in -1..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let Some(path) = tile.offset(dx, dy).and_then(|n| source.tiles.get(&n)) else {
                    continue;
                };
                let neighbour = self.read(path)?;
                let (sx, w, tx) = strip(dx, t, o);
                let (sy, h, ty) = strip(dy, t, o);
                let part = neighbour.view(sx, sy, w, h).to_image();
                imageops::replace(&mut canvas, &part, tx, ty);
            }
        }

        Ok(canvas)
    }

    fn read(&self, path: &Path) -> Result<RgbaImage> {
        let image = image::open(path)
            .map_err(|e| TileSegError::ImageProcessing {
                path: path.display().to_string(),
                operation: "tile read".to_string(),
                source: Box::new(e),
            })?
            .to_rgba8();

        if image.dimensions() == (self.tile_size, self.tile_size) {
            Ok(image)
        } else {
            Ok(imageops::resize(
                &image,
                self.tile_size,
                self.tile_size,
                FilterType::Lanczos3,
            ))
        }
    }
}

/// For a neighbour at offset `d` along one axis: the source start, length
/// and canvas position of the strip it contributes.
const fn strip(d: i64, tile_size: u32, overlap: u32) -> (u32, u32, i64) {
    match d {
        -1 => (tile_size - overlap, overlap, 0),
        0 => (0, tile_size, overlap as i64),
        _ => (0, overlap, (overlap + tile_size) as i64),
    }
}
