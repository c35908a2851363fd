use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

use image::{GrayImage, Luma};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::prelude::*;
use tracing::{debug, info};

use crate::{
    colors::{make_palette, Color},
    dataset::TileDataset,
    errors::{Result, TileSegError},
    loader::{for_each_batch, Batch},
    model::SegmentationNetwork,
    tiles::Tile,
};

/// Per-pixel class probabilities must sum to one within this tolerance.
pub const PROBABILITY_TOLERANCE: f32 = 1e-5;

/// Outcome of a prediction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictReport {
    pub tiles: Vec<Tile>,
    pub written: Vec<PathBuf>,
}

/// Softmax over the class axis of `(n, K, H, W)` logits.
pub fn softmax(logits: ArrayView4<f32>) -> Array4<f32> {
    let max = logits
        .map_axis(Axis(1), |l| l.fold(f32::NEG_INFINITY, |a, b| a.max(*b)))
        .insert_axis(Axis(1));
    let exp = (&logits - &max).mapv(f32::exp);
    let sum = exp.sum_axis(Axis(1)).insert_axis(Axis(1));
    exp / &sum
}

/// Checks the single-channel output assumptions on a `(K, H, W)`
/// probability mask: exactly two classes, and probabilities summing to one.
pub fn check_binary_probabilities(tile: Tile, probs: ArrayView3<f32>) -> Result<()> {
    let classes = probs.len_of(Axis(0));
    if classes != 2 {
        return Err(TileSegError::InvariantViolation {
            tile: tile.to_string(),
            reason: format!("single channel requires binary model, got {classes} classes"),
        });
    }

    let sums = probs.sum_axis(Axis(0));
    if let Some(((y, x), sum)) = sums
        .indexed_iter()
        .find(|(_, s)| !((**s - 1.0).abs() <= PROBABILITY_TOLERANCE))
    {
        return Err(TileSegError::InvariantViolation {
            tile: tile.to_string(),
            reason: format!(
                "single channel requires probabilities to sum up to one, got {sum} at ({x}, {y})"
            ),
        });
    }
    Ok(())
}

/// Second class probability rounded (half to even) to `{0, 1}` and scaled to
/// `{0, 255}`.
pub fn binary_mask(probs: ArrayView3<f32>) -> GrayImage {
    let foreground = probs.index_axis(Axis(0), 1);
    let (h, w) = foreground.dim();
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let p = foreground[[y as usize, x as usize]].round_ties_even();
        Luma([if p >= 1.0 { 255 } else { 0 }])
    })
}

/// Writes `mask` as an 8-bit indexed PNG, `0` mapping to palette entry 0
/// and `255` to entry 1.
pub fn write_palette_png(path: &Path, mask: &GrayImage, palette: &[u8]) -> Result<()> {
    let file = File::create(path).map_err(|e| TileSegError::FileSystem {
        path: path.to_path_buf(),
        operation: "mask file creation".to_string(),
        source: e,
    })?;

    let mut encoder = png::Encoder::new(BufWriter::new(file), mask.width(), mask.height());
    encoder.set_color(png::ColorType::Indexed);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_palette(palette);
    encoder.set_compression(png::Compression::Best);

    let indices: Vec<u8> = mask.as_raw().iter().map(|v| u8::from(*v == 255)).collect();
    let encode = |e: png::EncodingError| TileSegError::ImageProcessing {
        path: path.display().to_string(),
        operation: "mask encoding".to_string(),
        source: Box::new(e),
    };
    let mut writer = encoder.write_header().map_err(encode)?;
    writer.write_image_data(&indices).map_err(encode)?;
    writer.finish().map_err(encode)?;
    Ok(())
}

/// Runs the network over every tile of a dataset and writes one mask per
/// tile to `<out_dir>/<z>/<x>/<y>.png`.
pub struct Predictor<'a> {
    network: &'a dyn SegmentationNetwork,
    dataset: &'a TileDataset,
    out_dir: PathBuf,
    palette: Vec<u8>,
}

impl<'a> Predictor<'a> {
    pub fn new(
        network: &'a dyn SegmentationNetwork,
        dataset: &'a TileDataset,
        out_dir: &Path,
        colors: &[Color],
    ) -> Result<Self> {
        if colors.len() < 2 {
            return Err(TileSegError::Validation {
                field: "classes".to_string(),
                reason: "a palette needs two class colours".to_string(),
            });
        }
        Ok(Self {
            network,
            dataset,
            out_dir: out_dir.to_path_buf(),
            palette: make_palette(&colors[..2]),
        })
    }

    pub fn run(&self, batch_size: usize, workers: usize) -> Result<PredictReport> {
        let tiles = self.dataset.tiles().to_vec();
        info!(
            tiles = tiles.len(),
            batch_size,
            workers,
            out = %self.out_dir.display(),
            "predicting"
        );

        let batches = tiles.len().div_ceil(batch_size.max(1));
        let progress_bar = ProgressBar::new(batches as u64);
        progress_bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} batches ({per_sec} {eta})",
            )
            .map_err(|e| TileSegError::Validation {
                field: "progress template".to_string(),
                reason: e.to_string(),
            })?
            .progress_chars("#>-"),
        );

        let mut written = Vec::with_capacity(tiles.len());
        for_each_batch(self.dataset, batch_size, workers, |batch| {
            written.extend(self.predict_batch(batch)?);
            progress_bar.inc(1);
            Ok(())
        })?;
        progress_bar.finish();

        info!(written = written.len(), "prediction complete");
        Ok(PredictReport { tiles, written })
    }

    fn predict_batch(&self, batch: Batch) -> Result<Vec<PathBuf>> {
        let Batch { images, tiles } = batch;
        let logits = self.network.forward(images.view())?;

        let (n, _, h, w) = images.dim();
        let expected = [n, self.network.num_classes(), h, w];
        if logits.shape() != expected {
            return Err(TileSegError::model(
                "forward pass",
                format!("expected output shape {expected:?}, got {:?}", logits.shape()),
            ));
        }

        let probs = softmax(logits.view());
        let mut written = Vec::with_capacity(tiles.len());
        for (tile, prob) in tiles.iter().zip(probs.outer_iter()) {
            let prob = self.dataset.unbuffer(prob);
            check_binary_probabilities(*tile, prob.view())?;

            let mask = binary_mask(prob.view());
            let path = tile.path_in(&self.out_dir, "png");
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| TileSegError::FileSystem {
                    path: parent.to_path_buf(),
                    operation: "output directory creation".to_string(),
                    source: e,
                })?;
            }
            write_palette_png(&path, &mask, &self.palette)?;
            debug!(%tile, path = %path.display(), "mask written");
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use tempfile::TempDir;

    #[test]
    fn test_softmax_sums_to_one_for_seeded_logits() {
        let mut rng = StdRng::seed_from_u64(42);
        let logits = Array4::from_shape_fn((3, 4, 16, 16), |_| rng.gen_range(-20.0f32..20.0));
        let probs = softmax(logits.view());

        let sums = probs.sum_axis(Axis(1));
        assert!(sums.iter().all(|s| (s - 1.0).abs() <= PROBABILITY_TOLERANCE));
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_softmax_is_stable_for_large_logits() {
        let mut logits = Array4::<f32>::zeros((1, 2, 1, 1));
        logits[[0, 0, 0, 0]] = 1000.0;
        logits[[0, 1, 0, 0]] = 999.0;
        let probs = softmax(logits.view());
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!(probs[[0, 0, 0, 0]] > probs[[0, 1, 0, 0]]);
    }

    #[test]
    fn test_non_binary_probabilities_rejected() {
        let probs = Array3::<f32>::from_elem((3, 2, 2), 1.0 / 3.0);
        let result = check_binary_probabilities(Tile::new(1, 0, 0), probs.view());
        assert!(matches!(
            result,
            Err(TileSegError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn test_unnormalized_probabilities_rejected() {
        let probs = Array3::<f32>::from_elem((2, 2, 2), 0.6);
        let result = check_binary_probabilities(Tile::new(1, 0, 0), probs.view());
        assert!(matches!(
            result,
            Err(TileSegError::InvariantViolation { .. })
        ));

        let probs = Array3::<f32>::from_elem((2, 2, 2), 0.5);
        assert!(check_binary_probabilities(Tile::new(1, 0, 0), probs.view()).is_ok());
    }

    #[test]
    fn test_binary_mask_values() {
        let mut probs = Array3::<f32>::zeros((2, 1, 4));
        for (i, p) in [0.1, 0.5, 0.51, 0.99].into_iter().enumerate() {
            probs[[1, 0, i]] = p;
            probs[[0, 0, i]] = 1.0 - p;
        }
        let mask = binary_mask(probs.view());
        assert_eq!(mask.dimensions(), (4, 1));
        assert_eq!(mask.as_raw(), &vec![0, 0, 255, 255]);
    }

    #[test]
    fn test_palette_png_is_indexed() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("mask.png");
        let mask = GrayImage::from_fn(3, 2, |x, _| Luma([if x == 1 { 255 } else { 0 }]));
        write_palette_png(&path, &mask, &[255, 255, 255, 255, 20, 147])?;

        let mut decoder = png::Decoder::new(File::open(&path)?);
        decoder.set_transformations(png::Transformations::IDENTITY);
        let mut reader = decoder.read_info().expect("png header");
        assert_eq!(
            reader.info().palette.as_deref(),
            Some(&[255u8, 255, 255, 255, 20, 147][..])
        );
        let mut buf = vec![0; reader.output_buffer_size()];
        let frame = reader.next_frame(&mut buf).expect("png frame");
        assert_eq!(frame.color_type, png::ColorType::Indexed);
        assert_eq!(&buf[..frame.buffer_size()], &[0, 1, 0, 0, 1, 0]);
        Ok(())
    }
}
