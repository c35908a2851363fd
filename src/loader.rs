use std::{sync::mpsc, thread};

use ndarray::{prelude::*, stack};
use rayon::{prelude::*, ThreadPoolBuilder};
use tracing::debug;

use crate::{
    dataset::TileDataset,
    errors::{Result, TileSegError},
    tiles::Tile,
};

/// Images of up to `batch_size` tiles, stacked as `(n, C, S, S)`.
pub struct Batch {
    pub images: Array4<f32>,
    pub tiles: Vec<Tile>,
}

/// Builds the batch for `tiles` on the current thread (or rayon pool).
pub fn load_batch(dataset: &TileDataset, tiles: &[Tile], parallel: bool) -> Result<Batch> {
    let images: Vec<Array3<f32>> = if parallel {
        tiles
            .par_iter()
            .map(|tile| dataset.load(*tile))
            .collect::<Result<_>>()?
    } else {
        tiles
            .iter()
            .map(|tile| dataset.load(*tile))
            .collect::<Result<_>>()?
    };
    let views: Vec<_> = images.iter().map(|i| i.view()).collect();

    Ok(Batch {
        images: stack(Axis(0), &views)?,
        tiles: tiles.to_vec(),
    })
}

/// Feeds every batch of `dataset` to `consume`, in tile order.
///
/// With `workers == 0` batches are built on the calling thread. Otherwise a
/// producer thread builds them on a pool of `workers` threads and hands them
/// over through a bounded queue of `2 * workers` batches, and `consume` runs
/// on the calling thread as batches become ready. The first error, from
/// loading or from `consume`, stops the run.
pub fn for_each_batch<F>(
    dataset: &TileDataset,
    batch_size: usize,
    workers: usize,
    mut consume: F,
) -> Result<()>
where
    F: FnMut(Batch) -> Result<()>,
{
    let batch_size = batch_size.max(1);
    if workers == 0 {
        for chunk in dataset.tiles().chunks(batch_size) {
            consume(load_batch(dataset, chunk, false)?)?;
        }
        return Ok(());
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("tile-loader-{i}"))
        .build()
        .map_err(|e| TileSegError::Validation {
            field: "workers".to_string(),
            reason: format!("unable to start loader pool: {e}"),
        })?;
    let (sender, receiver) = mpsc::sync_channel::<Result<Batch>>(2 * workers);
    debug!(workers, batch_size, "background tile loading");

    thread::scope(|scope| -> Result<()> {
        scope.spawn(move || {
            for chunk in dataset.tiles().chunks(batch_size) {
                let batch = pool.install(|| load_batch(dataset, chunk, true));
                let failed = batch.is_err();
                // receiver gone: the consumer stopped on an error
                if sender.send(batch).is_err() || failed {
                    break;
                }
            }
        });

        // Dropping the receiver on error unblocks the producer.
        for batch in receiver {
            consume(batch?)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use image::{Rgb, RgbImage};
    use std::{fs, path::Path};
    use tempfile::TempDir;

    const CONFIG: &str = r#"
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
        batch_size = 2
        tile_size = 4
    "#;

    fn dataset(dir: &TempDir, count: u32) -> TileDataset {
        for x in 0..count {
            let path = Tile::new(4, x, 3).path_in(dir.path(), "png");
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            RgbImage::from_pixel(4, 4, Rgb([10, 20, 30]))
                .save(path)
                .unwrap();
        }
        let config = Config::from_toml(CONFIG, Path::new("test.toml")).unwrap();
        TileDataset::new(dir.path(), &config, 4, 1).unwrap()
    }

    fn collect(dataset: &TileDataset, workers: usize) -> Result<Vec<(Vec<Tile>, Vec<usize>)>> {
        let mut seen = Vec::new();
        for_each_batch(dataset, 2, workers, |batch| {
            seen.push((batch.tiles, batch.images.shape().to_vec()));
            Ok(())
        })?;
        Ok(seen)
    }

    #[test]
    fn test_batches_in_order_without_workers() -> Result<()> {
        let dir = TempDir::new()?;
        let dataset = dataset(&dir, 5);
        let seen = collect(&dataset, 0)?;

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, vec![Tile::new(4, 0, 3), Tile::new(4, 1, 3)]);
        assert_eq!(seen[0].1, vec![2, 3, 6, 6]);
        assert_eq!(seen[2].1, vec![1, 3, 6, 6]);
        Ok(())
    }

    #[test]
    fn test_workers_produce_same_batches() -> Result<()> {
        let dir = TempDir::new()?;
        let dataset = dataset(&dir, 5);
        assert_eq!(collect(&dataset, 0)?, collect(&dataset, 3)?);
        Ok(())
    }

    #[test]
    fn test_consumer_error_stops_workers() {
        let dir = TempDir::new().unwrap();
        let dataset = dataset(&dir, 6);
        let mut calls = 0;
        let result = for_each_batch(&dataset, 1, 2, |_| {
            calls += 1;
            Err(TileSegError::model("consume", "stop"))
        });
        assert!(matches!(result, Err(TileSegError::Model { .. })));
        assert_eq!(calls, 1);
    }
}
