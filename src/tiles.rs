use std::{
    collections::BTreeMap,
    f64::consts::PI,
    fmt,
    path::{Path, PathBuf},
};

use image::ImageFormat;
use walkdir::WalkDir;

/// A slippy-map tile address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tile {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

impl Tile {
    pub const fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// The tile offset by `(dx, dy)` at the same zoom, if it lies on the map.
    pub fn offset(&self, dx: i64, dy: i64) -> Option<Self> {
        let side = 1i64 << self.z.min(62);
        let x = i64::from(self.x) + dx;
        let y = i64::from(self.y) + dy;
        if (0..side).contains(&x) && (0..side).contains(&y) {
            Some(Self::new(self.z, x as u32, y as u32))
        } else {
            None
        }
    }

    /// Output location of this tile below `root`: `<root>/<z>/<x>/<y>.<ext>`.
    pub fn path_in(&self, root: &Path, ext: &str) -> PathBuf {
        root.join(self.z.to_string())
            .join(self.x.to_string())
            .join(format!("{}.{}", self.y, ext))
    }

    /// Longitude/latitude of the tile's north-west corner.
    pub fn upper_left(&self) -> (f64, f64) {
        let n = f64::from(1u32 << self.z.min(31));
        let lon = f64::from(self.x) / n * 360.0 - 180.0;
        let lat = (PI * (1.0 - 2.0 * f64::from(self.y) / n))
            .sinh()
            .atan()
            .to_degrees();
        (lon, lat)
    }

    /// `[west, south, east, north]` in degrees.
    pub fn bounds(&self) -> [f64; 4] {
        let (west, north) = self.upper_left();
        let (east, south) = Self::new(self.z, self.x + 1, self.y + 1).upper_left();
        [west, south, east, north]
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Every `<z>/<x>/<y>.<ext>` image below `root`, sorted by tile.
///
/// Files whose path components are not integers or whose extension is not
/// an image format are skipped. When the same tile exists with several
/// extensions the first in walk order wins.
pub fn tiles_from_slippy_map(root: &Path) -> Vec<(Tile, PathBuf)> {
    let mut tiles = BTreeMap::new();

    for entry in WalkDir::new(root)
        .min_depth(3)
        .max_depth(3)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if ImageFormat::from_path(path).is_err() {
            continue;
        }
        if let Some(tile) = parse_tile_path(root, path) {
            tiles.entry(tile).or_insert_with(|| path.to_path_buf());
        }
    }

    tiles.into_iter().collect()
}

fn parse_tile_path(root: &Path, path: &Path) -> Option<Tile> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = relative.iter().map(|p| p.to_str());
    let z = parts.next()??.parse().ok()?;
    let x = parts.next()??.parse().ok()?;
    let y = Path::new(parts.next()??).file_stem()?.to_str()?.parse().ok()?;
    Some(Tile::new(z, x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_finds_only_tiles() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path();
        for (z, x, y) in [(10, 5, 7), (10, 5, 6), (9, 1, 1)] {
            let tile = Tile::new(z, x, y);
            let path = tile.path_in(root, "png");
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(path, b"")?;
        }
        fs::write(root.join("10").join("5").join("notes.txt"), b"")?;
        fs::create_dir_all(root.join("abc").join("1"))?;
        fs::write(root.join("abc").join("1").join("2.png"), b"")?;
        fs::write(root.join("10").join("readme.png"), b"")?;

        let tiles: Vec<_> = tiles_from_slippy_map(root)
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        assert_eq!(
            tiles,
            vec![
                Tile::new(9, 1, 1),
                Tile::new(10, 5, 6),
                Tile::new(10, 5, 7)
            ]
        );
        Ok(())
    }

    #[test]
    fn test_offset_stays_on_map() {
        let tile = Tile::new(1, 0, 1);
        assert_eq!(tile.offset(1, -1), Some(Tile::new(1, 1, 0)));
        assert_eq!(tile.offset(-1, 0), None);
        assert_eq!(tile.offset(0, 1), None);
        assert_eq!(Tile::new(0, 0, 0).offset(0, 0), Some(Tile::new(0, 0, 0)));
    }

    #[test]
    fn test_path_in() {
        let path = Tile::new(10, 512, 340).path_in(Path::new("out"), "png");
        assert_eq!(path, Path::new("out/10/512/340.png"));
    }

    #[test]
    fn test_bounds_of_world_tile() {
        let [west, south, east, north] = Tile::new(0, 0, 0).bounds();
        assert!((west + 180.0).abs() < 1e-9);
        assert!((east - 180.0).abs() < 1e-9);
        assert!((north - 85.051_128_779_806_6).abs() < 1e-6);
        assert!((south + 85.051_128_779_806_6).abs() < 1e-6);
    }
}
