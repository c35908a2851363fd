use std::{fs, path::Path};

use serde_json::{json, Value};
use tracing::info;

use crate::{
    errors::{Result, TileSegError},
    tiles::Tile,
};

const LEAFLET_TEMPLATE: &str = include_str!("templates/leaflet.html");

/// Writes a static Leaflet viewer over the tile pyramid in `out`.
///
/// `index.html` is rendered from `template` (the built-in Leaflet page when
/// `None`) and, when `tiles` is not empty, `tiles.json` lists their outlines
/// as GeoJSON. The map centres on the first tile.
pub fn web_ui(
    out: &Path,
    base_url: &str,
    tiles: &[Tile],
    ext: &str,
    template: Option<&Path>,
) -> Result<()> {
    let template = match template {
        Some(path) => fs::read_to_string(path).map_err(|e| TileSegError::FileSystem {
            path: path.to_path_buf(),
            operation: "web ui template read".to_string(),
            source: e,
        })?,
        None => LEAFLET_TEMPLATE.to_string(),
    };

    fs::create_dir_all(out).map_err(|e| TileSegError::FileSystem {
        path: out.to_path_buf(),
        operation: "web ui directory creation".to_string(),
        source: e,
    })?;

    if !tiles.is_empty() {
        let path = out.join("tiles.json");
        fs::write(&path, feature_collection(tiles).to_string()).map_err(|e| {
            TileSegError::FileSystem {
                path,
                operation: "tiles.json write".to_string(),
                source: e,
            }
        })?;
    }

    let path = out.join("index.html");
    fs::write(&path, render(&template, base_url, tiles, ext)).map_err(|e| {
        TileSegError::FileSystem {
            path: path.clone(),
            operation: "index.html write".to_string(),
            source: e,
        }
    })?;

    info!(path = %path.display(), tiles = tiles.len(), "web ui written");
    Ok(())
}

fn render(template: &str, base_url: &str, tiles: &[Tile], ext: &str) -> String {
    let base_url = match base_url.trim_end_matches('/') {
        "" => ".",
        trimmed => trimmed,
    };
    let mut page = template
        .replace("{{base_url}}", base_url)
        .replace("{{ext}}", ext)
        .replace("{{tiles}}", if tiles.is_empty() { "" } else { "tiles.json" });

    let (zoom, center) = match tiles.first() {
        Some(tile) => {
            let (lon, lat) = tile.upper_left();
            (tile.z, format!("[{}, {}]", round6(lat), round6(lon)))
        }
        None => (1, "[0, 0]".to_string()),
    };
    page = page
        .replace("{{zoom}}", &zoom.to_string())
        .replace("{{center}}", &center);
    page
}

fn feature_collection(tiles: &[Tile]) -> Value {
    let features: Vec<Value> = tiles
        .iter()
        .map(|tile| {
            let [w, s, e, n] = tile.bounds().map(round6);
            json!({
                "type": "Feature",
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[w, s], [w, n], [e, n], [e, s], [w, s]]],
                },
                "properties": { "x": tile.x, "y": tile.y, "z": tile.z },
            })
        })
        .collect();

    json!({ "type": "FeatureCollection", "features": features })
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}
