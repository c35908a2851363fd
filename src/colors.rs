use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer};

/// An opaque RGB class colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color(pub [u8; 3]);

const NAMED_COLORS: &[(&str, [u8; 3])] = &[
    ("black", [0, 0, 0]),
    ("white", [255, 255, 255]),
    ("dark", [64, 64, 64]),
    ("gray", [238, 238, 238]),
    ("light", [248, 248, 248]),
    ("red", [255, 0, 0]),
    ("green", [0, 128, 0]),
    ("blue", [0, 0, 255]),
    ("yellow", [255, 255, 0]),
    ("orange", [255, 165, 0]),
    ("pink", [255, 192, 203]),
    ("deeppink", [255, 20, 147]),
    ("purple", [128, 0, 128]),
    ("cyan", [0, 255, 255]),
    ("brown", [165, 42, 42]),
];

impl FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix('#') {
            if hex.len() != 6 || !hex.is_ascii() {
                return Err(format!("`{s}` is not a #rrggbb colour"));
            }
            let channel = |i: usize| {
                u8::from_str_radix(&hex[i..i + 2], 16)
                    .map_err(|_| format!("`{s}` is not a #rrggbb colour"))
            };
            return Ok(Self([channel(0)?, channel(2)?, channel(4)?]));
        }

        let lower = s.to_ascii_lowercase();
        NAMED_COLORS
            .iter()
            .find(|(name, _)| *name == lower)
            .map(|(_, rgb)| Self(*rgb))
            .ok_or_else(|| {
                let names: Vec<_> = NAMED_COLORS.iter().map(|(n, _)| *n).collect();
                format!(
                    "unknown colour `{s}`; use #rrggbb or one of: {}",
                    names.join(", ")
                )
            })
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b] = self.0;
        write!(f, "#{r:02x}{g:02x}{b:02x}")
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Flattens colours into the `[r, g, b, r, g, b, ...]` layout of a PNG
/// `PLTE` chunk. Index `i` of the palette is `colors[i]`.
pub fn make_palette(colors: &[Color]) -> Vec<u8> {
    colors.iter().flat_map(|c| c.0).collect()
}
