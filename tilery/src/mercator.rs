//! Tile identifiers and the slippy-map projection math.
//! <https://en.wikipedia.org/wiki/Web_Mercator_projection>
//! <https://wiki.openstreetmap.org/wiki/Slippy_map_tilenames>

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use crate::position::{lat_lon, Pixels, Position};

// zoom level   tile coverage  number of tiles  tile size(*) in degrees
// 0            1 tile         1 tile           360° x 170.1022°
// 1            2 × 2 tiles    4 tiles          180° x 85.0511°
// 2            4 × 4 tiles    16 tiles         90° x [variable]

/// Number of tiles along one axis of the grid at this zoom level.
pub fn total_tiles(zoom: u8) -> u32 {
    2u32.pow(zoom as u32)
}

/// Identifies a tile in the zoom-level grid.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct TileId {
    /// Zoom level, where 0 means no zoom.
    /// See: <https://wiki.openstreetmap.org/wiki/Zoom_levels>
    pub zoom: u8,

    /// Row of the tile, counted from the north.
    pub row: u32,

    /// Column of the tile, counted from the west.
    pub col: u32,
}

impl TileId {
    pub fn new(zoom: u8, row: u32, col: u32) -> Self {
        Self { zoom, row, col }
    }

    /// Position of the tile's north-west corner on the world bitmap.
    pub fn project(&self, tile_size: (u32, u32)) -> Pixels {
        Pixels::new(
            self.col as f64 * tile_size.0 as f64,
            self.row as f64 * tile_size.1 as f64,
        )
    }

    /// Whether row and column fit the grid at this zoom level.
    pub fn valid(&self) -> bool {
        self.row < total_tiles(self.zoom) && self.col < total_tiles(self.zoom)
    }
}

/// Tiles travel through queues and the store under a `"{zoom}_{row}_{col}"` tag.
impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.zoom, self.row, self.col)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid tile tag")]
pub struct InvalidTag;

impl FromStr for TileId {
    type Err = InvalidTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('_');
        let mut next = || parts.next().ok_or(InvalidTag);
        let zoom = next()?.parse().map_err(|_| InvalidTag)?;
        let row = next()?.parse().map_err(|_| InvalidTag)?;
        let col = next()?.parse().map_err(|_| InvalidTag)?;
        if parts.next().is_some() {
            return Err(InvalidTag);
        }
        Ok(Self { zoom, row, col })
    }
}

/// Project the position into Mercator and normalize it to the 0-1 range.
fn mercator_normalized(position: Position) -> (f64, f64) {
    // Project into Mercator (cylindrical map projection).
    let x = position.x().to_radians();
    let y = position.y().to_radians().tan().asinh();

    // Scale both x and y to 0-1 range.
    let x = (1. + (x / PI)) / 2.;
    let y = (1. - (y / PI)) / 2.;

    (x, y)
}

/// Project a geographical position onto the world bitmap at the given zoom.
/// The bitmap is `2^zoom` tiles wide and tall, each tile `tile_size` pixels.
pub fn project(position: Position, zoom: u8, tile_size: (u32, u32)) -> Pixels {
    let n = total_tiles(zoom) as f64;
    let (x, y) = mercator_normalized(position);
    Pixels::new(x * n * tile_size.0 as f64, y * n * tile_size.1 as f64)
}

/// Transform world-bitmap pixels back into a geographical position.
pub fn unproject(pixels: Pixels, zoom: u8, tile_size: (u32, u32)) -> Position {
    let n = total_tiles(zoom) as f64;

    let x = pixels.x() / tile_size.0 as f64 / n;
    let y = pixels.y() / tile_size.1 as f64 / n;

    let lon = x * 360. - 180.;
    let lat = (PI * (1. - 2. * y)).sinh().atan().to_degrees();

    lat_lon(lat, lon)
}

/// The tile under the given position.
pub fn tile_at(position: Position, zoom: u8) -> TileId {
    let n = total_tiles(zoom) as f64;
    let (x, y) = mercator_normalized(position);
    let limit = total_tiles(zoom) - 1;
    TileId {
        zoom,
        row: ((y * n).floor() as u32).min(limit),
        col: ((x * n).floor() as u32).min(limit),
    }
}

/// Bing-style quadkey of the tile, for providers whose URL templates use one.
/// <https://learn.microsoft.com/en-us/bingmaps/articles/bing-maps-tile-system>
pub fn quadkey(tile_id: TileId) -> String {
    if tile_id.zoom == 0 {
        return "0".to_owned();
    }
    let mut q = String::with_capacity(tile_id.zoom as usize);
    for i in (1..=tile_id.zoom).rev() {
        let mask = 1u32 << (i - 1);
        let mut digit = 0u8;
        if tile_id.col & mask != 0 {
            digit += 1;
        }
        if tile_id.row & mask != 0 {
            digit += 2;
        }
        q.push(char::from(b'0' + digit));
    }
    q
}
