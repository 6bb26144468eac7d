//! The seam between the engine and whatever actually draws tiles.
//!
//! The engine never touches pixels. It hands opaque payloads to a
//! [`TileRenderer`] supplied by the embedding GUI and keeps the resulting
//! [`TileHandle`]s in its cache, toggling their visibility from the
//! reconciliation loop.

use crate::mercator::TileId;

/// Error reported by the embedding GUI. A visibility command may race with
/// eviction or a canvas teardown; the reconciliation loop logs such errors and
/// moves on, consistency is restored on the next tick.
pub type RenderError = Box<dyn std::error::Error>;

/// Handle to one on-screen drawable tile.
///
/// Dropping the handle must release the underlying resources (the image data
/// and the canvas item).
pub trait TileHandle {
    /// Reveal the tile on the canvas.
    fn show(&mut self) -> Result<(), RenderError>;

    /// Hide the tile without releasing it.
    fn hide(&mut self) -> Result<(), RenderError>;
}

/// Turns a raw payload into an on-screen drawable positioned at the tile's row
/// and column. The drawable starts hidden; the engine shows it once it is
/// cached.
pub trait TileRenderer {
    type Handle: TileHandle;

    fn materialize(&mut self, tile_id: TileId, payload: &[u8])
        -> Result<Self::Handle, RenderError>;
}
