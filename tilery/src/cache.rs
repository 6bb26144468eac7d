//! In-memory cache of renderable tiles, bounded by a configured capacity.

use std::collections::{HashMap, VecDeque};

use crate::mercator::TileId;
use crate::render::{RenderError, TileHandle};

/// Whether a cached tile is currently revealed on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Shown,
    Hidden,
}

struct CachedTile<H> {
    handle: H,
    visibility: Visibility,
}

/// Holds the tiles that are ready to draw, together with the visibility state
/// the reconciliation loop last applied to them.
///
/// Keys live both in a map and in an insertion-order queue. When the capacity
/// is exceeded, the queue is scanned from the oldest entry and the first
/// hidden tile is evicted; if every tile is shown, the oldest goes regardless,
/// so memory stays bounded. This approximates LRU with a visibility bias:
/// exact recency is not worth tracking when a re-fetch costs a store or
/// network round trip.
pub struct TileCache<H> {
    tiles: HashMap<TileId, CachedTile<H>>,
    order: VecDeque<TileId>,
    capacity: usize,
}

impl<H: TileHandle> TileCache<H> {
    pub fn new(capacity: usize) -> Self {
        Self {
            tiles: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, tile_id: &TileId) -> bool {
        self.tiles.contains_key(tile_id)
    }

    pub fn visibility(&self, tile_id: &TileId) -> Option<Visibility> {
        self.tiles.get(tile_id).map(|tile| tile.visibility)
    }

    /// Keys in insertion order, oldest first.
    pub fn keys(&self) -> impl Iterator<Item = TileId> + '_ {
        self.order.iter().copied()
    }

    /// Insert a tile, evicting if the cache would exceed its capacity.
    /// Re-inserting an existing key replaces its handle but keeps its place in
    /// the insertion order.
    pub fn insert(&mut self, tile_id: TileId, handle: H, visibility: Visibility) {
        if self
            .tiles
            .insert(tile_id, CachedTile { handle, visibility })
            .is_some()
        {
            return;
        }
        self.order.push_back(tile_id);
        if self.capacity > 0 && self.order.len() > self.capacity {
            self.evict_one();
        }
    }

    fn evict_one(&mut self) {
        let index = self
            .order
            .iter()
            .position(|id| {
                self.tiles
                    .get(id)
                    .is_some_and(|tile| tile.visibility == Visibility::Hidden)
            })
            .unwrap_or(0);
        if let Some(evicted) = self.order.remove(index) {
            log::debug!("evicting tile {evicted}");
            // Dropping the handle releases the drawable.
            self.tiles.remove(&evicted);
        }
    }

    /// Remove a tile, returning its handle so the caller decides when the
    /// drawable is released.
    pub fn remove(&mut self, tile_id: &TileId) -> Option<H> {
        let tile = self.tiles.remove(tile_id)?;
        self.order.retain(|id| id != tile_id);
        Some(tile.handle)
    }

    /// Release every tile. Used when a session closes or changes provider.
    pub fn clear(&mut self) {
        self.order.clear();
        self.tiles.clear();
    }

    /// Hide every cached tile without evicting anything. Used on zoom change:
    /// all tile positions are stale at the new zoom, but the tiles may be
    /// needed again soon.
    pub fn mark_all_hidden(&mut self) {
        for (tile_id, tile) in &mut self.tiles {
            if tile.visibility == Visibility::Shown {
                if let Err(error) = tile.handle.hide() {
                    log::debug!("could not hide tile {tile_id}: {error}");
                }
                tile.visibility = Visibility::Hidden;
            }
        }
    }

    /// Reveal a cached tile. A no-op for unknown keys and tiles already shown.
    pub fn show(&mut self, tile_id: &TileId) -> Result<(), RenderError> {
        let Some(tile) = self.tiles.get_mut(tile_id) else {
            return Ok(());
        };
        if tile.visibility == Visibility::Hidden {
            tile.handle.show()?;
            tile.visibility = Visibility::Shown;
        }
        Ok(())
    }

    /// Hide a cached tile. A no-op for unknown keys and tiles already hidden.
    pub fn hide(&mut self, tile_id: &TileId) -> Result<(), RenderError> {
        let Some(tile) = self.tiles.get_mut(tile_id) else {
            return Ok(());
        };
        if tile.visibility == Visibility::Shown {
            tile.handle.hide()?;
            tile.visibility = Visibility::Hidden;
        }
        Ok(())
    }
}
