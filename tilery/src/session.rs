//! Map session: the per-provider lifetime owning the worker pool, the bounded
//! cache, and the reconciliation loop that keeps the canvas consistent with
//! the viewport.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{TileCache, Visibility};
use crate::fetch::{FetchPool, Fetcher, HttpFetcher, DEFAULT_TIMEOUT, DEFAULT_WORKERS};
use crate::mercator::{total_tiles, unproject, TileId};
use crate::position::{lat_lon, Pixels, Position};
use crate::provider::TileProvider;
use crate::render::{TileHandle, TileRenderer};
use crate::store::TileStore;

const LOCATION_FILE: &str = "location.json";

/// Errors that can abort opening a session. Per-tile trouble never shows up
/// here; it is contained in the workers and in [`MapSession::tick`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("tile store: {0}")]
    Store(#[source] io::Error),

    #[error("could not spawn workers: {0}")]
    Spawn(#[source] io::Error),

    #[error("http client: {0}")]
    Http(#[from] crate::fetch::FetchError),
}

/// Controls a [`MapSession`]'s resources: where tiles and the last location
/// are persisted, how many workers run, and how the cache is bounded.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Directory holding one tile-store subdirectory per provider.
    pub cache_dir: PathBuf,

    /// Directory of the small file remembering zoom and position across
    /// sessions.
    pub state_dir: PathBuf,

    /// Number of background fetch workers.
    pub workers: usize,

    /// Maximum number of tiles kept in memory.
    pub cache_capacity: usize,

    /// Extra ring of tiles fetched around the visible rectangle, in tiles.
    pub border: u32,

    /// Ticks per second the host is expected to drive the session at. The
    /// session keeps no timer of its own; see [`SessionOptions::tick_period`].
    pub framerate: u32,

    /// Bound on a single network fetch.
    pub timeout: Duration,

    /// Disable TLS peer verification, tolerating self-signed tile mirrors.
    /// Off by default; enabling it is a deliberate security trade-off.
    pub accept_invalid_certs: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        let base = std::env::temp_dir().join("tilery");
        Self {
            cache_dir: base.join("tiles"),
            state_dir: base,
            workers: DEFAULT_WORKERS,
            cache_capacity: 500,
            border: 2,
            framerate: 4,
            timeout: DEFAULT_TIMEOUT,
            accept_invalid_certs: false,
        }
    }
}

impl SessionOptions {
    /// How often the host should call [`MapSession::tick`].
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(1000 / self.framerate.max(1) as u64)
    }
}

/// The part of the world bitmap currently on screen, in world pixels at the
/// current zoom.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    fn right(&self) -> f64 {
        self.left + self.width
    }

    fn bottom(&self) -> f64 {
        self.top + self.height
    }
}

/// Host-side periodic work tied to the session, e.g. a drift animation after a
/// pan gesture. Finished tasks are pruned every tick; the rest are cancelled
/// when the session closes.
pub trait ScheduledTask {
    fn finished(&self) -> bool;
    fn cancel(&mut self);
}

/// Rectangle of tile indices the viewport needs, end-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DrawArea {
    first_row: u32,
    first_col: u32,
    last_row: u32,
    last_col: u32,
}

impl DrawArea {
    const EMPTY: Self = Self {
        first_row: 0,
        first_col: 0,
        last_row: 0,
        last_col: 0,
    };

    fn tiles(&self, zoom: u8) -> impl Iterator<Item = TileId> + '_ {
        let cols = self.first_col..self.last_col;
        (self.first_row..self.last_row)
            .flat_map(move |row| cols.clone().map(move |col| TileId::new(zoom, row, col)))
    }

    fn contains(&self, tile_id: TileId) -> bool {
        (self.first_row..self.last_row).contains(&tile_id.row)
            && (self.first_col..self.last_col).contains(&tile_id.col)
    }
}

/// Last location of a map session, persisted between runs.
#[derive(Debug, Serialize, Deserialize)]
struct SavedLocation {
    zoom: u8,
    latlon: [f64; 2],
}

/// An open map over one tile provider.
///
/// The session owns the background fetch workers and the bounded tile cache,
/// and reconciles them with the viewport in [`MapSession::tick`], which the
/// host calls periodically from its interactive thread. The tick is the only
/// place GUI-visible tile state changes; workers never touch it.
pub struct MapSession<R: TileRenderer> {
    provider: Arc<TileProvider>,
    renderer: R,
    options: SessionOptions,
    pool: FetchPool,
    cache: TileCache<R::Handle>,

    /// Keys requested from the pool whose results were not drained yet.
    queued: HashSet<TileId>,

    viewport: Viewport,
    zoom: u8,
    position: Position,
    last_draw_area: Option<DrawArea>,
    tasks: Vec<Box<dyn ScheduledTask>>,
    closed: bool,
}

impl<R: TileRenderer> MapSession<R> {
    /// Open a map. Zoom and position fall back to what the previous session
    /// persisted, then to zoom 0 at the null island.
    pub fn open(
        provider: TileProvider,
        renderer: R,
        options: SessionOptions,
        zoom: Option<u8>,
        position: Option<Position>,
    ) -> Result<Self, SessionError> {
        let fetcher = Arc::new(HttpFetcher::new(
            options.timeout,
            options.accept_invalid_certs,
        )?);
        Self::open_with_fetcher(provider, renderer, options, zoom, position, fetcher)
    }

    /// Same as [`MapSession::open`], but with a custom [`Fetcher`].
    pub fn open_with_fetcher(
        provider: TileProvider,
        renderer: R,
        options: SessionOptions,
        zoom: Option<u8>,
        position: Option<Position>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, SessionError> {
        let saved = load_location(&options.state_dir);
        let zoom = zoom
            .or(saved.as_ref().map(|saved| saved.zoom))
            .unwrap_or(0)
            .min(provider.max_zoom);
        let position = position
            .or_else(|| {
                saved
                    .as_ref()
                    .map(|saved| lat_lon(saved.latlon[0], saved.latlon[1]))
            })
            .unwrap_or_else(|| lat_lon(0., 0.));

        let store =
            TileStore::open(&options.cache_dir, &provider.name).map_err(SessionError::Store)?;
        let pool =
            FetchPool::spawn(options.workers.max(1), &store, fetcher).map_err(SessionError::Spawn)?;

        Ok(Self {
            provider: Arc::new(provider),
            renderer,
            cache: TileCache::new(options.cache_capacity),
            options,
            pool,
            queued: HashSet::new(),
            viewport: Viewport::default(),
            zoom,
            position,
            last_draw_area: None,
            tasks: Vec::new(),
            closed: false,
        })
    }

    pub fn provider(&self) -> &TileProvider {
        &self.provider
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    /// The geographical position last saved with [`MapSession::save_position`].
    pub fn position(&self) -> Position {
        self.position
    }

    /// Size of the whole world bitmap at the current zoom, in pixels.
    pub fn world_size(&self) -> (f64, f64) {
        let n = total_tiles(self.zoom) as f64;
        let (tile_width, tile_height) = self.provider.tile_size();
        (n * tile_width as f64, n * tile_height as f64)
    }

    /// Update the part of the world bitmap currently on screen.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    /// Remember the geographical position under the viewport center. Persisted
    /// when the session closes.
    pub fn save_position(&mut self) {
        let center = Pixels::new(
            self.viewport.left + self.viewport.width / 2.,
            self.viewport.top + self.viewport.height / 2.,
        );
        self.position = unproject(center, self.zoom, self.provider.tile_size());
    }

    /// Change the zoom level, clamped to the provider's maximum. All tile
    /// positions are stale at the new zoom, so pending work is dropped and
    /// every cached tile is hidden; tiles stay cached in case the host zooms
    /// right back.
    pub fn set_zoom(&mut self, zoom: u8) {
        let zoom = zoom.min(self.provider.max_zoom);
        if zoom == self.zoom {
            return;
        }
        self.save_position();
        self.zoom = zoom;
        self.pool.clear();
        self.queued.clear();
        self.cache.mark_all_hidden();
        self.last_draw_area = None;
    }

    pub fn schedule(&mut self, task: Box<dyn ScheduledTask>) {
        self.tasks.push(task);
    }

    /// Whether a fetch for this tile was requested and not resolved yet.
    pub fn is_queued(&self, tile_id: &TileId) -> bool {
        self.queued.contains(tile_id)
    }

    pub fn contains(&self, tile_id: &TileId) -> bool {
        self.cache.contains(tile_id)
    }

    pub fn visibility(&self, tile_id: &TileId) -> Option<Visibility> {
        self.cache.visibility(tile_id)
    }

    pub fn cached_tiles(&self) -> usize {
        self.cache.len()
    }

    /// One pass of the reconciliation loop. The host calls this periodically
    /// (see [`SessionOptions::tick_period`]) from its interactive thread; no
    /// step here blocks.
    pub fn tick(&mut self) {
        // Diff the needed tile set against cache and queued when the visible
        // rectangle moved.
        let area = self.draw_area();
        if self.last_draw_area != Some(area) {
            self.last_draw_area = Some(area);
            for tile_id in area.tiles(self.zoom) {
                if !self.cache.contains(&tile_id) && self.queued.insert(tile_id) {
                    self.pool.request(tile_id, self.provider.clone());
                }
            }
        }

        // Promote completed fetches before any show/hide pass, so a tile that
        // finished this tick is revealed this tick.
        for result in self.pool.completed() {
            self.queued.remove(&result.tile_id);
            match result.payload {
                Some(payload) => match self.renderer.materialize(result.tile_id, &payload) {
                    Ok(mut handle) => {
                        // A fetch may finish after a zoom change; such a tile
                        // is cached for a zoom back but must not be revealed.
                        if result.tile_id.zoom == self.zoom {
                            if let Err(error) = handle.show() {
                                log::debug!("could not show tile {}: {error}", result.tile_id);
                            }
                            self.cache
                                .insert(result.tile_id, handle, Visibility::Shown);
                        } else {
                            self.cache
                                .insert(result.tile_id, handle, Visibility::Hidden);
                        }
                    }
                    Err(error) => {
                        log::warn!("could not materialize tile {}: {error}", result.tile_id);
                        self.last_draw_area = None;
                    }
                },
                None => {
                    // Eligible again once the needed set is recomputed; force
                    // that recomputation on the next tick.
                    self.last_draw_area = None;
                }
            }
        }

        // Reconcile visibility: hide whatever drifted outside the padded
        // viewport, reveal needed tiles that are cached but hidden.
        let (tile_width, tile_height) = self.provider.tile_size();
        let radius = tile_width.max(tile_height) as f64 * self.options.border as f64;
        let tile_ids: Vec<_> = self.cache.keys().collect();
        for tile_id in tile_ids {
            if tile_id.zoom != self.zoom {
                continue;
            }
            let left = tile_id.col as f64 * tile_width as f64;
            let top = tile_id.row as f64 * tile_height as f64;
            let outside = left + tile_width as f64 <= self.viewport.left - radius
                || left >= self.viewport.right() + radius
                || top + tile_height as f64 <= self.viewport.top - radius
                || top >= self.viewport.bottom() + radius;

            let command = if outside {
                self.cache.hide(&tile_id)
            } else if area.contains(tile_id) {
                self.cache.show(&tile_id)
            } else {
                Ok(())
            };
            if let Err(error) = command {
                // The item may be gone already; the next tick sorts it out.
                log::debug!("visibility command failed for tile {tile_id}: {error}");
            }
        }

        // Drop host sub-tasks that have run their course.
        self.tasks.retain(|task| !task.finished());
    }

    /// Stop the workers, release every cached tile, and persist the current
    /// location. Closing twice is a no-op; `Drop` closes as well.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for task in &mut self.tasks {
            task.cancel();
        }
        self.tasks.clear();
        self.pool.stop();
        self.pool.clear();
        self.queued.clear();
        self.cache.clear();
        self.save_position();
        if let Err(error) = self.store_location() {
            log::warn!("could not persist location: {error}");
        }
    }

    fn store_location(&self) -> io::Result<()> {
        fs::create_dir_all(&self.options.state_dir)?;
        let saved = SavedLocation {
            zoom: self.zoom,
            latlon: [self.position.y(), self.position.x()],
        };
        let file = fs::File::create(self.options.state_dir.join(LOCATION_FILE))?;
        serde_json::to_writer(file, &saved).map_err(io::Error::other)
    }

    /// The border-widened rectangle of tile indices the viewport needs,
    /// clamped to the grid.
    fn draw_area(&self) -> DrawArea {
        if self.viewport.width <= 0. || self.viewport.height <= 0. {
            return DrawArea::EMPTY;
        }
        let (tile_width, tile_height) = self.provider.tile_size();
        let n = i64::from(total_tiles(self.zoom));
        let border = i64::from(self.options.border);

        let clamp = |value: i64| value.clamp(0, n) as u32;
        DrawArea {
            first_row: clamp((self.viewport.top / tile_height as f64).floor() as i64 - border),
            first_col: clamp((self.viewport.left / tile_width as f64).floor() as i64 - border),
            last_row: clamp((self.viewport.bottom() / tile_height as f64).floor() as i64 + border),
            last_col: clamp((self.viewport.right() / tile_width as f64).floor() as i64 + border),
        }
    }
}

impl<R: TileRenderer> Drop for MapSession<R> {
    fn drop(&mut self) {
        self.close();
    }
}

fn load_location(state_dir: &Path) -> Option<SavedLocation> {
    let raw = fs::read(state_dir.join(LOCATION_FILE)).ok()?;
    serde_json::from_slice(&raw).ok()
}
