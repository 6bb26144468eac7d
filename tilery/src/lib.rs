#![doc = include_str!("../README.md")]
#![deny(clippy::unwrap_used, rustdoc::broken_intra_doc_links)]

mod cache;
mod fetch;
mod mercator;
mod position;
mod provider;
mod render;
mod session;
mod store;

pub use cache::{TileCache, Visibility};
pub use fetch::{
    FetchError, FetchPool, FetchResult, Fetcher, HttpFetcher, DEFAULT_TIMEOUT, DEFAULT_WORKERS,
};
pub use mercator::{project, quadkey, tile_at, total_tiles, unproject, InvalidTag, TileId};
pub use position::{lat_lon, lon_lat, Pixels, Position};
pub use provider::TileProvider;
pub use render::{RenderError, TileHandle, TileRenderer};
pub use session::{MapSession, ScheduledTask, SessionError, SessionOptions, Viewport};
pub use store::TileStore;
