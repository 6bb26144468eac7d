//! On-disk tile store, one per tile provider.

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::mercator::TileId;

/// Durable cache of tile payloads keyed by `(zoom, row, col)`, scoped to one
/// provider name. Tiles are immutable per key, so the store only ever grows.
///
/// Clones share the same write lock, so concurrent workers never interleave
/// partial writes. Reads take no lock; a tile file only ever appears via an
/// atomic rename.
#[derive(Debug, Clone)]
pub struct TileStore {
    directory: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl TileStore {
    /// Open the store for `provider_name` under `root`, creating it if needed.
    pub fn open(root: impl AsRef<Path>, provider_name: &str) -> io::Result<Self> {
        let directory = root.as_ref().join(provider_name);
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn tile_path(&self, tile_id: TileId) -> PathBuf {
        self.directory.join(tile_id.to_string())
    }

    /// Point lookup. Safe for concurrent readers.
    pub fn get(&self, tile_id: TileId) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.tile_path(tile_id)) {
            Ok(payload) => Ok(Some(payload)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Idempotent upsert. The payload is committed before this returns: it is
    /// fully written to a temporary file and renamed into place, so a reader
    /// never observes a partial tile.
    pub fn put(&self, tile_id: TileId, payload: &[u8]) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let path = self.tile_path(tile_id);
        let staging = path.with_extension("partial");
        let mut file = fs::File::create(&staging)?;
        file.write_all(payload)?;
        file.sync_all()?;
        fs::rename(&staging, &path)
    }
}
