//! End-to-end fetch cycle: viewport geometry in, shown tiles and a populated
//! store out, with the network stubbed at the `Fetcher` seam.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tilery::{
    FetchError, Fetcher, MapSession, RenderError, SessionOptions, TileHandle, TileId,
    TileProvider, TileRenderer, TileStore, Viewport, Visibility,
};

struct NoopHandle;

impl TileHandle for NoopHandle {
    fn show(&mut self) -> Result<(), RenderError> {
        Ok(())
    }

    fn hide(&mut self) -> Result<(), RenderError> {
        Ok(())
    }
}

struct NoopRenderer;

impl TileRenderer for NoopRenderer {
    type Handle = NoopHandle;

    fn materialize(
        &mut self,
        _tile_id: TileId,
        _payload: &[u8],
    ) -> Result<NoopHandle, RenderError> {
        Ok(NoopHandle)
    }
}

/// Returns a fixed payload for every URL, failing the first `failures`
/// requests with a timeout.
struct StubNetwork {
    payload: &'static [u8],
    requests: AtomicUsize,
    failures: AtomicUsize,
}

impl StubNetwork {
    fn new(payload: &'static [u8]) -> Self {
        Self {
            payload,
            requests: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    fn failing_first(payload: &'static [u8], failures: usize) -> Self {
        let network = Self::new(payload);
        network.failures.store(failures, Ordering::SeqCst);
        network
    }
}

impl Fetcher for StubNetwork {
    fn fetch(&self, _url: &str, _headers: &BTreeMap<String, String>) -> Result<Bytes, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
        {
            return Err(FetchError::Timeout);
        }
        Ok(Bytes::from_static(self.payload))
    }
}

fn provider() -> TileProvider {
    TileProvider {
        name: "test".to_owned(),
        urls: vec!["https://tiles.test/{zoom}/{col}/{row}.png".to_owned()],
        tile_width: 256,
        tile_height: 256,
        max_zoom: 19,
        headers: BTreeMap::new(),
    }
}

fn options(root: &Path) -> SessionOptions {
    SessionOptions {
        cache_dir: root.join("tiles"),
        state_dir: root.to_owned(),
        border: 0,
        ..SessionOptions::default()
    }
}

fn open(root: &Path, fetcher: Arc<dyn Fetcher>, zoom: u8) -> MapSession<NoopRenderer> {
    MapSession::open_with_fetcher(provider(), NoopRenderer, options(root), Some(zoom), None, fetcher)
        .expect("session should open")
}

/// Tick the session until `tiles` tiles are cached, or fail.
fn tick_until_cached(session: &mut MapSession<NoopRenderer>, tiles: usize) {
    for _ in 0..200 {
        session.tick();
        if session.cached_tiles() == tiles {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!(
        "expected {tiles} cached tiles, got {}",
        session.cached_tiles()
    );
}

#[test]
fn one_fetch_cycle_fills_cache_and_store() {
    let _ = env_logger::try_init();
    let root = tempfile::tempdir().unwrap();
    let network = Arc::new(StubNetwork::new(b"X"));
    let mut session = open(root.path(), network.clone(), 2);

    // Rows 1..3, columns 1..3 of the 4x4 grid at zoom 2.
    session.set_viewport(Viewport {
        left: 256.,
        top: 256.,
        width: 512.,
        height: 512.,
    });
    tick_until_cached(&mut session, 4);

    let needed = [
        TileId::new(2, 1, 1),
        TileId::new(2, 1, 2),
        TileId::new(2, 2, 1),
        TileId::new(2, 2, 2),
    ];
    for tile_id in needed {
        assert_eq!(Some(Visibility::Shown), session.visibility(&tile_id));
        assert!(!session.is_queued(&tile_id));
    }
    assert_eq!(4, network.requests.load(Ordering::SeqCst));

    // Each tile got persisted on its way through the worker.
    let store = TileStore::open(root.path().join("tiles"), "test").unwrap();
    for tile_id in needed {
        assert_eq!(Some(b"X".to_vec()), store.get(tile_id).unwrap());
    }
}

#[test]
fn second_session_is_served_from_the_store() {
    let _ = env_logger::try_init();
    let root = tempfile::tempdir().unwrap();
    let viewport = Viewport {
        left: 256.,
        top: 256.,
        width: 512.,
        height: 512.,
    };

    let network = Arc::new(StubNetwork::new(b"X"));
    let mut session = open(root.path(), network.clone(), 2);
    session.set_viewport(viewport);
    tick_until_cached(&mut session, 4);
    session.close();
    assert_eq!(4, network.requests.load(Ordering::SeqCst));

    let network = Arc::new(StubNetwork::new(b"Y"));
    let mut session = open(root.path(), network.clone(), 2);
    session.set_viewport(viewport);
    tick_until_cached(&mut session, 4);

    // All four came from disk.
    assert_eq!(0, network.requests.load(Ordering::SeqCst));
}

#[test]
fn zoom_change_hides_tiles_without_evicting() {
    let _ = env_logger::try_init();
    let root = tempfile::tempdir().unwrap();
    let network = Arc::new(StubNetwork::new(b"X"));
    let mut session = open(root.path(), network, 2);

    session.set_viewport(Viewport {
        left: 256.,
        top: 256.,
        width: 512.,
        height: 512.,
    });
    tick_until_cached(&mut session, 4);

    session.set_zoom(3);

    assert_eq!(4, session.cached_tiles());
    assert_eq!(
        Some(Visibility::Hidden),
        session.visibility(&TileId::new(2, 1, 1))
    );
}

#[test]
fn timed_out_fetch_is_retried_on_a_later_tick() {
    let _ = env_logger::try_init();
    let root = tempfile::tempdir().unwrap();
    let network = Arc::new(StubNetwork::failing_first(b"X", 1));
    let mut session = open(root.path(), network.clone(), 2);

    // A single needed tile; the first attempt times out.
    session.set_viewport(Viewport {
        left: 0.,
        top: 0.,
        width: 256.,
        height: 256.,
    });

    // The failure clears the queued marker and the key re-enters the needed
    // set, so ticking eventually lands the tile.
    tick_until_cached(&mut session, 1);

    let tile_id = TileId::new(2, 0, 0);
    assert_eq!(Some(Visibility::Shown), session.visibility(&tile_id));
    assert!(!session.is_queued(&tile_id));
    assert_eq!(2, network.requests.load(Ordering::SeqCst));
}
