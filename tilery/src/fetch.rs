//! Background acquisition of tiles: a small pool of worker threads resolving
//! jobs from the persistent store, or from the network on a store miss.
//!
//! Workers communicate with the interactive thread through two queues. Jobs
//! are popped last-in-first-out, so tiles requested during a fast pan preempt
//! stale ones; completions go through a channel the interactive thread drains
//! without ever blocking.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::mercator::TileId;
use crate::provider::TileProvider;
use crate::store::TileStore;

/// Default bound on a single network fetch.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of fetch workers per session.
pub const DEFAULT_WORKERS: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch timed out")]
    Timeout,

    #[error("HTTP status {0}")]
    Status(reqwest::StatusCode),

    #[error(transparent)]
    Http(reqwest::Error),

    #[error("tile store: {0}")]
    Store(#[from] io::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(error)
        }
    }
}

/// A unit of work for the pool.
pub(crate) enum Job {
    /// Resolve this tile from the store or the provider's servers.
    Tile {
        tile_id: TileId,
        provider: Arc<TileProvider>,
    },

    /// Terminate the worker that pops it.
    Poison,
}

/// What a worker produced for a tile. `payload` is `None` when the fetch
/// failed; a result is pushed either way, so the caller can always clear its
/// bookkeeping for the key.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub tile_id: TileId,
    pub payload: Option<Bytes>,
}

/// Blocking last-in-first-out queue.
pub(crate) struct LifoQueue<T> {
    items: Mutex<Vec<T>>,
    available: Condvar,
}

impl<T> LifoQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
        self.available.notify_one();
    }

    /// Block until an item is available and pop the most recent one.
    pub fn pop(&self) -> T {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(item) = items.pop() {
                return item;
            }
            items = self
                .available
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn clear(&self) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Fetches a tile payload from a URL. Implemented by [`HttpFetcher`] for
/// production use; tests substitute their own.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, headers: &BTreeMap<String, String>) -> Result<Bytes, FetchError>;
}

/// [`Fetcher`] backed by a blocking reqwest client with a bounded per-request
/// timeout. A non-success status is an error; the body is passed through as
/// opaque bytes.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    /// `accept_invalid_certs` disables TLS peer verification, tolerating
    /// self-signed tile mirrors. Leave it off unless you operate the mirror.
    pub fn new(timeout: Duration, accept_invalid_certs: bool) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, headers: &BTreeMap<String, String>) -> Result<Bytes, FetchError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send()?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }
        Ok(response.bytes()?)
    }
}

struct TileWorker {
    handle: JoinHandle<()>,
}

impl TileWorker {
    fn spawn(
        jobs: Arc<LifoQueue<Job>>,
        results: Sender<FetchResult>,
        store: TileStore,
        fetcher: Arc<dyn Fetcher>,
    ) -> io::Result<Self> {
        let handle = std::thread::Builder::new()
            .name("tile-worker".to_owned())
            .spawn(move || worker_loop(&jobs, &results, &store, fetcher.as_ref()))?;
        Ok(Self { handle })
    }
}

fn worker_loop(
    jobs: &LifoQueue<Job>,
    results: &Sender<FetchResult>,
    store: &TileStore,
    fetcher: &dyn Fetcher,
) {
    loop {
        match jobs.pop() {
            Job::Poison => break,
            Job::Tile { tile_id, provider } => {
                // Any per-tile failure is reported and the loop goes on; only
                // poison ends it.
                let payload = match resolve(store, fetcher, &provider, tile_id) {
                    Ok(payload) => Some(payload),
                    Err(error) => {
                        log::warn!("could not fetch tile {tile_id}: {error}");
                        None
                    }
                };
                if results.send(FetchResult { tile_id, payload }).is_err() {
                    // The session is gone, nobody left to serve.
                    break;
                }
            }
        }
    }
    log::debug!("tile worker exiting");
}

/// Store lookup first, network on a miss, persisting the download before
/// reporting it.
fn resolve(
    store: &TileStore,
    fetcher: &dyn Fetcher,
    provider: &TileProvider,
    tile_id: TileId,
) -> Result<Bytes, FetchError> {
    if let Some(payload) = store.get(tile_id)? {
        return Ok(Bytes::from(payload));
    }
    let url = provider.tile_url(tile_id);
    log::debug!("downloading tile {tile_id} from {url}");
    let payload = fetcher.fetch(&url, &provider.headers)?;
    store.put(tile_id, &payload)?;
    Ok(payload)
}

/// Pool of background workers sharing one job queue and one completion
/// channel. Its lifetime is bound to a map session: [`FetchPool::stop`]
/// poisons every worker and waits for them to exit.
pub struct FetchPool {
    jobs: Arc<LifoQueue<Job>>,
    results: Receiver<FetchResult>,
    workers: Vec<TileWorker>,
}

impl FetchPool {
    pub fn spawn(workers: usize, store: &TileStore, fetcher: Arc<dyn Fetcher>) -> io::Result<Self> {
        let jobs = Arc::new(LifoQueue::new());
        let (result_tx, results) = unbounded();
        let workers = (0..workers)
            .map(|_| {
                TileWorker::spawn(
                    jobs.clone(),
                    result_tx.clone(),
                    store.clone(),
                    fetcher.clone(),
                )
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            jobs,
            results,
            workers,
        })
    }

    /// Ask for a tile. The most recent request is served first.
    pub fn request(&self, tile_id: TileId, provider: Arc<TileProvider>) {
        self.jobs.push(Job::Tile { tile_id, provider });
    }

    /// Everything the workers have finished so far. Never blocks.
    pub fn completed(&self) -> Vec<FetchResult> {
        self.results.try_iter().collect()
    }

    /// Drop all pending jobs and unconsumed results.
    pub fn clear(&self) {
        self.jobs.clear();
        while self.results.try_recv().is_ok() {}
    }

    /// Poison every worker and wait for them to exit. A worker mid-fetch
    /// finishes that one fetch, subject to its timeout, before observing the
    /// poison.
    pub fn stop(&mut self) {
        self.jobs.clear();
        for _ in &self.workers {
            self.jobs.push(Job::Poison);
        }
        for worker in self.workers.drain(..) {
            if worker.handle.join().is_err() {
                log::error!("tile worker panicked");
            }
        }
    }
}

impl Drop for FetchPool {
    fn drop(&mut self) {
        self.stop();
    }
}
