//! Venue ingestion pipeline and the background refresh scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use mdisc_adapters::{
    venues_from_elements, AdapterError, OverpassSource, PoiSource, DEFAULT_AREA_NAME,
    DEFAULT_OVERPASS_URL,
};
use mdisc_core::Venue;
use mdisc_storage::{HttpClientConfig, HttpFetcher, SnapshotStore, StoreError, VenueStore};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mdisc-sync";

/// Upper bound on venues returned when a refresh falls back to stored data.
pub const FALLBACK_LIMIT: u32 = 1000;

/// Freshness value reported before any snapshot exists.
pub const NEVER_UPDATED: &str = "Never";

pub const LAST_UPDATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub snapshot_path: PathBuf,
    pub overpass_url: String,
    pub overpass_area: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub refresh_interval_secs: u64,
    pub scheduler_enabled: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/venues.db?mode=rwc".to_string()),
            snapshot_path: std::env::var("VENUES_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/venues.json")),
            overpass_url: std::env::var("OVERPASS_URL")
                .unwrap_or_else(|_| DEFAULT_OVERPASS_URL.to_string()),
            overpass_area: std::env::var("OVERPASS_AREA")
                .unwrap_or_else(|_| DEFAULT_AREA_NAME.to_string()),
            user_agent: std::env::var("MDISC_USER_AGENT")
                .unwrap_or_else(|_| "mdisc-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("MDISC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(25),
            refresh_interval_secs: std::env::var("MDISC_REFRESH_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .unwrap_or(DEFAULT_REFRESH_INTERVAL.as_secs()),
            scheduler_enabled: std::env::var("MDISC_SCHEDULER_ENABLED")
                .map(|v| !matches!(v.trim(), "0" | "false" | "FALSE" | "False" | "no"))
                .unwrap_or(true),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// What one ingestion cycle produced. `Stale` carries the stored venues that
/// were served instead, plus why the refresh did not happen.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Fresh { venues: Vec<Venue> },
    Stale { venues: Vec<Venue>, reason: String },
}

impl IngestOutcome {
    pub fn venues(&self) -> &[Venue] {
        match self {
            IngestOutcome::Fresh { venues } | IngestOutcome::Stale { venues, .. } => venues,
        }
    }

    pub fn into_venues(self) -> Vec<Venue> {
        match self {
            IngestOutcome::Fresh { venues } | IngestOutcome::Stale { venues, .. } => venues,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, IngestOutcome::Stale { .. })
    }

    pub fn stale_reason(&self) -> Option<&str> {
        match self {
            IngestOutcome::Fresh { .. } => None,
            IngestOutcome::Stale { reason, .. } => Some(reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestFailure {
    #[error("provider fetch failed: {0}")]
    Source(#[from] AdapterError),
    #[error("writing backup snapshot failed: {0:#}")]
    Snapshot(anyhow::Error),
    #[error("replacing stored venues failed: {0}")]
    Store(#[from] StoreError),
}

/// Fetch, map, filter and persist one provider snapshot.
pub struct IngestionService {
    source: Arc<dyn PoiSource>,
    store: Arc<dyn VenueStore>,
    snapshot: SnapshotStore,
}

impl IngestionService {
    pub fn new(source: Arc<dyn PoiSource>, store: Arc<dyn VenueStore>, snapshot: SnapshotStore) -> Self {
        Self {
            source,
            store,
            snapshot,
        }
    }

    /// Wire the Overpass source and backup snapshot described by `config`.
    pub fn from_config(config: &SyncConfig, store: Arc<dyn VenueStore>) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let source = OverpassSource::new(
            http,
            config.overpass_url.clone(),
            config.overpass_area.clone(),
            config.http_timeout_secs,
        );
        Ok(Self::new(
            Arc::new(source),
            store,
            SnapshotStore::new(config.snapshot_path.clone()),
        ))
    }

    pub fn store(&self) -> &Arc<dyn VenueStore> {
        &self.store
    }

    pub fn snapshot(&self) -> &SnapshotStore {
        &self.snapshot
    }

    /// Run one ingestion cycle.
    ///
    /// A failed refresh never raises: the store is left untouched and its
    /// current contents (up to [`FALLBACK_LIMIT`]) come back as
    /// [`IngestOutcome::Stale`]. Only a storage fault while reading that
    /// fallback is returned as an error.
    pub async fn fetch_and_store(&self) -> Result<IngestOutcome, StoreError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest", %run_id, source = self.source.source_id());
        async move {
            let started = Instant::now();
            match self.refresh().await {
                Ok(venues) => {
                    info!(
                        kept = venues.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "ingestion cycle stored venues"
                    );
                    Ok(IngestOutcome::Fresh { venues })
                }
                Err(failure) => {
                    error!(error = %failure, "ingestion cycle failed; serving stored venues");
                    let venues = self.store.all(FALLBACK_LIMIT).await?;
                    Ok(IngestOutcome::Stale {
                        venues,
                        reason: failure.to_string(),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn refresh(&self) -> Result<Vec<Venue>, IngestFailure> {
        let elements = self.source.fetch_elements().await?;
        let mapped = venues_from_elements(&elements);
        info!(
            fetched = elements.len(),
            parsed = mapped.parsed,
            kept = mapped.venues.len(),
            "mapped provider elements"
        );

        self.snapshot
            .write(&mapped.venues)
            .await
            .map_err(IngestFailure::Snapshot)?;
        self.store.replace_all(&mapped.venues).await?;
        Ok(mapped.venues)
    }

    /// Snapshot mtime as `yyyy-MM-dd HH:mm:ss` local time, or [`NEVER_UPDATED`].
    pub async fn last_update_time(&self) -> String {
        match self.snapshot.modified_at().await {
            Ok(Some(modified)) => modified.format(LAST_UPDATE_FORMAT).to_string(),
            Ok(None) => NEVER_UPDATED.to_string(),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "reading snapshot timestamp failed");
                NEVER_UPDATED.to_string()
            }
        }
    }

    /// Re-seed the store from the backup snapshot. `None` when there is no snapshot.
    pub async fn restore_from_snapshot(&self) -> anyhow::Result<Option<usize>> {
        let Some(venues) = self.snapshot.load().await? else {
            return Ok(None);
        };
        let venues = venues
            .into_iter()
            .filter(Venue::has_complete_address)
            .collect::<Vec<_>>();
        self.store
            .replace_all(&venues)
            .await
            .context("restoring venues from snapshot")?;
        info!(venues = venues.len(), path = %self.snapshot.path().display(), "store restored from snapshot");
        Ok(Some(venues.len()))
    }
}

enum SchedulerState {
    Idle,
    Running {
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Runs an ingestion cycle at startup when the store is empty, then once per
/// interval until stopped. A stopped scheduler cannot be restarted.
pub struct RefreshScheduler {
    ingestion: Arc<IngestionService>,
    interval: Duration,
    state: Mutex<SchedulerState>,
}

impl RefreshScheduler {
    pub fn new(ingestion: Arc<IngestionService>, interval: Duration) -> Self {
        Self {
            ingestion,
            interval,
            state: Mutex::new(SchedulerState::Idle),
        }
    }

    /// Spawn the background loop. Returns `false` if it was already started.
    pub async fn start(&self) -> bool {
        let mut state = self.state.lock().await;
        if !matches!(*state, SchedulerState::Idle) {
            warn!("refresh scheduler already started; ignoring start");
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_refresh_loop(
            Arc::clone(&self.ingestion),
            self.interval,
            shutdown_rx,
        ));
        *state = SchedulerState::Running { shutdown, handle };
        info!(interval_secs = self.interval.as_secs(), "refresh scheduler started");
        true
    }

    /// Cancel the loop at its next wait point and wait for it to exit.
    /// An in-flight ingestion cycle is allowed to finish.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, SchedulerState::Stopped);
        if let SchedulerState::Running { shutdown, handle } = previous {
            let _ = shutdown.send(true);
            if let Err(err) = handle.await {
                warn!(error = %err, "refresh loop ended abnormally");
            }
            info!("refresh scheduler stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, SchedulerState::Running { .. })
    }
}

async fn run_refresh_loop(
    ingestion: Arc<IngestionService>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    match ingestion.store().count().await {
        Ok(0) => {
            info!("no cached venues found; running initial ingestion");
            run_cycle(&ingestion, "initial").await;
        }
        Ok(cached) => info!(cached, "using cached venues until the next scheduled refresh"),
        Err(err) => {
            warn!(error = %err, "counting cached venues failed; running initial ingestion");
            run_cycle(&ingestion, "initial").await;
        }
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => run_cycle(&ingestion, "scheduled").await,
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_cycle(ingestion: &IngestionService, trigger: &'static str) {
    match ingestion.fetch_and_store().await {
        Ok(IngestOutcome::Fresh { venues }) => {
            info!(trigger, venues = venues.len(), "venue refresh completed")
        }
        Ok(IngestOutcome::Stale { reason, .. }) => {
            warn!(trigger, %reason, "venue refresh failed; keeping stored venues")
        }
        Err(err) => error!(trigger, error = %err, "venue refresh failed reading stored venues"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use mdisc_adapters::{parse_overpass_response, OverpassElement};
    use mdisc_core::Category;
    use mdisc_storage::MemoryVenueStore;
    use tempfile::{tempdir, TempDir};

    struct TestSource {
        elements: Vec<OverpassElement>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl TestSource {
        fn serving(elements: Vec<OverpassElement>) -> Arc<Self> {
            Arc::new(Self {
                elements,
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                elements: Vec::new(),
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PoiSource for TestSource {
        fn source_id(&self) -> &'static str {
            "test"
        }

        async fn fetch_elements(&self) -> Result<Vec<OverpassElement>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(parse_overpass_response(b"<html>504 Gateway Timeout</html>").unwrap_err());
            }
            Ok(self.elements.clone())
        }
    }

    fn element(id: i64, name: &str, street: Option<&str>, number: Option<&str>) -> OverpassElement {
        let mut tags = BTreeMap::from([
            ("name".to_string(), name.to_string()),
            ("amenity".to_string(), "cafe".to_string()),
        ]);
        if let Some(street) = street {
            tags.insert("addr:street".into(), street.into());
        }
        if let Some(number) = number {
            tags.insert("addr:housenumber".into(), number.into());
        }
        OverpassElement {
            element_type: "node".into(),
            id,
            lat: Some(48.14),
            lon: Some(11.57),
            tags: Some(tags),
        }
    }

    fn stored(id: &str, name: &str) -> Venue {
        Venue {
            id: id.into(),
            name: name.into(),
            category: Category::Pub,
            street: Some("Tal".into()),
            house_number: Some("8".into()),
            latitude: 48.13,
            longitude: 11.58,
            description: None,
        }
    }

    fn service(
        source: Arc<TestSource>,
        store: Arc<MemoryVenueStore>,
    ) -> (Arc<IngestionService>, TempDir) {
        let dir = tempdir().expect("tempdir");
        let snapshot = SnapshotStore::new(dir.path().join("venues.json"));
        (Arc::new(IngestionService::new(source, store, snapshot)), dir)
    }

    #[tokio::test]
    async fn successful_cycle_replaces_entire_store() {
        let store = Arc::new(MemoryVenueStore::new());
        store.upsert(&stored("old", "Prior Run Pub")).await.unwrap();
        let mut no_coords = element(4, "Floating", Some("Tal"), Some("1"));
        no_coords.lat = None;
        let source = TestSource::serving(vec![
            element(1, "Café Frischhut", Some("Prälat-Zistl-Straße"), Some("8")),
            element(2, "Street Only", Some("Tal"), None),
            element(3, "Number Only", None, Some("3")),
            no_coords,
        ]);
        let (ingestion, _dir) = service(source.clone(), store.clone());

        let outcome = ingestion.fetch_and_store().await.expect("outcome");

        assert!(!outcome.is_stale());
        let ids = outcome.venues().iter().map(|v| v.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["1"]);
        assert_eq!(store.all(1000).await.unwrap(), outcome.venues().to_vec());
        assert_eq!(source.calls(), 1);

        let snapshot = ingestion.snapshot().load().await.unwrap().expect("snapshot written");
        assert_eq!(snapshot, outcome.into_venues());
    }

    #[tokio::test]
    async fn failed_fetch_serves_stored_venues_untouched() {
        let store = Arc::new(MemoryVenueStore::new());
        let existing = vec![stored("a", "Augustiner"), stored("b", "Tegernseer Tal")];
        store.replace_all(&existing).await.unwrap();
        let (ingestion, _dir) = service(TestSource::failing(), store.clone());

        let outcome = ingestion.fetch_and_store().await.expect("failure is absorbed");

        assert!(outcome.is_stale());
        assert!(outcome.stale_reason().unwrap().contains("provider fetch failed"));
        assert_eq!(outcome.venues(), existing.as_slice());
        assert_eq!(store.all(1000).await.unwrap(), existing);
        assert!(ingestion.snapshot().load().await.unwrap().is_none());
        assert_eq!(ingestion.last_update_time().await, NEVER_UPDATED);
    }

    #[tokio::test]
    async fn snapshot_failure_aborts_before_store_write() {
        let store = Arc::new(MemoryVenueStore::new());
        store.upsert(&stored("keep", "Keep Me")).await.unwrap();
        let dir = tempdir().expect("tempdir");
        // a directory in place of the snapshot file makes the final rename fail
        let ingestion = IngestionService::new(
            TestSource::serving(vec![element(1, "New", Some("Tal"), Some("1"))]),
            store.clone(),
            SnapshotStore::new(dir.path()),
        );

        let outcome = ingestion.fetch_and_store().await.unwrap();

        assert!(outcome.stale_reason().unwrap().contains("snapshot"));
        assert_eq!(store.all(1000).await.unwrap(), vec![stored("keep", "Keep Me")]);
    }

    #[tokio::test]
    async fn provider_timeout_serves_stored_venues() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accepts and never answers
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let store = Arc::new(MemoryVenueStore::new());
        store.upsert(&stored("kept", "Kept Pub")).await.unwrap();
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(300),
            user_agent: None,
        })
        .unwrap();
        let source = Arc::new(OverpassSource::new(
            http,
            format!("http://{addr}/api/interpreter"),
            DEFAULT_AREA_NAME,
            1,
        ));
        let dir = tempdir().expect("tempdir");
        let ingestion = IngestionService::new(
            source,
            store.clone(),
            SnapshotStore::new(dir.path().join("venues.json")),
        );

        let outcome = ingestion.fetch_and_store().await.expect("timeout is absorbed");

        assert!(outcome.is_stale());
        assert!(outcome.stale_reason().unwrap().contains("provider fetch failed"));
        assert_eq!(outcome.into_venues(), vec![stored("kept", "Kept Pub")]);
        assert_eq!(ingestion.last_update_time().await, NEVER_UPDATED);
        server.abort();
    }

    #[tokio::test]
    async fn last_update_time_uses_fixed_pattern() {
        let store = Arc::new(MemoryVenueStore::new());
        let (ingestion, _dir) = service(
            TestSource::serving(vec![element(1, "Café", Some("Tal"), Some("1"))]),
            store,
        );
        assert_eq!(ingestion.last_update_time().await, NEVER_UPDATED);

        ingestion.fetch_and_store().await.unwrap();

        let stamp = ingestion.last_update_time().await;
        assert!(
            chrono::NaiveDateTime::parse_from_str(&stamp, LAST_UPDATE_FORMAT).is_ok(),
            "unexpected timestamp {stamp}"
        );
    }

    #[tokio::test]
    async fn restore_reseeds_store_from_snapshot() {
        let store = Arc::new(MemoryVenueStore::new());
        let (ingestion, _dir) = service(TestSource::failing(), store.clone());
        assert_eq!(ingestion.restore_from_snapshot().await.unwrap(), None);

        let saved = vec![stored("x", "Löwenbräukeller")];
        ingestion.snapshot().write(&saved).await.unwrap();

        assert_eq!(ingestion.restore_from_snapshot().await.unwrap(), Some(1));
        assert_eq!(store.all(1000).await.unwrap(), saved);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_store_triggers_initial_cycle() {
        let store = Arc::new(MemoryVenueStore::new());
        let source = TestSource::serving(vec![element(1, "Café", Some("Tal"), Some("1"))]);
        let (ingestion, _dir) = service(source.clone(), store);
        let scheduler = RefreshScheduler::new(ingestion, DEFAULT_REFRESH_INTERVAL);

        assert!(scheduler.start().await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.calls(), 1);

        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn warm_store_waits_for_interval() {
        let store = Arc::new(MemoryVenueStore::new());
        store.upsert(&stored("cached", "Cached Pub")).await.unwrap();
        let source = TestSource::serving(vec![element(1, "Café", Some("Tal"), Some("1"))]);
        let (ingestion, _dir) = service(source.clone(), store);
        let scheduler = RefreshScheduler::new(ingestion, DEFAULT_REFRESH_INTERVAL);

        scheduler.start().await;
        tokio::time::sleep(Duration::from_secs(23 * 60 * 60)).await;
        assert_eq!(source.calls(), 0, "no cycle before the interval elapses");

        tokio::time::sleep(Duration::from_secs(2 * 60 * 60)).await;
        assert_eq!(source.calls(), 1);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_cycles_do_not_end_the_loop() {
        let store = Arc::new(MemoryVenueStore::new());
        let source = TestSource::failing();
        let (ingestion, _dir) = service(source.clone(), store);
        let scheduler = RefreshScheduler::new(ingestion, DEFAULT_REFRESH_INTERVAL);

        scheduler.start().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.calls(), 1);

        tokio::time::sleep(DEFAULT_REFRESH_INTERVAL).await;
        assert_eq!(source.calls(), 2);
        assert!(scheduler.is_running().await);

        scheduler.stop().await;
        assert!(!scheduler.start().await, "stopped scheduler stays stopped");

        tokio::time::sleep(DEFAULT_REFRESH_INTERVAL * 2).await;
        assert_eq!(source.calls(), 2);
    }
}
