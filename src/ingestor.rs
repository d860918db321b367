//! Stream ingestor
//!
//! A single task owns the station store, the liveness supervisor and the
//! in-flight address lookups, so every mutation runs to completion without
//! locking. The task seeds the store from a snapshot, applies channel events
//! as they arrive, and answers view requests from an [`IngestorHandle`].
//!
//! Each location event produces a bounded set of follow-ups: one deadline
//! reset and one background lookup task resolving the live and assigned
//! addresses. Lookups are tracked in a `JoinSet` and aborted on teardown.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    api::SnapshotSource,
    config::AppConfig,
    errors::CommandCenterError,
    geocode::{AddressResolutionCache, ReverseGeocoder},
    liveness::{LivenessSupervisor, DEFAULT_LIVENESS_TIMEOUT},
    models::{ChannelEvent, RawStation, StationId, StationPatch, StationRecord, StationStatus},
    mqtt::EventSource,
    store::StationStore,
    view::{compute_stats, compute_view, StationView, ViewFilter},
};

const DEFAULT_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct IngestorSettings {
    pub liveness_timeout: Duration,
    pub cache_capacity: NonZeroUsize,
}

impl Default for IngestorSettings {
    fn default() -> Self {
        Self {
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            cache_capacity: NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl TryFrom<&AppConfig> for IngestorSettings {
    type Error = CommandCenterError;

    fn try_from(config: &AppConfig) -> Result<Self, Self::Error> {
        let cache_capacity = NonZeroUsize::new(config.geocode.cache_capacity).ok_or_else(|| {
            CommandCenterError::ConfigurationError {
                message: "Geocode cache capacity must be greater than zero".to_string(),
            }
        })?;

        Ok(Self {
            liveness_timeout: config.liveness.timeout,
            cache_capacity,
        })
    }
}

/// Result of a background address lookup
struct AddressResolution {
    station_id: StationId,
    revision: u64,
    live_address: String,
    assigned_address: String,
}

enum Request {
    View {
        filter: ViewFilter,
        reply: oneshot::Sender<StationView>,
    },
    Records {
        reply: oneshot::Sender<Vec<StationRecord>>,
    },
}

pub struct StreamIngestor<S, G> {
    settings: IngestorSettings,
    snapshot: S,
    cache: Arc<AddressResolutionCache<G>>,
}

impl<S: SnapshotSource, G: ReverseGeocoder> StreamIngestor<S, G> {
    pub fn new(settings: IngestorSettings, snapshot: S, geocoder: G) -> Self {
        let cache = Arc::new(AddressResolutionCache::new(geocoder, settings.cache_capacity));
        Self {
            settings,
            snapshot,
            cache,
        }
    }

    /// Start the ingestor task.
    ///
    /// The snapshot fetch and the event channel run independently; events
    /// are applied as soon as they arrive, even before the snapshot lands.
    pub fn spawn<E: EventSource>(self, events: E) -> IngestorHandle {
        let (requests_tx, requests_rx) = mpsc::channel(32);
        let (changes_tx, changes_rx) = watch::channel(0);
        let cancel = CancellationToken::new();

        let state = IngestorState {
            store: StationStore::new(),
            supervisor: LivenessSupervisor::new(self.settings.liveness_timeout),
            cache: self.cache,
            resolutions: JoinSet::new(),
            connected: false,
            last_error: None,
            changes: changes_tx,
        };

        let task = tokio::spawn(run(
            state,
            self.snapshot,
            events,
            requests_rx,
            cancel.clone(),
        ));

        IngestorHandle {
            requests: requests_tx,
            changes: changes_rx,
            cancel,
            task,
        }
    }
}

/// Client side of a running ingestor.
///
/// Dropping every handle stops the ingestor as well.
pub struct IngestorHandle {
    requests: mpsc::Sender<Request>,
    changes: watch::Receiver<u64>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl IngestorHandle {
    /// Filtered, sorted records with aggregate stats and channel state
    pub async fn view(&self, filter: ViewFilter) -> Result<StationView, CommandCenterError> {
        let (reply, response) = oneshot::channel();
        self.send(Request::View { filter, reply }).await?;
        response
            .await
            .map_err(|_| CommandCenterError::IngestorStopped)
    }

    /// Shorthand for [`view`](Self::view) with a search text and a district
    /// code (`ALL` for every district)
    pub async fn get_view(
        &self,
        search: &str,
        district: &str,
    ) -> Result<StationView, CommandCenterError> {
        self.view(ViewFilter::new(search, district)).await
    }

    /// Every record in store order
    pub async fn records(&self) -> Result<Vec<StationRecord>, CommandCenterError> {
        let (reply, response) = oneshot::channel();
        self.send(Request::Records { reply }).await?;
        response
            .await
            .map_err(|_| CommandCenterError::IngestorStopped)
    }

    /// Change counter, bumped after every store or channel state change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.clone()
    }

    /// Stop the ingestor, closing the channel and dropping pending work
    pub async fn shutdown(self) -> Result<(), CommandCenterError> {
        self.cancel.cancel();
        self.task.await?;
        Ok(())
    }

    async fn send(&self, request: Request) -> Result<(), CommandCenterError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| CommandCenterError::IngestorStopped)
    }
}

struct IngestorState<G> {
    store: StationStore,
    supervisor: LivenessSupervisor,
    cache: Arc<AddressResolutionCache<G>>,
    resolutions: JoinSet<AddressResolution>,
    connected: bool,
    last_error: Option<String>,
    changes: watch::Sender<u64>,
}

async fn run<S, G, E>(
    mut state: IngestorState<G>,
    snapshot: S,
    mut events: E,
    mut requests: mpsc::Receiver<Request>,
    cancel: CancellationToken,
) where
    S: SnapshotSource,
    G: ReverseGeocoder,
    E: EventSource,
{
    info!("Stream ingestor started");

    let fetch = snapshot.fetch_snapshot();
    tokio::pin!(fetch);
    let mut snapshot_pending = true;
    let mut channel_open = true;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            result = &mut fetch, if snapshot_pending => {
                snapshot_pending = false;
                state.on_snapshot(result);
            }
            event = events.recv(), if channel_open => match event {
                Some(event) => state.on_event(event),
                None => {
                    channel_open = false;
                    state.on_channel_closed();
                }
            },
            Some(joined) = state.resolutions.join_next() => state.on_resolution(joined),
            station_id = state.supervisor.next_expired() => state.on_liveness_timeout(station_id),
            request = requests.recv() => match request {
                Some(request) => state.on_request(request),
                None => {
                    debug!("All ingestor handles dropped");
                    break;
                }
            },
        }
    }

    state.teardown();
    events.close().await;
    info!("Stream ingestor stopped");
}

impl<G: ReverseGeocoder> IngestorState<G> {
    fn on_snapshot(&mut self, result: Result<Vec<RawStation>, CommandCenterError>) {
        match result {
            Ok(stations) => {
                let count = self.store.load_snapshot(stations);
                info!("Loaded snapshot with {} stations", count);
                self.arm_snapshot_deadlines();
                self.resolve_snapshot_addresses();
            }
            Err(e) => {
                error!("Failed to fetch station snapshot: {}", e);
                self.last_error = Some(format!("Snapshot fetch failed: {}", e));
            }
        }
        self.notify();
    }

    /// Give every station that is not already offline the remainder of its
    /// silence window, counted from its last report.
    fn arm_snapshot_deadlines(&mut self) {
        let timeout = self.supervisor.timeout();
        let now = Utc::now();
        let start = Instant::now();

        for record in self.store.records() {
            if record.status == StationStatus::Offline
                || self.supervisor.is_pending(&record.station_id)
            {
                continue;
            }

            let remaining = match record.last_seen {
                Some(last_seen) => now
                    .signed_duration_since(last_seen)
                    .to_std()
                    .map_or(timeout, |age| timeout.saturating_sub(age)),
                None => timeout,
            };
            self.supervisor
                .schedule_at(&record.station_id, start + remaining);
        }
    }

    fn resolve_snapshot_addresses(&mut self) {
        for record in self.store.records() {
            // Stations with live updates already have lookups of their own
            if let Some(0) = self.store.revision(&record.station_id) {
                request_addresses(&mut self.resolutions, &self.cache, record, 0);
            }
        }
    }

    fn on_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                info!("Event channel connected");
                self.connected = true;
            }
            ChannelEvent::Disconnected => {
                warn!("Event channel disconnected, keeping {} stations", self.store.len());
                self.connected = false;
            }
            ChannelEvent::Rejected(reason) => {
                error!("Event channel rejected our credentials: {}", reason);
                self.connected = false;
                self.last_error = Some(format!("Event channel rejected: {}", reason));
            }
            ChannelEvent::LocationUpdate(update) => {
                debug!("Location update for {}", update.station_id);
                let station_id = update.station_id;
                let revision = self.store.apply_update(
                    &station_id,
                    &StationPatch::Location(update.fix),
                    Utc::now(),
                );
                self.supervisor.touch(&station_id);
                if let Some(record) = self.store.get(&station_id) {
                    request_addresses(&mut self.resolutions, &self.cache, record, revision);
                }
            }
            ChannelEvent::StatusUpdate(update) => {
                debug!("Status update for {}: {}", update.station_id, update.status);
                self.store.apply_update(
                    &update.station_id,
                    &StationPatch::Status(update.status),
                    Utc::now(),
                );
                self.supervisor.touch(&update.station_id);
            }
        }
        self.notify();
    }

    fn on_channel_closed(&mut self) {
        warn!("Event channel closed");
        self.connected = false;
        self.notify();
    }

    fn on_resolution(&mut self, joined: Result<AddressResolution, JoinError>) {
        match joined {
            Ok(resolution) => {
                if self.store.apply_address_resolution(
                    &resolution.station_id,
                    resolution.live_address,
                    resolution.assigned_address,
                    resolution.revision,
                ) {
                    self.notify();
                }
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!("Address lookup task failed: {}", e),
        }
    }

    fn on_liveness_timeout(&mut self, station_id: StationId) {
        if self.store.mark_offline(&station_id) {
            info!("Station {} went silent, marking offline", station_id);
            self.notify();
        }
    }

    fn on_request(&self, request: Request) {
        match request {
            Request::View { filter, reply } => {
                let _ = reply.send(self.view(&filter));
            }
            Request::Records { reply } => {
                let _ = reply.send(self.store.get_all());
            }
        }
    }

    fn view(&self, filter: &ViewFilter) -> StationView {
        StationView {
            records: compute_view(self.store.records(), filter),
            stats: compute_stats(
                self.store.records(),
                Utc::now(),
                self.supervisor.timeout(),
            ),
            connected: self.connected,
            last_error: self.last_error.clone(),
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    fn teardown(&mut self) {
        debug!(
            "Dropping {} pending lookups and {} deadlines",
            self.resolutions.len(),
            self.supervisor.len()
        );
        self.resolutions.abort_all();
        self.supervisor.clear();
    }
}

/// Spawn a lookup for both addresses of a record at the given revision
fn request_addresses<G: ReverseGeocoder>(
    resolutions: &mut JoinSet<AddressResolution>,
    cache: &Arc<AddressResolutionCache<G>>,
    record: &StationRecord,
    revision: u64,
) {
    let cache = Arc::clone(cache);
    let station_id = record.station_id.clone();
    let (lat, lng) = (record.latitude, record.longitude);
    let (assigned_lat, assigned_lng) = (record.assigned_latitude, record.assigned_longitude);

    resolutions.spawn(async move {
        let (live_address, assigned_address) = tokio::join!(
            cache.resolve(lat, lng),
            cache.resolve(assigned_lat, assigned_lng)
        );
        AddressResolution {
            station_id,
            revision,
            live_address,
            assigned_address,
        }
    });
}
