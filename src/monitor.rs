//! Monitor scheduler: the run/stop state machine, the tick loop, and the
//! poll cycle that fetches, dedupes, notifies and cleans up.
use crate::config::{Config, Search};
use crate::model::{CycleStats, Listing, MonitorState, SearchHit, SeenRecord, StatusSnapshot};
use crate::notify::{Dispatcher, NotifyError};
use crate::scraper::{ListingSource, ScrapeError};
use crate::store::{SeenStore, StorageError};
use anyhow::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

/// Scheduling knobs derived from [`Config`] at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub criteria: Search,
    pub check_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Bounds one whole fetch, including per-keyword pacing inside the source.
    pub attempt_timeout: Duration,
    pub retention: chrono::Duration,
    pub max_listings: usize,
    pub stop_grace: Duration,
}

impl Settings {
    pub fn from_config(cfg: &Config) -> Self {
        let keywords = cfg.search.keywords.len().max(1) as u64;
        Self {
            criteria: cfg.search.clone(),
            check_interval: cfg.check_interval(),
            max_retries: cfg.monitor.max_retries,
            retry_delay: cfg.retry_delay(),
            attempt_timeout: Duration::from_secs((cfg.source.request_timeout_secs + 2) * keywords),
            retention: cfg.retention(),
            max_listings: cfg.monitor.max_listings_per_check,
            stop_grace: cfg.stop_grace(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: MonitorState,
    last_cycle: Option<CycleStats>,
}

struct Core {
    store: SeenStore,
    source: Arc<dyn ListingSource>,
    dispatcher: Dispatcher,
    settings: Settings,
    shared: StdMutex<Shared>,
    stop_tx: watch::Sender<bool>,
}

/// Owns the single poll loop and the state it shares with the control
/// surface. All methods are safe to call concurrently with a running cycle.
pub struct Monitor {
    core: Arc<Core>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(
        store: SeenStore,
        source: Arc<dyn ListingSource>,
        dispatcher: Dispatcher,
        settings: Settings,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            core: Arc::new(Core {
                store,
                source,
                dispatcher,
                settings,
                shared: StdMutex::new(Shared {
                    state: MonitorState::Stopped,
                    last_cycle: None,
                }),
                stop_tx,
            }),
            task: Mutex::new(None),
        }
    }

    /// Begin the tick loop. Returns false (no-op) when a loop is already
    /// running or still stopping; the state transition under the lock is
    /// what guarantees a single loop.
    pub async fn start(&self) -> bool {
        {
            let mut sh = self.core.shared.lock().expect("state lock poisoned");
            match sh.state {
                MonitorState::Running | MonitorState::Stopping => {
                    warn!(state = sh.state.as_str(), "start ignored; loop already active");
                    return false;
                }
                MonitorState::Stopped => sh.state = MonitorState::Running,
            }
        }
        self.core.stop_tx.send_replace(false);
        // Subscribe before spawning so a stop signal sent before the task
        // first polls is never dropped for lack of a receiver.
        let stop_rx = self.core.stop_tx.subscribe();
        let core = self.core.clone();
        let handle = tokio::spawn(async move { core.run_loop(stop_rx).await });
        *self.task.lock().await = Some(handle);
        info!("monitor started");
        true
    }

    /// Signal the loop to exit after its current cycle and wait for it, up
    /// to the grace period. Returns false (no-op) when already stopped. A
    /// stop issued while another stop is draining waits for that drain.
    pub async fn stop(&self) -> bool {
        {
            let mut sh = self.core.shared.lock().expect("state lock poisoned");
            match sh.state {
                MonitorState::Stopped => {
                    info!(state = sh.state.as_str(), "stop ignored; monitor already stopped");
                    return false;
                }
                MonitorState::Running => sh.state = MonitorState::Stopping,
                MonitorState::Stopping => {}
            }
        }
        // send_replace stores the flag even when the loop has not yet
        // subscribed, unlike send.
        self.core.stop_tx.send_replace(true);

        // The task lock is held across the join so a concurrent stop()
        // queues behind this one until the loop has actually exited.
        let mut task = self.task.lock().await;
        if let Some(mut handle) = task.take() {
            if timeout(self.core.settings.stop_grace, &mut handle)
                .await
                .is_err()
            {
                warn!("grace period elapsed; aborting poll loop");
                handle.abort();
            }
        }
        drop(task);

        self.core.shared.lock().expect("state lock poisoned").state = MonitorState::Stopped;
        info!("monitor stopped");
        true
    }

    /// Snapshot of state plus the last cycle stats. Never waits on the loop.
    pub async fn status(&self) -> StatusSnapshot {
        let (state, last_cycle) = {
            let sh = self.core.shared.lock().expect("state lock poisoned");
            (sh.state, sh.last_cycle.clone())
        };
        let tracked_listings = match self.core.store.count().await {
            Ok(n) => n,
            Err(err) => {
                warn!(?err, "seen store count unavailable");
                0
            }
        };
        StatusSnapshot {
            state,
            last_cycle,
            tracked_listings,
        }
    }

    /// Run one poll cycle outside the scheduled loop. Does not touch
    /// `MonitorState`; the resulting stats are published like a scheduled
    /// cycle's.
    pub async fn check_once(&self) -> CycleStats {
        let stats = self.core.run_cycle(None).await;
        self.core.publish_stats(stats.clone());
        stats
    }

    /// Ad-hoc search: fetch and annotate with dedupe status, recording and
    /// notifying nothing.
    pub async fn search_once(
        &self,
        criteria: Option<Search>,
        max_listings: Option<usize>,
    ) -> Result<Vec<SearchHit>> {
        let criteria = criteria.unwrap_or_else(|| self.core.settings.criteria.clone());
        let cap = max_listings.unwrap_or(self.core.settings.max_listings);

        let mut stats = CycleStats::default();
        let listings = self
            .core
            .fetch_with_retry(&criteria, cap, None, &mut stats)
            .await?;

        let mut hits = Vec::with_capacity(listings.len());
        for listing in listings {
            let is_new = !self.core.store.contains(&listing.id).await?;
            hits.push(SearchHit { listing, is_new });
        }
        Ok(hits)
    }

    /// Page over the seen store, newest first.
    pub async fn listings(&self, limit: i64, offset: i64) -> Result<Vec<SeenRecord>, StorageError> {
        self.core.store.page(limit, offset).await
    }

    /// Drop all dedupe history.
    pub async fn clear_listings(&self) -> Result<(), StorageError> {
        self.core.store.clear().await
    }

    /// Direct pass-through to the dispatcher, bypassing dedupe.
    pub async fn test_notify(&self, message: &str) -> Result<(), NotifyError> {
        self.core.dispatcher.send_message(message).await
    }

    /// Direct listing notification, bypassing dedupe.
    pub async fn notify_listing(&self, listing: &Listing) -> Result<(), NotifyError> {
        self.core.dispatcher.notify_listing(listing).await
    }
}

impl Core {
    async fn run_loop(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        info!("poll loop started");
        self.send_lifecycle_notice(&format!(
            "🚀 Marketplace monitor started\nKeywords: {}\nCheck interval: {}s",
            self.settings.criteria.keywords.join(", "),
            self.settings.check_interval.as_secs()
        ))
        .await;

        loop {
            if *stop_rx.borrow() {
                break;
            }
            let stats = self.run_cycle(Some(&mut stop_rx)).await;
            self.publish_stats(stats);

            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = sleep(self.settings.check_interval) => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // stop() owns the Stopped transition; it happens after this task is
        // joined, so status never reads Stopped while the loop still runs.
        self.send_lifecycle_notice("🛑 Marketplace monitor stopped")
            .await;
        info!("poll loop exited");
    }

    fn publish_stats(&self, stats: CycleStats) {
        self.shared
            .lock()
            .expect("state lock poisoned")
            .last_cycle = Some(stats);
    }

    /// One poll cycle: fetch with retries, dedupe against the seen store,
    /// notify new listings, run retention cleanup. Always returns stats;
    /// every failure is captured rather than propagated.
    async fn run_cycle(&self, cancel: Option<&mut watch::Receiver<bool>>) -> CycleStats {
        let started = Instant::now();
        let mut stats = CycleStats {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let listings = match self
            .fetch_with_retry(
                &self.settings.criteria,
                self.settings.max_listings,
                cancel,
                &mut stats,
            )
            .await
        {
            Ok(listings) => listings,
            Err(err) => {
                error!(?err, "all fetch attempts failed; ending cycle");
                stats.last_error = Some(format!("scrape: {err}"));
                stats.duration_ms = started.elapsed().as_millis() as u64;
                return stats;
            }
        };
        stats.fetched = listings.len();

        // Collapse duplicate identities within the batch, keeping source order.
        let mut batch_ids = HashSet::new();
        let unique: Vec<&Listing> = listings
            .iter()
            .filter(|l| batch_ids.insert(l.id.clone()))
            .collect();

        for listing in unique {
            match self.store.record_if_new(listing).await {
                Ok(true) => {
                    stats.new_listings += 1;
                    // The listing is already recorded; a delivery failure here
                    // must not trigger a duplicate on the next cycle.
                    match self.dispatcher.notify_listing(listing).await {
                        Ok(()) => stats.notified += 1,
                        Err(err) => {
                            warn!(?err, listing_id = %listing.id, "notification failed");
                            stats.notify_failures += 1;
                            stats.last_error = Some(format!("notify: {err}"));
                        }
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    error!(?err, "seen store failure; aborting dedupe for this cycle");
                    stats.storage_failures += 1;
                    stats.last_error = Some(format!("storage: {err}"));
                    stats.duration_ms = started.elapsed().as_millis() as u64;
                    return stats;
                }
            }
        }

        match self.store.cleanup(self.settings.retention).await {
            Ok(removed) if removed > 0 => info!(removed, "cleaned up expired seen records"),
            Ok(_) => {}
            Err(err) => {
                warn!(?err, "retention cleanup failed");
                stats.storage_failures += 1;
                stats.last_error = Some(format!("storage: {err}"));
            }
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        if stats.new_listings > 0 {
            info!(
                new = stats.new_listings,
                notified = stats.notified,
                "poll cycle found new listings"
            );
        }
        stats
    }

    /// Invoke the listing source with up to `max_retries` attempts separated
    /// by `retry_delay`. Retry sleeps are cancellation points when a stop
    /// receiver is supplied.
    async fn fetch_with_retry(
        &self,
        criteria: &Search,
        cap: usize,
        mut cancel: Option<&mut watch::Receiver<bool>>,
        stats: &mut CycleStats,
    ) -> Result<Vec<Listing>, ScrapeError> {
        let mut last_err = ScrapeError::Timeout;
        for attempt in 1..=self.settings.max_retries {
            match timeout(self.settings.attempt_timeout, self.source.search(criteria, cap)).await {
                Ok(Ok(listings)) => {
                    info!(count = listings.len(), attempt, "fetched listings");
                    return Ok(listings);
                }
                Ok(Err(err)) => {
                    warn!(?err, attempt, source = self.source.name(), "listing fetch failed");
                    stats.scrape_failures += 1;
                    last_err = err;
                }
                Err(_) => {
                    warn!(attempt, source = self.source.name(), "listing fetch timed out");
                    stats.scrape_failures += 1;
                    last_err = ScrapeError::Timeout;
                }
            }

            if attempt < self.settings.max_retries {
                match cancel.as_deref_mut() {
                    Some(rx) => {
                        tokio::select! {
                            _ = sleep(self.settings.retry_delay) => {}
                            _ = rx.changed() => {
                                if *rx.borrow() {
                                    return Err(ScrapeError::Cancelled);
                                }
                            }
                        }
                    }
                    None => sleep(self.settings.retry_delay).await,
                }
            }
        }
        Err(last_err)
    }

    async fn send_lifecycle_notice(&self, text: &str) {
        if let Err(err) = self.dispatcher.send_message(text).await {
            warn!(?err, "lifecycle notice failed");
        }
    }
}
