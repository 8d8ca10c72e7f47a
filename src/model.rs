use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the monitor scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Stopped,
    Running,
    Stopping,
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Stopped => "stopped",
            MonitorState::Running => "running",
            MonitorState::Stopping => "stopping",
        }
    }
}

/// One marketplace listing as observed from the source. Identity is `id`;
/// two observations with the same id are the same entity even if price or
/// description drifted between fetches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Listing {
    pub id: String,
    pub title: String,
    pub price: String,
    pub location: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Persisted snapshot of a listing at first observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeenRecord {
    pub listing: Listing,
    pub first_seen_at: DateTime<Utc>,
}

/// Summary of the most recent poll cycle. Replaced wholesale each cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleStats {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub fetched: usize,
    pub new_listings: usize,
    pub notified: usize,
    pub scrape_failures: u32,
    pub notify_failures: u32,
    pub storage_failures: u32,
    pub last_error: Option<String>,
}

/// Snapshot returned by `Monitor::status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: MonitorState,
    pub last_cycle: Option<CycleStats>,
    pub tracked_listings: i64,
}

/// One result of an ad-hoc search: the listing plus whether the seen store
/// already knows its identity.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub listing: Listing,
    pub is_new: bool,
}
