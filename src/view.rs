//! Derived views over the station store
//!
//! Pure functions: nothing here mutates the store, so the projections can be
//! recomputed as often as the presentation layer likes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::StationRecord;

/// District selector value that disables district filtering
pub const ALL_DISTRICTS: &str = "ALL";

/// Aggregate counters over every station in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StationStats {
    pub total: usize,
    /// Stations heard from within the liveness window
    pub online: usize,
    pub inside: usize,
    pub outside: usize,
    pub offline: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DistrictFilter {
    #[default]
    All,
    Code(String),
}

impl From<&str> for DistrictFilter {
    fn from(value: &str) -> Self {
        if value == ALL_DISTRICTS {
            DistrictFilter::All
        } else {
            DistrictFilter::Code(value.to_string())
        }
    }
}

/// Free-text search plus district selection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ViewFilter {
    search: String,
    district: DistrictFilter,
}

impl ViewFilter {
    pub fn new(search: &str, district: &str) -> Self {
        Self {
            search: search.to_lowercase(),
            district: DistrictFilter::from(district),
        }
    }

    /// Filter that lets every station through
    pub fn all() -> Self {
        Self::default()
    }

    pub fn district(&self) -> &DistrictFilter {
        &self.district
    }

    pub fn matches(&self, record: &StationRecord) -> bool {
        let matches_search = self.search.is_empty()
            || record
                .station_id
                .as_str()
                .to_lowercase()
                .contains(&self.search);

        let matches_district = match &self.district {
            DistrictFilter::All => true,
            DistrictFilter::Code(code) => record.district_code() == code,
        };

        matches_search && matches_district
    }
}

/// Everything the presentation layer renders
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationView {
    pub records: Vec<StationRecord>,
    pub stats: StationStats,
    pub connected: bool,
    pub last_error: Option<String>,
}

/// Count stations by status and by recent activity.
///
/// `online` looks at `last_seen` rather than `status`, so it can run ahead
/// of the status counters until the liveness supervisor catches up.
pub fn compute_stats<'a>(
    records: impl IntoIterator<Item = &'a StationRecord>,
    now: DateTime<Utc>,
    window: Duration,
) -> StationStats {
    use crate::models::StationStatus::*;

    let mut stats = StationStats::default();
    for record in records {
        stats.total += 1;
        if is_online(record, now, window) {
            stats.online += 1;
        }
        match record.status {
            Inside => stats.inside += 1,
            Outside => stats.outside += 1,
            Offline => stats.offline += 1,
            Other(_) => {}
        }
    }
    stats
}

/// Filter and order stations for display.
///
/// Ordering is by status priority, OUTSIDE first, then OFFLINE, then INSIDE,
/// then anything else. The sort is stable so ties keep store order.
pub fn compute_view<'a>(
    records: impl IntoIterator<Item = &'a StationRecord>,
    filter: &ViewFilter,
) -> Vec<StationRecord> {
    let mut view: Vec<StationRecord> = records
        .into_iter()
        .filter(|record| filter.matches(record))
        .cloned()
        .collect();
    view.sort_by_key(|record| record.status.priority());
    view
}

fn is_online(record: &StationRecord, now: DateTime<Utc>, window: Duration) -> bool {
    match record.last_seen {
        // Timestamps from the future count as fresh
        Some(last_seen) => now
            .signed_duration_since(last_seen)
            .to_std()
            .map_or(true, |age| age < window),
        None => false,
    }
}
