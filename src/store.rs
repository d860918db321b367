//! In-memory station store

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{RawStation, StationId, StationPatch, StationRecord, StationStatus};

struct Slot {
    record: StationRecord,
    /// Bumped by every location patch, used to discard stale address lookups
    revision: u64,
    /// Set once the station has received a live update
    live: bool,
}

impl Slot {
    fn new(record: StationRecord) -> Self {
        Self {
            record,
            revision: 0,
            live: false,
        }
    }

    /// Lay the fields a live slot has received over this one
    fn overlay(&mut self, live: Slot) {
        let newer = live.record;
        let record = &mut self.record;

        if newer.status != StationStatus::unreported() {
            record.status = newer.status;
        }
        record.last_seen = newer.last_seen;

        if live.revision > 0 {
            record.latitude = newer.latitude;
            record.longitude = newer.longitude;
            record.assigned_latitude = newer.assigned_latitude;
            record.assigned_longitude = newer.assigned_longitude;
            record.allowed_radius_meters = newer.allowed_radius_meters;
            record.distance_meters = newer.distance_meters;
            record.live_address = newer.live_address;
            record.assigned_address = newer.assigned_address;
        }

        self.revision = live.revision;
        self.live = true;
    }
}

/// Canonical mapping of station id to record.
///
/// Records keep their first-seen order; nothing is ever removed.
#[derive(Default)]
pub struct StationStore {
    slots: Vec<Slot>,
    index: HashMap<StationId, usize>,
}

impl StationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the store contents with a snapshot.
    ///
    /// Live updates are newer than anything the snapshot can carry, so a
    /// station that already received one keeps its reported status and
    /// lastSeen on top of the snapshot record, plus its position and
    /// geofence once a location patch has been applied. Returns the number
    /// of stations held afterwards.
    pub fn load_snapshot(&mut self, stations: Vec<RawStation>) -> usize {
        let live: Vec<Slot> = self.slots.drain(..).filter(|slot| slot.live).collect();
        self.index.clear();

        for raw in stations {
            self.upsert(Slot::new(StationRecord::from(raw)));
        }
        for slot in live {
            match self.index.get(&slot.record.station_id) {
                Some(&position) => self.slots[position].overlay(slot),
                None => {
                    self.upsert(slot);
                }
            }
        }

        self.slots.len()
    }

    /// Merge a patch into a station, creating it on first sight.
    ///
    /// Returns the station's location revision after the merge.
    pub fn apply_update(
        &mut self,
        station_id: &StationId,
        patch: &StationPatch,
        now: DateTime<Utc>,
    ) -> u64 {
        let position = match self.index.get(station_id) {
            Some(&position) => position,
            None => {
                debug!("New station {}", station_id);
                self.upsert(Slot::new(StationRecord::new(station_id.clone())))
            }
        };

        let slot = &mut self.slots[position];
        slot.record.apply(patch, now);
        slot.live = true;
        if let StationPatch::Location(_) = patch {
            slot.revision += 1;
        }
        slot.revision
    }

    /// Store resolved addresses for a station.
    ///
    /// Ignored when the station is unknown or its position changed since the
    /// lookup was requested at `revision`. Returns whether the record changed.
    pub fn apply_address_resolution(
        &mut self,
        station_id: &StationId,
        live_address: String,
        assigned_address: String,
        revision: u64,
    ) -> bool {
        let Some(&position) = self.index.get(station_id) else {
            return false;
        };

        let slot = &mut self.slots[position];
        if slot.revision != revision {
            debug!(
                "Discarding stale addresses for {} (revision {} < {})",
                station_id, revision, slot.revision
            );
            return false;
        }

        slot.record.live_address = live_address;
        slot.record.assigned_address = assigned_address;
        true
    }

    /// Demote a station to OFFLINE, leaving every other field untouched.
    ///
    /// Returns whether the status changed.
    pub fn mark_offline(&mut self, station_id: &StationId) -> bool {
        let Some(&position) = self.index.get(station_id) else {
            return false;
        };

        let record = &mut self.slots[position].record;
        if record.status == StationStatus::Offline {
            return false;
        }
        record.status = StationStatus::Offline;
        true
    }

    pub fn get(&self, station_id: &StationId) -> Option<&StationRecord> {
        self.index
            .get(station_id)
            .map(|&position| &self.slots[position].record)
    }

    /// Location revision of a station
    pub fn revision(&self, station_id: &StationId) -> Option<u64> {
        self.index
            .get(station_id)
            .map(|&position| self.slots[position].revision)
    }

    /// Records in first-seen order
    pub fn records(&self) -> impl Iterator<Item = &StationRecord> {
        self.slots.iter().map(|slot| &slot.record)
    }

    pub fn get_all(&self) -> Vec<StationRecord> {
        self.records().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn upsert(&mut self, slot: Slot) -> usize {
        match self.index.get(&slot.record.station_id) {
            Some(&position) => {
                self.slots[position] = slot;
                position
            }
            None => {
                let position = self.slots.len();
                self.index.insert(slot.record.station_id.clone(), position);
                self.slots.push(slot);
                position
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LocationFix, RESOLVING_ADDRESS};
    use chrono::Duration;

    fn id(value: &str) -> StationId {
        StationId::try_from(value).unwrap()
    }

    fn raw(station_id: &str, status: &str) -> RawStation {
        serde_json::from_value(serde_json::json!({
            "station_id": station_id,
            "latitude": 16.7,
            "longitude": 74.2,
            "status": status,
        }))
        .unwrap()
    }

    fn fix(lat: f64, status: StationStatus) -> StationPatch {
        StationPatch::Location(LocationFix {
            latitude: Some(lat),
            longitude: Some(74.2),
            status: Some(status),
            distance: Some(lat),
            assigned_latitude: Some(16.0),
            assigned_longitude: Some(74.0),
            allowed_radius_meters: Some(50.0),
        })
    }

    #[test]
    fn last_update_wins() {
        let mut store = StationStore::new();
        let station = id("7101");
        let start = Utc::now();

        store.apply_update(&station, &fix(16.1, StationStatus::Inside), start);
        store.apply_update(
            &station,
            &fix(16.2, StationStatus::Outside),
            start + Duration::seconds(5),
        );
        let last = start + Duration::seconds(9);
        store.apply_update(&station, &fix(16.3, StationStatus::Inside), last);

        let record = store.get(&station).unwrap();
        assert_eq!(record.latitude, Some(16.3));
        assert_eq!(record.distance_meters, Some(16.3));
        assert_eq!(record.status, StationStatus::Inside);
        assert_eq!(record.last_seen, Some(last));
        assert_eq!(record.live_address, RESOLVING_ADDRESS);
        assert_eq!(store.len(), 1);
        assert_eq!(store.revision(&station), Some(3));
    }

    #[test]
    fn snapshot_replaces_contents() {
        let mut store = StationStore::new();
        assert_eq!(store.load_snapshot(vec![raw("7101", "INSIDE"), raw("7205", "")]), 2);
        assert_eq!(store.get(&id("7205")).unwrap().status, StationStatus::Offline);

        assert_eq!(store.load_snapshot(vec![raw("7301", "OUTSIDE")]), 1);
        assert!(store.get(&id("7101")).is_none());
        assert_eq!(store.get_all()[0].station_id, id("7301"));
    }

    #[test]
    fn snapshot_keeps_live_records() {
        let mut store = StationStore::new();
        let now = Utc::now();
        store.apply_update(&id("7205"), &fix(17.0, StationStatus::Outside), now);

        store.load_snapshot(vec![raw("7101", "INSIDE"), raw("7205", "INSIDE")]);

        let ids: Vec<_> = store.records().map(|r| r.station_id.as_str()).collect();
        assert_eq!(ids, vec!["7101", "7205"]);
        let live = store.get(&id("7205")).unwrap();
        assert_eq!(live.status, StationStatus::Outside);
        assert_eq!(live.latitude, Some(17.0));
    }

    #[test]
    fn snapshot_fills_in_position_for_status_only_station() {
        let mut store = StationStore::new();
        let now = Utc::now();
        store.apply_update(&id("7101"), &StationPatch::Status(StationStatus::Inside), now);

        let snapshot: RawStation = serde_json::from_value(serde_json::json!({
            "station_id": "7101",
            "latitude": 16.7,
            "longitude": 74.2,
            "assigned_latitude": 16.69,
            "assigned_longitude": 74.21,
            "allowed_radius_meters": 50,
            "distance_meters": 12.0,
            "status": "OFFLINE",
        }))
        .unwrap();
        store.load_snapshot(vec![snapshot]);

        let record = store.get(&id("7101")).unwrap();
        assert_eq!(record.status, StationStatus::Inside);
        assert_eq!(record.last_seen, Some(now));
        assert_eq!(record.latitude, Some(16.7));
        assert_eq!(record.assigned_latitude, Some(16.69));
        assert_eq!(record.allowed_radius_meters, Some(50.0));
        assert_eq!(record.distance_meters, Some(12.0));
        assert_eq!(store.revision(&id("7101")), Some(0));
    }

    #[test]
    fn status_patch_keeps_position_and_revision() {
        let mut store = StationStore::new();
        let station = id("7101");
        let now = Utc::now();
        let revision = store.apply_update(&station, &fix(16.5, StationStatus::Inside), now);

        let later = now + Duration::seconds(3);
        let after = store.apply_update(
            &station,
            &StationPatch::Status(StationStatus::Outside),
            later,
        );

        assert_eq!(revision, after);
        let record = store.get(&station).unwrap();
        assert_eq!(record.status, StationStatus::Outside);
        assert_eq!(record.latitude, Some(16.5));
        assert_eq!(record.last_seen, Some(later));
    }

    #[test]
    fn stale_address_resolution_is_discarded() {
        let mut store = StationStore::new();
        let station = id("7101");
        let now = Utc::now();
        let old = store.apply_update(&station, &fix(16.1, StationStatus::Inside), now);
        let new = store.apply_update(&station, &fix(16.2, StationStatus::Inside), now);

        assert!(store.apply_address_resolution(&station, "new".into(), "depot".into(), new));
        assert!(!store.apply_address_resolution(&station, "old".into(), "depot".into(), old));

        let record = store.get(&station).unwrap();
        assert_eq!(record.live_address, "new");
        assert_eq!(record.assigned_address, "depot");
        assert_eq!(record.latitude, Some(16.2));
    }

    #[test]
    fn address_resolution_for_unknown_station_is_ignored() {
        let mut store = StationStore::new();
        assert!(!store.apply_address_resolution(&id("7101"), "a".into(), "b".into(), 0));
        assert!(store.is_empty());
    }

    #[test]
    fn mark_offline_only_touches_status() {
        let mut store = StationStore::new();
        let station = id("7101");
        let now = Utc::now();
        store.apply_update(&station, &fix(16.1, StationStatus::Outside), now);

        assert!(store.mark_offline(&station));
        assert!(!store.mark_offline(&station));
        assert!(!store.mark_offline(&id("9999")));

        let record = store.get(&station).unwrap();
        assert_eq!(record.status, StationStatus::Offline);
        assert_eq!(record.latitude, Some(16.1));
        assert_eq!(record.last_seen, Some(now));
    }
}
