//! Data models.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};

use crate::errors::CommandCenterError;
use serde_helpers::*;

/// Address shown while a lookup for a fresh record is in flight
pub const RESOLVING_ADDRESS: &str = "Resolving...";

/// Address cached for coordinates the geocoder could not resolve
pub const UNKNOWN_LOCATION: &str = "Unknown location";

/// Station identifier
///
/// Stable, non-empty string. The first two characters encode the district
/// the station belongs to, e.g. `7205` is in district `72`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StationId(String);

impl TryFrom<&str> for StationId {
    type Error = CommandCenterError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl TryFrom<String> for StationId {
    type Error = CommandCenterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(CommandCenterError::InvalidStationId(value));
        }
        Ok(Self(value))
    }
}

impl StationId {
    /// Get the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// District code, the first two characters of the identifier
    pub fn district_code(&self) -> &str {
        match self.0.char_indices().nth(2) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Geofence and liveness status of a station
///
/// Values outside the known set are kept verbatim so they can be displayed,
/// and sort after every known status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StationStatus {
    Inside,
    Outside,
    Offline,
    Other(String),
}

impl StationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            StationStatus::Inside => "INSIDE",
            StationStatus::Outside => "OUTSIDE",
            StationStatus::Offline => "OFFLINE",
            StationStatus::Other(value) => value,
        }
    }

    /// Display priority: stations outside their geofence first, then
    /// offline stations, then compliant ones.
    pub fn priority(&self) -> u8 {
        match self {
            StationStatus::Outside => 1,
            StationStatus::Offline => 2,
            StationStatus::Inside => 3,
            StationStatus::Other(_) => 4,
        }
    }

    /// Placeholder for a station that has not reported any status yet.
    /// Counts in no status bucket and sorts last.
    pub fn unreported() -> Self {
        StationStatus::Other(String::new())
    }
}

impl From<String> for StationStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "INSIDE" => StationStatus::Inside,
            "OUTSIDE" => StationStatus::Outside,
            "OFFLINE" => StationStatus::Offline,
            _ => StationStatus::Other(value),
        }
    }
}

impl From<StationStatus> for String {
    fn from(value: StationStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Station as returned by the snapshot endpoint
///
/// Coordinates are accepted both as JSON numbers and as numeric strings.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawStation {
    #[serde(deserialize_with = "deserialize_station_id")]
    pub station_id: StationId,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub latitude: Option<f64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub longitude: Option<f64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub assigned_latitude: Option<f64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub assigned_longitude: Option<f64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub allowed_radius_meters: Option<f64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub distance_meters: Option<f64>,
    /// Missing, null and empty statuses all mean OFFLINE
    #[serde(
        default = "default_status",
        deserialize_with = "deserialize_status_or_offline"
    )]
    pub status: StationStatus,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Fields carried by a `locationUpdate` event
#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocationFix {
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub latitude: Option<f64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub longitude: Option<f64>,
    /// None when the event carries no usable status
    #[serde(default, deserialize_with = "deserialize_optional_status")]
    pub status: Option<StationStatus>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub distance: Option<f64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub assigned_latitude: Option<f64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub assigned_longitude: Option<f64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub allowed_radius_meters: Option<f64>,
}

/// `locationUpdate` event payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    #[serde(deserialize_with = "deserialize_station_id")]
    pub station_id: StationId,
    #[serde(flatten)]
    pub fix: LocationFix,
}

/// `statusUpdate` event payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(deserialize_with = "deserialize_station_id")]
    pub station_id: StationId,
    pub status: StationStatus,
}

/// Partial write applied to a station record
#[derive(Debug, Clone, PartialEq)]
pub enum StationPatch {
    /// Replaces position, geofence and (when present) status
    Location(LocationFix),
    /// Replaces status only
    Status(StationStatus),
}

/// Signals and events delivered by the push channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    /// The channel refused our credentials and will not reconnect
    Rejected(String),
    LocationUpdate(LocationUpdate),
    StatusUpdate(StatusUpdate),
}

/// Canonical per-station state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationRecord {
    pub station_id: StationId,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub assigned_latitude: Option<f64>,
    pub assigned_longitude: Option<f64>,
    pub allowed_radius_meters: Option<f64>,
    pub distance_meters: Option<f64>,
    pub status: StationStatus,
    pub live_address: String,
    pub assigned_address: String,
    /// Time of the last accepted update, serialized as epoch millis
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl StationRecord {
    /// Empty record for a station seen for the first time, with no
    /// status until one is reported
    pub fn new(station_id: StationId) -> Self {
        Self {
            station_id,
            latitude: None,
            longitude: None,
            assigned_latitude: None,
            assigned_longitude: None,
            allowed_radius_meters: None,
            distance_meters: None,
            status: StationStatus::unreported(),
            live_address: String::new(),
            assigned_address: String::new(),
            last_seen: None,
        }
    }

    pub fn district_code(&self) -> &str {
        self.station_id.district_code()
    }

    /// Merge a patch into this record.
    ///
    /// Addresses are left alone, except that blank ones are marked as
    /// resolving when the position changes.
    pub fn apply(&mut self, patch: &StationPatch, now: DateTime<Utc>) {
        match patch {
            StationPatch::Location(fix) => {
                self.latitude = fix.latitude;
                self.longitude = fix.longitude;
                self.distance_meters = fix.distance;
                self.assigned_latitude = fix.assigned_latitude;
                self.assigned_longitude = fix.assigned_longitude;
                self.allowed_radius_meters = fix.allowed_radius_meters;
                if let Some(status) = &fix.status {
                    self.status = status.clone();
                }
                if self.live_address.is_empty() {
                    self.live_address = RESOLVING_ADDRESS.to_string();
                }
                if self.assigned_address.is_empty() {
                    self.assigned_address = RESOLVING_ADDRESS.to_string();
                }
            }
            StationPatch::Status(status) => {
                self.status = status.clone();
            }
        }
        self.last_seen = Some(now);
    }
}

impl From<RawStation> for StationRecord {
    fn from(raw: RawStation) -> Self {
        Self {
            station_id: raw.station_id,
            latitude: raw.latitude,
            longitude: raw.longitude,
            assigned_latitude: raw.assigned_latitude,
            assigned_longitude: raw.assigned_longitude,
            allowed_radius_meters: raw.allowed_radius_meters,
            distance_meters: raw.distance_meters,
            status: raw.status,
            live_address: String::new(),
            assigned_address: String::new(),
            last_seen: raw.updated_at,
        }
    }
}

/// Human readable name of a district code
pub fn district_name(code: &str) -> Option<&'static str> {
    let name = match code {
        "71" => "Kolhapur",
        "72" => "Ratnagiri",
        "73" => "Sindhudurg",
        "74" => "Raigad",
        "75" => "Thane",
        "76" => "Palghar",
        "77" => "Nashik",
        "78" => "Dhule",
        "79" => "Nandurbar",
        "80" => "Jalgaon",
        "81" => "Wardha",
        "82" => "Gondia",
        "83" => "Gadchiroli",
        "84" => "Bhandara",
        "85" => "Washim",
        "86" => "Hingoli",
        "87" => "Jalna",
        "88" => "Ahilyanagar",
        _ => return None,
    };
    Some(name)
}

/// Custom deserializers
mod serde_helpers {
    use super::{StationId, StationStatus};
    use serde::{self, de::Error, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(u64),
    }

    /// Station ids arrive as strings or as bare integers
    pub fn deserialize_station_id<'de, D>(deserializer: D) -> Result<StationId, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = match RawId::deserialize(deserializer)? {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        };
        StationId::try_from(value).map_err(D::Error::custom)
    }

    pub fn default_status() -> StationStatus {
        StationStatus::Offline
    }

    pub fn deserialize_status_or_offline<'de, D>(
        deserializer: D,
    ) -> Result<StationStatus, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(deserialize_optional_status(deserializer)?.unwrap_or(StationStatus::Offline))
    }

    pub fn deserialize_optional_status<'de, D>(
        deserializer: D,
    ) -> Result<Option<StationStatus>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<String> = Option::deserialize(deserializer)?;
        Ok(value
            .filter(|s| !s.trim().is_empty())
            .map(StationStatus::from))
    }
}
