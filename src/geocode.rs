//! Reverse geocoding cache
//!
//! Lookups are keyed by coordinates rounded to four decimal places, so a
//! stationary station pinging from the same spot reuses a single request.
//! Concurrent requests for the same key share one in-flight lookup.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::{errors::CommandCenterError, models::UNKNOWN_LOCATION};

/// Provider turning a coordinate pair into a display address
pub trait ReverseGeocoder: Send + Sync + 'static {
    fn reverse_geocode(
        &self,
        lat: f64,
        lng: f64,
    ) -> impl Future<Output = Result<String, CommandCenterError>> + Send;
}

/// Coordinate pair rounded to four decimals (about 11 m)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoordinateKey {
    lat: i64,
    lng: i64,
}

impl CoordinateKey {
    const SCALE: f64 = 10_000.0;

    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat: (lat * Self::SCALE).round() as i64,
            lng: (lng * Self::SCALE).round() as i64,
        }
    }
}

pub struct AddressResolutionCache<G> {
    geocoder: G,
    entries: Mutex<LruCache<CoordinateKey, Arc<OnceCell<String>>>>,
}

impl<G: ReverseGeocoder> AddressResolutionCache<G> {
    pub fn new(geocoder: G, capacity: NonZeroUsize) -> Self {
        Self {
            geocoder,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Resolve a coordinate pair to an address.
    ///
    /// Absent or zero coordinates resolve to an empty string without a
    /// lookup. A failed lookup resolves to [`UNKNOWN_LOCATION`], which is
    /// cached like any other result.
    pub async fn resolve(&self, lat: Option<f64>, lng: Option<f64>) -> String {
        let (lat, lng) = match (lat, lng) {
            (Some(lat), Some(lng)) if is_present(lat) && is_present(lng) => (lat, lng),
            _ => return String::new(),
        };

        let key = CoordinateKey::new(lat, lng);
        let cell = {
            let mut entries = self.entries.lock().await;
            Arc::clone(entries.get_or_insert(key, || Arc::new(OnceCell::new())))
        };

        cell.get_or_init(|| async {
            debug!("Reverse geocoding {:.4},{:.4}", lat, lng);
            match self.geocoder.reverse_geocode(lat, lng).await {
                Ok(address) => address,
                Err(e) => {
                    warn!("Reverse geocoding {:.4},{:.4} failed: {}", lat, lng, e);
                    UNKNOWN_LOCATION.to_string()
                }
            }
        })
        .await
        .clone()
    }

    /// Number of cached coordinate keys, including in-flight ones
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

fn is_present(value: f64) -> bool {
    value.is_finite() && value != 0.0
}
