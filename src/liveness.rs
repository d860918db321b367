//! Liveness supervision
//!
//! Every station has at most one pending deadline. An accepted update
//! replaces the deadline; a deadline that runs out demotes the station to
//! OFFLINE. All deadlines live in a single keyed delay queue driven by the
//! ingestor loop.

use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::time::{delay_queue::Key, DelayQueue};

use crate::models::StationId;

pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(120);

pub struct LivenessSupervisor {
    timeout: Duration,
    queue: DelayQueue<StationId>,
    keys: HashMap<StationId, Key>,
}

impl LivenessSupervisor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            queue: DelayQueue::new(),
            keys: HashMap::new(),
        }
    }

    /// Silence window after which a station is considered offline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Restart the silence window of a station
    pub fn touch(&mut self, station_id: &StationId) {
        self.schedule_at(station_id, Instant::now() + self.timeout);
    }

    /// Replace the deadline of a station
    pub fn schedule_at(&mut self, station_id: &StationId, deadline: Instant) {
        match self.keys.get(station_id) {
            Some(key) => self.queue.reset_at(key, deadline),
            None => {
                let key = self.queue.insert_at(station_id.clone(), deadline);
                self.keys.insert(station_id.clone(), key);
            }
        }
    }

    pub fn cancel(&mut self, station_id: &StationId) -> bool {
        match self.keys.remove(station_id) {
            Some(key) => {
                self.queue.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, station_id: &StationId) -> bool {
        self.keys.contains_key(station_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.keys.clear();
    }

    /// Wait for the next station whose window ran out.
    ///
    /// Never completes while nothing is scheduled.
    pub async fn next_expired(&mut self) -> StationId {
        loop {
            match poll_fn(|cx| self.queue.poll_expired(cx)).await {
                Some(expired) => {
                    let station_id = expired.into_inner();
                    self.keys.remove(&station_id);
                    return station_id;
                }
                None => std::future::pending::<()>().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    fn id(value: &str) -> StationId {
        StationId::try_from(value).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_timeout() {
        let mut supervisor = LivenessSupervisor::new(DEFAULT_LIVENESS_TIMEOUT);
        let start = Instant::now();
        supervisor.touch(&id("7101"));

        let expired = supervisor.next_expired().await;

        assert_eq!(expired, id("7101"));
        assert!(start.elapsed() >= DEFAULT_LIVENESS_TIMEOUT);
        assert!(supervisor.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_restarts_window() {
        let mut supervisor = LivenessSupervisor::new(DEFAULT_LIVENESS_TIMEOUT);
        let start = Instant::now();
        supervisor.touch(&id("7101"));

        advance(Duration::from_secs(100)).await;
        supervisor.touch(&id("7101"));
        assert_eq!(supervisor.len(), 1);

        let expired = supervisor.next_expired().await;
        assert_eq!(expired, id("7101"));
        assert!(start.elapsed() >= Duration::from_secs(220));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_window() {
        let mut supervisor = LivenessSupervisor::new(Duration::from_secs(10));
        for _ in 0..3 {
            supervisor.touch(&id("7101"));
        }

        assert_eq!(supervisor.next_expired().await, id("7101"));
        assert!(timeout(Duration::from_secs(60), supervisor.next_expired())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_deadline_never_fires() {
        let mut supervisor = LivenessSupervisor::new(Duration::from_secs(10));
        supervisor.touch(&id("7101"));
        supervisor.touch(&id("7205"));

        assert!(supervisor.cancel(&id("7101")));
        assert!(!supervisor.cancel(&id("7101")));
        assert!(!supervisor.is_pending(&id("7101")));

        assert_eq!(supervisor.next_expired().await, id("7205"));
        assert!(timeout(Duration::from_secs(60), supervisor.next_expired())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadlines_fire_in_order() {
        let mut supervisor = LivenessSupervisor::new(Duration::from_secs(120));
        let now = Instant::now();
        supervisor.schedule_at(&id("7205"), now + Duration::from_secs(30));
        supervisor.schedule_at(&id("7101"), now);

        assert_eq!(supervisor.next_expired().await, id("7101"));
        assert_eq!(supervisor.next_expired().await, id("7205"));
    }
}
