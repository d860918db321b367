//! Live status board for field stations
//!
//! Seeds an in-memory store from the dashboard snapshot, keeps it current
//! from the MQTT event channel, marks silent stations offline and resolves
//! coordinates to addresses in the background.

pub mod api;
pub mod config;
pub mod errors;
pub mod geocode;
pub mod ingestor;
pub mod liveness;
pub mod models;
pub mod mqtt;
pub mod store;
pub mod view;
