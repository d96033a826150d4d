mod connection;
pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::EventStore;
pub use models::{EventPage, EventQuery, EventStats, RecordOutcome, SortOrder, VehicleEvent};
