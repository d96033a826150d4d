pub mod vehicle_event;

pub use vehicle_event::{EventPage, EventQuery, EventStats, RecordOutcome, SortOrder, VehicleEvent};
