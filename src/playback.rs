//! deciding when a received event should be presented locally
pub mod scheduler;
