pub mod clock;
pub mod config;
pub mod engine;
pub mod identity;
pub mod jobs;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;
