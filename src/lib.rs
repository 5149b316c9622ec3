pub mod config;
pub mod engine;
pub mod fees;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod station;
pub mod sweeper;
pub mod wal;
