pub mod batch;
pub mod config;
pub mod db;
pub mod engine;
pub mod geo;
pub mod index;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod rank;
pub mod scheduler;
pub mod time;
pub mod wal;
