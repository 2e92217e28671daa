pub mod batching;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod health_store;
pub mod models;
pub mod progress;
pub mod protocol;
pub mod retry;
pub mod sensor;
pub mod transport;
