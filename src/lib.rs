//! Safety core for lone workers: position tracking and alert lifecycle

pub mod clock;
pub mod config;
pub mod database;
pub mod dispatch;
pub mod errors;
pub mod geo;
pub mod lifecycle;
pub mod models;
pub mod mqtt;
pub mod platform;
pub mod store;
pub mod tracker;
