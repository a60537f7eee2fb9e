pub mod app;
pub mod config;
pub mod error;
pub mod gate;
pub mod listener;
pub mod messaging;
pub mod metrics;
