pub mod config;
pub mod dead_letter;
pub mod event;
pub mod kafka;
pub mod metrics;
pub mod retry;
pub mod store;
pub mod time;
pub mod validation;
