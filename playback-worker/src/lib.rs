pub mod config;
pub mod controller;
pub mod cursor;
pub mod error;
pub mod metrics_consts;
pub mod processor;
pub mod stream;
pub mod worker;
