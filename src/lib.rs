pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod store;
pub mod utils;
